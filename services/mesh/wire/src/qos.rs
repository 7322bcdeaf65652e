//! Link-quality reports exchanged between neighbors.
//!
//! Reports are fire-and-forget: there is no acknowledgement or retry, a lost
//! report only means the next one arrives later.

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::header::{MessageType, NodeId, BROADCAST_NODE_ID};
use crate::payload::{AdvInfo, FixedPayload};
use crate::WireError;

/// Number of neighbor slots in a connection report
pub const QOS_SLOTS: usize = 4;

/// QOS_REQUEST: asks a neighbor for its link quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosRequest {
    /// Node that should answer, or the broadcast id
    pub node_id: NodeId,
    /// Requested report kind
    pub kind: u8,
}

impl QosRequest {
    /// Whether `node_id` is expected to answer this request
    pub fn is_addressed_to(&self, node_id: NodeId) -> bool {
        self.node_id == node_id || self.node_id == BROADCAST_NODE_ID
    }
}

impl FixedPayload for QosRequest {
    const SIZE: usize = 3;
    const NAME: &'static str = "QOS_REQUEST";

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.node_id);
        buf.put_u8(self.kind);
    }

    fn decode_unchecked<B: Buf>(buf: &mut B) -> Self {
        Self {
            node_id: buf.get_u16_le(),
            kind: buf.get_u8(),
        }
    }
}

/// QOS_CONNECTION_DATA: up to four neighbors and the RSSI seen from each
///
/// Unused slots carry partner id 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QosConnectionData {
    /// Neighbor node ids
    pub partners: [NodeId; QOS_SLOTS],
    /// RSSI per neighbor in dBm
    pub rssi: [i8; QOS_SLOTS],
}

impl QosConnectionData {
    /// Build a report from at most four `(neighbor, rssi)` pairs
    pub fn from_entries(entries: &[(NodeId, i8)]) -> Result<Self, WireError> {
        if entries.len() > QOS_SLOTS {
            return Err(WireError::PayloadTooLarge {
                size: entries.len(),
                max: QOS_SLOTS,
            });
        }

        let mut report = Self::default();
        for (slot, &(partner, rssi)) in entries.iter().enumerate() {
            report.partners[slot] = partner;
            report.rssi[slot] = rssi;
        }
        Ok(report)
    }

    /// Occupied slots as `(neighbor, rssi)` pairs
    pub fn entries(&self) -> impl Iterator<Item = (NodeId, i8)> + '_ {
        self.partners
            .iter()
            .zip(self.rssi.iter())
            .filter(|(partner, _)| **partner != BROADCAST_NODE_ID)
            .map(|(partner, rssi)| (*partner, *rssi))
    }
}

impl FixedPayload for QosConnectionData {
    const SIZE: usize = 12;
    const NAME: &'static str = "QOS_CONNECTION_DATA";

    fn encode<B: BufMut>(&self, buf: &mut B) {
        for partner in self.partners {
            buf.put_u16_le(partner);
        }
        for rssi in self.rssi {
            buf.put_i8(rssi);
        }
    }

    fn decode_unchecked<B: Buf>(buf: &mut B) -> Self {
        let mut report = Self::default();
        for partner in report.partners.iter_mut() {
            *partner = buf.get_u16_le();
        }
        for rssi in report.rssi.iter_mut() {
            *rssi = buf.get_i8();
        }
        report
    }
}

/// A decoded telemetry message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosReport {
    /// Neighbor asks for a connection report
    Request(QosRequest),
    /// Neighbor's connection report
    ConnectionData(QosConnectionData),
    /// Advertising statistics forwarded by a neighbor
    AdvInfo(AdvInfo),
}

impl QosReport {
    /// Decode a telemetry payload; `None` if the type is not a report
    pub fn decode(message_type: MessageType, payload: &[u8]) -> Option<Result<Self, WireError>> {
        let report = match message_type {
            MessageType::QosRequest => QosRequest::decode(payload).map(QosReport::Request),
            MessageType::QosConnectionData => {
                QosConnectionData::decode(payload).map(QosReport::ConnectionData)
            }
            MessageType::AdvInfo => AdvInfo::decode(payload).map(QosReport::AdvInfo),
            _ => return None,
        };
        Some(report)
    }

    /// Message type this report travels as
    pub fn message_type(&self) -> MessageType {
        match self {
            QosReport::Request(_) => MessageType::QosRequest,
            QosReport::ConnectionData(_) => MessageType::QosConnectionData,
            QosReport::AdvInfo(_) => MessageType::AdvInfo,
        }
    }

    /// Encode the report payload
    pub fn to_bytes(&self) -> Bytes {
        match self {
            QosReport::Request(request) => request.to_bytes(),
            QosReport::ConnectionData(data) => data.to_bytes(),
            QosReport::AdvInfo(info) => info.to_bytes(),
        }
    }
}
