//! Payload layouts for the cluster handshake, module requests, and user data.
//!
//! All fixed layouts are byte-packed little-endian structures. Decoding
//! accepts trailing bytes after a fixed layout and ignores them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::header::PACKET_HEADER_SIZE;
use crate::WireError;

/// Cluster identifier
pub type ClusterId = u32;

/// Signed cluster size, size delta, or hop count
pub type ClusterSize = i16;

/// Hop count meaning "no path to a sink is known"
pub const NO_SINK: ClusterSize = -1;

/// A payload with a fixed byte layout
pub trait FixedPayload: Sized {
    /// Encoded size in bytes
    const SIZE: usize;
    /// Name used in error reports
    const NAME: &'static str;

    /// Write the payload
    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Read the payload; the caller guarantees `SIZE` bytes are available
    fn decode_unchecked<B: Buf>(buf: &mut B) -> Self;

    /// Decode from a payload buffer, checking its length
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < Self::SIZE {
            return Err(WireError::MalformedPayload {
                payload: Self::NAME,
                needed: Self::SIZE,
                got: payload.len(),
            });
        }
        Ok(Self::decode_unchecked(&mut &payload[..]))
    }

    /// Encode into a fresh buffer
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// CLUSTER_WELCOME: announces the sender's cluster on a new link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterWelcome {
    /// Sender's cluster
    pub cluster_id: ClusterId,
    /// Sender's cluster size
    pub cluster_size: ClusterSize,
    /// Link handle the peer should write mesh traffic to
    pub mesh_write_handle: u16,
    /// Sender's distance to the nearest sink
    pub hops_to_sink: ClusterSize,
}

impl FixedPayload for ClusterWelcome {
    const SIZE: usize = 10;
    const NAME: &'static str = "CLUSTER_WELCOME";

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.cluster_id);
        buf.put_i16_le(self.cluster_size);
        buf.put_u16_le(self.mesh_write_handle);
        buf.put_i16_le(self.hops_to_sink);
    }

    fn decode_unchecked<B: Buf>(buf: &mut B) -> Self {
        Self {
            cluster_id: buf.get_u32_le(),
            cluster_size: buf.get_i16_le(),
            mesh_write_handle: buf.get_u16_le(),
            hops_to_sink: buf.get_i16_le(),
        }
    }
}

/// CLUSTER_ACK_1: the losing side agrees to join and reports its hops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAck1 {
    /// Sender's distance to the nearest sink
    pub hops_to_sink: ClusterSize,
    /// Reserved, sent as zero
    pub reserved: u8,
}

impl ClusterAck1 {
    /// Create an ACK_1 with the reserved byte cleared
    pub fn new(hops_to_sink: ClusterSize) -> Self {
        Self {
            hops_to_sink,
            reserved: 0,
        }
    }
}

impl FixedPayload for ClusterAck1 {
    const SIZE: usize = 3;
    const NAME: &'static str = "CLUSTER_ACK_1";

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i16_le(self.hops_to_sink);
        buf.put_u8(self.reserved);
    }

    fn decode_unchecked<B: Buf>(buf: &mut B) -> Self {
        Self {
            hops_to_sink: buf.get_i16_le(),
            reserved: buf.get_u8(),
        }
    }
}

/// CLUSTER_ACK_2: authoritative identity and size of the merged cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAck2 {
    /// Winning cluster
    pub cluster_id: ClusterId,
    /// Size of the merged cluster
    pub cluster_size: ClusterSize,
}

impl FixedPayload for ClusterAck2 {
    const SIZE: usize = 6;
    const NAME: &'static str = "CLUSTER_ACK_2";

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.cluster_id);
        buf.put_i16_le(self.cluster_size);
    }

    fn decode_unchecked<B: Buf>(buf: &mut B) -> Self {
        Self {
            cluster_id: buf.get_u32_le(),
            cluster_size: buf.get_i16_le(),
        }
    }
}

/// CLUSTER_INFO_UPDATE: delta propagated to every neighbor of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfoUpdate {
    /// Cluster the receiver is expected to be in
    pub current_cluster_id: ClusterId,
    /// Cluster the receiver moves to (equal to current when unchanged)
    pub new_cluster_id: ClusterId,
    /// Signed change of the cluster size
    pub cluster_size_change: ClusterSize,
    /// Sender's distance to the nearest sink, not counting the receiver
    pub hops_to_sink: ClusterSize,
}

impl FixedPayload for ClusterInfoUpdate {
    const SIZE: usize = 12;
    const NAME: &'static str = "CLUSTER_INFO_UPDATE";

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.current_cluster_id);
        buf.put_u32_le(self.new_cluster_id);
        buf.put_i16_le(self.cluster_size_change);
        buf.put_i16_le(self.hops_to_sink);
    }

    fn decode_unchecked<B: Buf>(buf: &mut B) -> Self {
        Self {
            current_cluster_id: buf.get_u32_le(),
            new_cluster_id: buf.get_u32_le(),
            cluster_size_change: buf.get_i16_le(),
            hops_to_sink: buf.get_i16_le(),
        }
    }
}

/// ADV_INFO: advertising statistics gathered for one peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvInfo {
    /// Radio address of the advertiser
    pub peer_address: [u8; 6],
    /// Sum of the negated RSSI of every counted packet
    pub inverse_rssi_sum: u16,
    /// Number of packets counted
    pub packet_count: u8,
}

impl AdvInfo {
    /// Mean RSSI over the counted packets, `None` when nothing was counted
    pub fn mean_rssi(&self) -> Option<i16> {
        if self.packet_count == 0 {
            return None;
        }
        let mean = self.inverse_rssi_sum / self.packet_count as u16;
        Some(-(mean.min(i16::MAX as u16) as i16))
    }
}

impl FixedPayload for AdvInfo {
    const SIZE: usize = 9;
    const NAME: &'static str = "ADV_INFO";

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.peer_address);
        buf.put_u16_le(self.inverse_rssi_sum);
        buf.put_u8(self.packet_count);
    }

    fn decode_unchecked<B: Buf>(buf: &mut B) -> Self {
        let mut peer_address = [0u8; 6];
        buf.copy_to_slice(&mut peer_address);
        Self {
            peer_address,
            inverse_rssi_sum: buf.get_u16_le(),
            packet_count: buf.get_u8(),
        }
    }
}

/// DATA_1 / DATA_2: length-prefixed opaque user data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    data: Bytes,
}

impl DataPayload {
    /// Largest data section that fits a single write of `write_unit` bytes
    pub fn capacity(write_unit: usize) -> usize {
        write_unit.saturating_sub(PACKET_HEADER_SIZE + 1)
    }

    /// Wrap user data; the length must fit the one-byte length field
    pub fn new(data: Bytes) -> Result<Self, WireError> {
        if data.len() > u8::MAX as usize {
            return Err(WireError::PayloadTooLarge {
                size: data.len(),
                max: u8::MAX as usize,
            });
        }
        Ok(Self { data })
    }

    /// The opaque data
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        1 + self.data.len()
    }

    /// Write the length byte and the data
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.data.len() as u8);
        buf.put_slice(&self.data);
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode from a received payload
    pub fn decode(payload: &Bytes) -> Result<Self, WireError> {
        let Some(&length) = payload.first() else {
            return Err(WireError::MalformedPayload {
                payload: "DATA",
                needed: 1,
                got: 0,
            });
        };
        let needed = 1 + length as usize;
        if payload.len() < needed {
            return Err(WireError::MalformedPayload {
                payload: "DATA",
                needed,
                got: payload.len(),
            });
        }
        Ok(Self {
            data: payload.slice(1..needed),
        })
    }
}

/// Module request: a module id followed by data that may span fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRequest {
    /// Target module
    pub module_id: u16,
    /// Module specific data
    pub data: Bytes,
}

impl ModuleRequest {
    const MIN_SIZE: usize = 2;

    /// Create a module request
    pub fn new(module_id: u16, data: Bytes) -> Self {
        Self { module_id, data }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        Self::MIN_SIZE + self.data.len()
    }

    /// Write the module id and data
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.module_id);
        buf.put_slice(&self.data);
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode from a reassembled payload
    pub fn decode(payload: &Bytes) -> Result<Self, WireError> {
        if payload.len() < Self::MIN_SIZE {
            return Err(WireError::MalformedPayload {
                payload: "MODULE_REQUEST",
                needed: Self::MIN_SIZE,
                got: payload.len(),
            });
        }
        let module_id = u16::from_le_bytes([payload[0], payload[1]]);
        Ok(Self {
            module_id,
            data: payload.slice(Self::MIN_SIZE..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welcome_layout() {
        let welcome = ClusterWelcome {
            cluster_id: 0x0A0B0C0D,
            cluster_size: 3,
            mesh_write_handle: 0x0102,
            hops_to_sink: -1,
        };

        let bytes = welcome.to_bytes();
        assert_eq!(bytes.len(), ClusterWelcome::SIZE);
        assert_eq!(
            &bytes[..],
            &[0x0D, 0x0C, 0x0B, 0x0A, 0x03, 0x00, 0x02, 0x01, 0xFF, 0xFF]
        );
        assert_eq!(ClusterWelcome::decode(&bytes).unwrap(), welcome);
    }

    #[test]
    fn test_handshake_payloads_roundtrip() {
        let ack1 = ClusterAck1::new(-1);
        assert_eq!(ClusterAck1::decode(&ack1.to_bytes()).unwrap(), ack1);
        assert_eq!(ack1.to_bytes().len(), 3);

        let ack2 = ClusterAck2 {
            cluster_id: 5,
            cluster_size: 4,
        };
        assert_eq!(ClusterAck2::decode(&ack2.to_bytes()).unwrap(), ack2);
        assert_eq!(ack2.to_bytes().len(), 6);

        let update = ClusterInfoUpdate {
            current_cluster_id: 9,
            new_cluster_id: 5,
            cluster_size_change: -2,
            hops_to_sink: 4,
        };
        assert_eq!(ClusterInfoUpdate::decode(&update.to_bytes()).unwrap(), update);
        assert_eq!(update.to_bytes().len(), 12);
    }

    #[test]
    fn test_short_fixed_payload() {
        let err = ClusterAck2::decode(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            WireError::MalformedPayload {
                payload: "CLUSTER_ACK_2",
                needed: 6,
                got: 3
            }
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut raw = ClusterAck1::new(2).to_bytes().to_vec();
        raw.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(ClusterAck1::decode(&raw).unwrap().hops_to_sink, 2);
    }

    #[test]
    fn test_adv_info() {
        let info = AdvInfo {
            peer_address: [1, 2, 3, 4, 5, 6],
            inverse_rssi_sum: 300,
            packet_count: 4,
        };
        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), 9);
        assert_eq!(AdvInfo::decode(&bytes).unwrap(), info);
        assert_eq!(info.mean_rssi(), Some(-75));

        let empty = AdvInfo {
            packet_count: 0,
            ..info
        };
        assert_eq!(empty.mean_rssi(), None);
    }

    #[test]
    fn test_data_payload() {
        let payload = DataPayload::new(Bytes::from_static(b"ping")).unwrap();
        let bytes = payload.to_bytes();
        assert_eq!(&bytes[..], b"\x04ping");
        assert_eq!(DataPayload::decode(&bytes).unwrap(), payload);

        assert_eq!(DataPayload::capacity(20), 14);
    }

    #[test]
    fn test_empty_data_payload() {
        let payload = DataPayload::new(Bytes::new()).unwrap();
        let bytes = payload.to_bytes();
        assert_eq!(&bytes[..], &[0]);
        assert!(DataPayload::decode(&bytes).unwrap().data().is_empty());
    }

    #[test]
    fn test_data_payload_limits() {
        assert!(DataPayload::new(Bytes::from(vec![0u8; 256])).is_err());
        assert!(DataPayload::decode(&Bytes::new()).is_err());
        // length byte claims more than present
        assert!(DataPayload::decode(&Bytes::from_static(&[5, 1, 2])).is_err());
    }

    #[test]
    fn test_module_request() {
        let request = ModuleRequest::new(0x0201, Bytes::from(vec![7u8; 40]));
        let bytes = request.to_bytes();
        assert_eq!(&bytes[..2], &[0x01, 0x02]);
        assert_eq!(ModuleRequest::decode(&bytes).unwrap(), request);
        assert!(ModuleRequest::decode(&Bytes::from_static(&[1])).is_err());
    }
}
