//! Packet and continuation headers.
//!
//! Every logical message starts with a 5-byte [`PacketHeader`]. When the
//! message does not fit into a single link write, each further fragment
//! starts with a 1-byte [`ContinuationHeader`] instead.
//!
//! ```text
//! byte 0      bit 0: more fragments follow, bits 1..=7: message type
//! bytes 1..2  sender node id (little-endian)
//! bytes 3..4  receiver node id (little-endian)
//! ```

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Node identifier as carried on the wire
pub type NodeId = u16;

/// Node id used when the receiver is unknown or every neighbor is meant
pub const BROADCAST_NODE_ID: NodeId = 0;

/// Full packet header size in bytes
pub const PACKET_HEADER_SIZE: usize = 5;

/// Continuation header size in bytes
pub const CONTINUATION_HEADER_SIZE: usize = 1;

/// Message types are restricted to 7 bits
pub const MESSAGE_TYPE_MASK: u8 = 0x7F;

const FRAGMENTED_BIT: u8 = 0x01;

/// Message types defined by the link protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Cluster announcement sent when a link becomes ready
    ClusterWelcome = 20,
    /// Reply of the losing side of a merge
    ClusterAck1 = 21,
    /// Authoritative merge result from the winning side
    ClusterAck2 = 22,
    /// Size / identity / hop delta propagated through a cluster
    ClusterInfoUpdate = 23,
    /// Set the configuration of a module
    ModuleSetConfig = 50,
    /// Read back the configuration of a module
    ModuleGetConfig = 51,
    /// Activate or deactivate a module
    ModuleSetActive = 52,
    /// Trigger a custom module action
    ModuleTriggerAction = 53,
    /// Forwarded advertising statistics
    AdvInfo = 60,
    /// Neighbor RSSI report
    QosConnectionData = 61,
    /// Request for a neighbor RSSI report
    QosRequest = 62,
    /// User space data
    Data1 = 80,
    /// User space data
    Data2 = 81,
}

impl MessageType {
    /// Wire value of this message type
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether this type belongs to the cluster handshake
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            MessageType::ClusterWelcome
                | MessageType::ClusterAck1
                | MessageType::ClusterAck2
                | MessageType::ClusterInfoUpdate
        )
    }

    /// Whether this type is a module request
    pub fn is_module_request(self) -> bool {
        matches!(
            self,
            MessageType::ModuleSetConfig
                | MessageType::ModuleGetConfig
                | MessageType::ModuleSetActive
                | MessageType::ModuleTriggerAction
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            20 => Ok(MessageType::ClusterWelcome),
            21 => Ok(MessageType::ClusterAck1),
            22 => Ok(MessageType::ClusterAck2),
            23 => Ok(MessageType::ClusterInfoUpdate),
            50 => Ok(MessageType::ModuleSetConfig),
            51 => Ok(MessageType::ModuleGetConfig),
            52 => Ok(MessageType::ModuleSetActive),
            53 => Ok(MessageType::ModuleTriggerAction),
            60 => Ok(MessageType::AdvInfo),
            61 => Ok(MessageType::QosConnectionData),
            62 => Ok(MessageType::QosRequest),
            80 => Ok(MessageType::Data1),
            81 => Ok(MessageType::Data2),
            _ => Err(WireError::UnknownMessageType(value)),
        }
    }
}

/// Pack the fragmentation flag and 7-bit message type into one byte
fn pack_type_byte(fragmented: bool, message_type: u8) -> u8 {
    ((message_type & MESSAGE_TYPE_MASK) << 1) | if fragmented { FRAGMENTED_BIT } else { 0 }
}

/// Split a type byte into the fragmentation flag and the message type
fn unpack_type_byte(byte: u8) -> (bool, u8) {
    (byte & FRAGMENTED_BIT != 0, byte >> 1)
}

/// Full header carried by the first fragment of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// More fragments follow this one
    pub fragmented: bool,
    /// Raw 7-bit message type
    pub message_type: u8,
    /// Sending node
    pub sender: NodeId,
    /// Receiving node
    pub receiver: NodeId,
}

impl PacketHeader {
    /// Create an unfragmented header for a known message type
    pub fn new(message_type: MessageType, sender: NodeId, receiver: NodeId) -> Self {
        Self::with_raw_type(message_type.code(), sender, receiver)
    }

    /// Create a header from a raw type value; the eighth bit is dropped
    pub fn with_raw_type(message_type: u8, sender: NodeId, receiver: NodeId) -> Self {
        Self {
            fragmented: false,
            message_type: message_type & MESSAGE_TYPE_MASK,
            sender,
            receiver,
        }
    }

    /// Resolve the message type against the defined set
    pub fn kind(&self) -> Result<MessageType, WireError> {
        MessageType::try_from(self.message_type)
    }

    /// Encode the header (little-endian)
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(pack_type_byte(self.fragmented, self.message_type));
        buf.put_u16_le(self.sender);
        buf.put_u16_le(self.receiver);
    }

    /// Decode the header (little-endian)
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < PACKET_HEADER_SIZE {
            return Err(WireError::MalformedHeader {
                needed: PACKET_HEADER_SIZE,
                got: buf.remaining(),
            });
        }

        let (fragmented, message_type) = unpack_type_byte(buf.get_u8());
        let sender = buf.get_u16_le();
        let receiver = buf.get_u16_le();

        Ok(Self {
            fragmented,
            message_type,
            sender,
            receiver,
        })
    }

    /// Encode into a fixed array
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut out = [0u8; PACKET_HEADER_SIZE];
        self.encode(&mut &mut out[..]);
        out
    }
}

/// Short header carried by every fragment after the first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationHeader {
    /// More fragments follow this one
    pub fragmented: bool,
    /// Raw 7-bit message type, same as the first fragment
    pub message_type: u8,
}

impl ContinuationHeader {
    /// Create a continuation header
    pub fn new(fragmented: bool, message_type: u8) -> Self {
        Self {
            fragmented,
            message_type: message_type & MESSAGE_TYPE_MASK,
        }
    }

    /// Encode the header
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(pack_type_byte(self.fragmented, self.message_type));
    }

    /// Decode the header
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < CONTINUATION_HEADER_SIZE {
            return Err(WireError::MalformedHeader {
                needed: CONTINUATION_HEADER_SIZE,
                got: 0,
            });
        }

        let (fragmented, message_type) = unpack_type_byte(buf.get_u8());
        Ok(Self {
            fragmented,
            message_type,
        })
    }

    /// Read the flag and type of any fragment without consuming it
    pub fn peek(chunk: &[u8]) -> Result<Self, WireError> {
        Self::decode(&mut &chunk[..])
    }
}
