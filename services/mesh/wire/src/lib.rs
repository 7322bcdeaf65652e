//! Packet framing, payload codecs, QoS reports, and fragmentation for the
//! cluster mesh link protocol.
//!
//! This crate is the byte level of the mesh: it turns logical messages into
//! link writes and back, and encodes the fixed payload layouts exchanged
//! between two directly connected nodes. It has no notion of links or
//! cluster state; see `mesh-cluster` for that.
//!
//! ## Wire Format
//!
//! All multi-byte fields are little-endian with no padding.
//!
//! ```text
//! first fragment         continuation fragment
//! +--------------------+ +--------------------+
//! | u8 more|type<<1    | | u8 more|type<<1    |
//! | u16 sender         | +--------------------+
//! | u16 receiver       | | payload (U - 1)    |
//! +--------------------+ +--------------------+
//! | payload (U - 5)    |
//! +--------------------+
//! ```
//!
//! `U` is the link write unit supplied by the link layer (20 bytes on the
//! original radio stack).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod error;
pub mod header;
pub mod payload;
pub mod qos;

// Re-export main types
pub use chunk::{
    Fragmenter, Fragments, LogicalMessage, ReassemblyConfig, Reassembler,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REASSEMBLY_TIMEOUT, DEFAULT_WRITE_UNIT,
};
pub use error::WireError;
pub use header::{
    ContinuationHeader, MessageType, NodeId, PacketHeader, BROADCAST_NODE_ID,
    CONTINUATION_HEADER_SIZE, MESSAGE_TYPE_MASK, PACKET_HEADER_SIZE,
};
pub use payload::{
    AdvInfo, ClusterAck1, ClusterAck2, ClusterId, ClusterInfoUpdate, ClusterSize,
    ClusterWelcome, DataPayload, FixedPayload, ModuleRequest, NO_SINK,
};
pub use qos::{QosConnectionData, QosReport, QosRequest, QOS_SLOTS};
