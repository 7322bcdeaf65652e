//! Error types for the cluster layer.

use mesh_wire::{ClusterId, MessageType, WireError};
use thiserror::Error;

use crate::handshake::HandshakePhase;
use crate::link::LinkId;

/// Errors raised while processing link traffic
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Framing or payload decoding failed
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Handshake message that does not fit the link's phase; the link is reset
    #[error("unexpected {message_type:?} in handshake phase {phase:?}")]
    UnexpectedHandshakeMessage {
        /// Offending message
        message_type: MessageType,
        /// Phase the link was in
        phase: HandshakePhase,
    },

    /// INFO_UPDATE addressed to a cluster we are no longer in
    #[error("stale cluster update for {received:#010x}, local cluster is {local:#010x}")]
    StaleClusterUpdate {
        /// Our cluster
        local: ClusterId,
        /// Cluster the update was meant for
        received: ClusterId,
    },

    /// Operation on a link that was never opened or already closed
    #[error("unknown link {0}")]
    UnknownLink(LinkId),
}
