//! Cluster formation over direct mesh links.
//!
//! Every node starts in a cluster of its own. When a link comes up, the two
//! ends run a four-message handshake and the smaller cluster joins the larger
//! one; after that, `CLUSTER_INFO_UPDATE` deltas keep id, size, and hops to
//! sink consistent across the merged links.
//!
//! ```text
//!  node A (cluster 5, size 3)          node B (cluster 9, size 1)
//!        |------- CLUSTER_WELCOME ------->|
//!        |<------ CLUSTER_WELCOME --------|
//!        |<------ CLUSTER_ACK_1 ----------|   B loses: smaller cluster
//!        |------- CLUSTER_ACK_2 --------->|   cluster 5, size 4
//!        |                                |
//!   other merged links of A get INFO_UPDATE(+1)
//! ```
//!
//! [`MeshNode`] is the entry point: it is fed link events and raw writes and
//! answers through a [`LinkTransport`] and a [`MeshEventHandler`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handshake;
pub mod link;
pub mod node;
pub mod state;

// Re-export main types
pub use error::MeshError;
pub use handshake::{
    best_hops, local_cluster_wins, HandshakeEvent, HandshakeMessage, HandshakePhase,
    LinkHandshake, MergeRole, MergedLink,
};
pub use link::{LinkContext, LinkId, LinkTable};
pub use node::{
    DataChannel, LinkTransport, MeshEventHandler, MeshNode, ModuleAction, NodeConfig,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use state::{generate_cluster_id, ClusterState};
