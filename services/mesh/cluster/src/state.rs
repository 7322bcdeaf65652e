//! Node-global cluster membership.

use mesh_wire::{ClusterId, ClusterSize, NodeId, NO_SINK};
use serde::{Deserialize, Serialize};

/// Derive a cluster id from the node that founds the cluster
///
/// The low half is the node id, the high half a per-node counter, so ids
/// generated by different nodes never collide.
pub fn generate_cluster_id(node_id: NodeId, counter: u16) -> ClusterId {
    ((counter as ClusterId) << 16) | node_id as ClusterId
}

/// Which cluster this node is in, how big it is, and how far the sink is
///
/// Only the handshake transitions in [`crate::handshake`] mutate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    cluster_id: ClusterId,
    cluster_size: ClusterSize,
    hops_to_sink: ClusterSize,
}

impl ClusterState {
    /// Create a state; sizes below 1 are raised to 1
    pub fn new(cluster_id: ClusterId, cluster_size: ClusterSize, hops_to_sink: ClusterSize) -> Self {
        Self {
            cluster_id,
            cluster_size: cluster_size.max(1),
            hops_to_sink: hops_to_sink.max(NO_SINK),
        }
    }

    /// State of a node that has not joined anyone yet
    pub fn singleton(node_id: NodeId, is_sink: bool) -> Self {
        Self::new(
            generate_cluster_id(node_id, 0),
            1,
            if is_sink { 0 } else { NO_SINK },
        )
    }

    /// Current cluster
    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// Current cluster size, at least 1
    pub fn cluster_size(&self) -> ClusterSize {
        self.cluster_size
    }

    /// Distance to the nearest sink, [`NO_SINK`] if none is known
    pub fn hops_to_sink(&self) -> ClusterSize {
        self.hops_to_sink
    }

    /// Whether a sink is reachable
    pub fn has_sink(&self) -> bool {
        self.hops_to_sink >= 0
    }

    /// Apply a signed size change, never dropping below 1
    pub(crate) fn apply_size_change(&mut self, change: ClusterSize) -> ClusterSize {
        let before = self.cluster_size;
        self.cluster_size = self.cluster_size.saturating_add(change).max(1);
        self.cluster_size - before
    }

    pub(crate) fn set_cluster_id(&mut self, cluster_id: ClusterId) {
        self.cluster_id = cluster_id;
    }

    pub(crate) fn adopt(&mut self, cluster_id: ClusterId, cluster_size: ClusterSize) {
        self.cluster_id = cluster_id;
        self.cluster_size = cluster_size.max(1);
    }

    pub(crate) fn set_hops_to_sink(&mut self, hops: ClusterSize) {
        self.hops_to_sink = hops.max(NO_SINK);
    }
}
