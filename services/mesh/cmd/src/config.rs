//! Topology configuration for the simulator.
//!
//! The topology is read from a YAML file and can be tuned through
//! environment variables, which take precedence over the file.

use anyhow::{bail, Context, Result};
use mesh_cluster::{ClusterState, NodeConfig, DEFAULT_HANDSHAKE_TIMEOUT};
use mesh_wire::{
    ClusterId, ClusterSize, NodeId, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REASSEMBLY_TIMEOUT,
    DEFAULT_WRITE_UNIT, NO_SINK, PACKET_HEADER_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Simulation settings and topology
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Link write unit shared by every node
    pub write_unit: usize,
    /// Largest message a node reassembles
    pub max_message_size: usize,
    /// Reassembly timeout (milliseconds)
    pub reassembly_timeout_ms: u64,
    /// Handshake timeout (milliseconds)
    pub handshake_timeout_ms: u64,
    /// Nodes of the mesh
    pub nodes: Vec<NodeSpec>,
    /// Direct links between nodes
    pub links: Vec<LinkSpec>,
    /// Application messages injected during the run
    pub sends: Vec<SendSpec>,
}

/// One simulated node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node id, never 0
    pub node_id: NodeId,
    /// Whether the node is a sink
    #[serde(default)]
    pub sink: bool,
    /// Starting cluster, instead of the node's own singleton
    #[serde(default)]
    pub cluster: Option<SeedState>,
}

/// Pre-existing cluster membership of a node
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SeedState {
    /// Cluster id
    pub cluster_id: ClusterId,
    /// Cluster size
    pub cluster_size: ClusterSize,
    /// Hops to sink, -1 for none
    #[serde(default = "default_hops")]
    pub hops_to_sink: ClusterSize,
}

fn default_hops() -> ClusterSize {
    NO_SINK
}

/// A direct link between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSpec {
    /// One end
    pub a: NodeId,
    /// Other end
    pub b: NodeId,
    /// Signal strength both ends record for the link
    #[serde(default)]
    pub rssi: Option<i8>,
    /// Tear the link down this long after start (milliseconds)
    #[serde(default)]
    pub down_after_ms: Option<u64>,
}

/// Kind of message a [`SendSpec`] injects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendKind {
    /// Single-write DATA_1
    Data1,
    /// Single-write DATA_2
    Data2,
    /// QOS_REQUEST addressed to the receiving neighbor
    QosRequest,
}

/// An application message sent over a link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSpec {
    /// Sending node
    pub from: NodeId,
    /// Neighbor to send to
    pub to: NodeId,
    /// Message kind
    pub kind: SendKind,
    /// Payload text
    #[serde(default)]
    pub data: String,
    /// Send this long after start (milliseconds)
    #[serde(default)]
    pub at_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            write_unit: DEFAULT_WRITE_UNIT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            reassembly_timeout_ms: DEFAULT_REASSEMBLY_TIMEOUT.as_millis() as u64,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            nodes: vec![
                NodeSpec {
                    node_id: 1,
                    sink: true,
                    cluster: None,
                },
                NodeSpec {
                    node_id: 2,
                    sink: false,
                    cluster: None,
                },
            ],
            links: vec![LinkSpec {
                a: 1,
                b: 2,
                rssi: None,
                down_after_ms: None,
            }],
            sends: Vec::new(),
        }
    }
}

impl SimConfig {
    /// Load configuration from file and environment variables
    ///
    /// A missing file falls back to the default two-node topology; a file
    /// that does not parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: SimConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse topology file {:?}", path))?;
                info!("Loaded topology from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Topology file {:?} not found, using default topology", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        config.validate()?;

        info!(
            "Final simulation configuration: {} nodes, {} links, write_unit={}, handshake_timeout={}ms",
            config.nodes.len(),
            config.links.len(),
            config.write_unit,
            config.handshake_timeout_ms
        );

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Some(write_unit) = env_override::<usize>("MESH_SIM_WRITE_UNIT") {
            self.write_unit = write_unit;
            info!("Write unit overridden by environment: {}", write_unit);
        }

        if let Some(max) = env_override::<usize>("MESH_SIM_MAX_MESSAGE_SIZE") {
            self.max_message_size = max;
            info!("Max message size overridden by environment: {}", max);
        }

        if let Some(timeout) = env_override::<u64>("MESH_SIM_REASSEMBLY_TIMEOUT_MS") {
            self.reassembly_timeout_ms = timeout;
            info!("Reassembly timeout overridden by environment: {}ms", timeout);
        }

        if let Some(timeout) = env_override::<u64>("MESH_SIM_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = timeout;
            info!("Handshake timeout overridden by environment: {}ms", timeout);
        }
    }

    /// Reject topologies the simulator cannot wire up
    pub fn validate(&self) -> Result<()> {
        if self.write_unit <= PACKET_HEADER_SIZE {
            bail!("write_unit must exceed {} bytes, got {}", PACKET_HEADER_SIZE, self.write_unit);
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.node_id == 0 {
                bail!("node id 0 is reserved for broadcast");
            }
            if !ids.insert(node.node_id) {
                bail!("duplicate node id {}", node.node_id);
            }
        }

        for link in &self.links {
            if link.a == link.b {
                bail!("link from node {} to itself", link.a);
            }
            for end in [link.a, link.b] {
                if !ids.contains(&end) {
                    bail!("link references unknown node {}", end);
                }
            }
        }

        for send in &self.sends {
            let connected = self.links.iter().any(|link| {
                (link.a == send.from && link.b == send.to) || (link.a == send.to && link.b == send.from)
            });
            if !connected {
                bail!("send from node {} to node {} has no link", send.from, send.to);
            }
        }

        Ok(())
    }

    /// Settings for one node
    pub fn node_config(&self, node: &NodeSpec) -> NodeConfig {
        NodeConfig {
            node_id: node.node_id,
            write_unit: self.write_unit,
            is_sink: node.sink,
            max_message_size: self.max_message_size,
            reassembly_timeout: Duration::from_millis(self.reassembly_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }
}

impl SeedState {
    /// Cluster state the node starts with
    pub fn to_state(self) -> ClusterState {
        ClusterState::new(self.cluster_id, self.cluster_size, self.hops_to_sink)
    }
}

fn env_override<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid value {:?} for {}", value, key);
            None
        }
    }
}
