//! In-memory mesh: one tokio task per node, channels as links.
//!
//! Each node task owns a [`MeshNode`] and is driven purely by
//! [`NodeCommand`]s. Bytes written to a link are forwarded as a command to
//! the task at the other end, so per-link ordering is that of the channel.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use mesh_cluster::{
    ClusterState, DataChannel, HandshakeEvent, HandshakePhase, LinkId, LinkTransport,
    MeshEventHandler, MeshNode,
};
use mesh_wire::{NodeId, PacketHeader, QosReport, QosRequest};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{SendKind, SimConfig};

/// Instructions for a node task
#[derive(Debug)]
pub enum NodeCommand {
    /// The link finished connecting
    LinkUp { link: LinkId, rssi: Option<i8> },
    /// The link went away
    LinkDown { link: LinkId },
    /// A raw write arrived on the link
    Bytes { link: LinkId, bytes: Bytes },
    /// Send an application message on the link
    Send { link: LinkId, kind: SendKind, data: Bytes },
    /// Advance timers
    Tick,
    /// Reply with the node's current state
    Report(oneshot::Sender<NodeReport>),
}

/// Snapshot of one node at the end of a run
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node_id: NodeId,
    pub cluster: ClusterState,
    pub links: Vec<LinkReport>,
    pub delivered_messages: u64,
    pub qos_reports: u64,
    pub handshake_events: u64,
}

/// Per-link part of a [`NodeReport`]
#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub link: LinkId,
    pub remote_node: Option<NodeId>,
    pub phase: HandshakePhase,
}

/// Forwards link writes to the task at the other end of each link
struct ChannelTransport {
    node_id: NodeId,
    routes: HashMap<LinkId, (mpsc::UnboundedSender<NodeCommand>, LinkId)>,
}

impl LinkTransport for ChannelTransport {
    fn send_raw(&mut self, link: LinkId, bytes: Bytes) {
        let Some((peer, peer_link)) = self.routes.get(&link) else {
            warn!(node = self.node_id, "Write on unwired link {} dropped", link);
            return;
        };
        trace!(node = self.node_id, "Link {} -> {} bytes", link, bytes.len());
        let command = NodeCommand::Bytes {
            link: *peer_link,
            bytes,
        };
        if peer.send(command).is_err() {
            debug!(node = self.node_id, "Peer on link {} has stopped", link);
        }
    }
}

/// Logs what a node surfaces and counts it for the report
#[derive(Default)]
struct NodeObserver {
    node_id: NodeId,
    delivered_messages: u64,
    qos_reports: u64,
    handshake_events: u64,
}

impl MeshEventHandler for NodeObserver {
    fn on_logical_message(&mut self, link: LinkId, header: &PacketHeader, payload: &Bytes) {
        self.delivered_messages += 1;
        info!(
            node = self.node_id,
            "Delivered type {} from node {} on link {}: {:?}",
            header.message_type,
            header.sender,
            link,
            String::from_utf8_lossy(payload)
        );
    }

    fn on_handshake_event(&mut self, link: LinkId, event: &HandshakeEvent) {
        self.handshake_events += 1;
        match event {
            HandshakeEvent::Merged { .. } | HandshakeEvent::LinkLost { .. } => {
                info!(node = self.node_id, "Link {}: {:?}", link, event)
            }
            HandshakeEvent::SameCluster { .. }
            | HandshakeEvent::TimedOut { .. }
            | HandshakeEvent::UnexpectedMessage { .. }
            | HandshakeEvent::StaleUpdate { .. } => {
                warn!(node = self.node_id, "Link {}: {:?}", link, event)
            }
            _ => debug!(node = self.node_id, "Link {}: {:?}", link, event),
        }
    }

    fn on_qos_report(&mut self, link: LinkId, report: &QosReport) {
        self.qos_reports += 1;
        info!(node = self.node_id, "QoS on link {}: {:?}", link, report);
    }
}

type SimNode = MeshNode<ChannelTransport, NodeObserver>;

/// Run a node until its command channel closes
async fn run_node(mut node: SimNode, mut commands: mpsc::UnboundedReceiver<NodeCommand>) {
    let node_id = node.node_id();
    while let Some(command) = commands.recv().await {
        let now = Instant::now();
        match command {
            NodeCommand::LinkUp { link, rssi } => {
                node.link_ready(link, link, now);
                if let Some(rssi) = rssi {
                    let _ = node.record_rssi(link, rssi);
                }
            }
            NodeCommand::LinkDown { link } => {
                if let Err(err) = node.link_closed(link) {
                    warn!(node = node_id, "Closing link {}: {}", link, err);
                }
            }
            NodeCommand::Bytes { link, bytes } => {
                if let Err(err) = node.on_bytes_received(link, bytes, now) {
                    debug!(node = node_id, "Write on link {} dropped: {}", link, err);
                }
            }
            NodeCommand::Send { link, kind, data } => {
                if let Err(err) = send(&mut node, link, kind, data) {
                    warn!(node = node_id, "Send on link {} failed: {}", link, err);
                }
            }
            NodeCommand::Tick => node.tick(now),
            NodeCommand::Report(reply) => {
                let _ = reply.send(report(&node));
            }
        }
    }
    debug!(node = node_id, "Node task stopped");
}

fn send(node: &mut SimNode, link: LinkId, kind: SendKind, data: Bytes) -> Result<usize, mesh_cluster::MeshError> {
    match kind {
        SendKind::Data1 => node.send_data(link, DataChannel::Data1, data),
        SendKind::Data2 => node.send_data(link, DataChannel::Data2, data),
        SendKind::QosRequest => {
            let target = node
                .links()
                .get(link)
                .and_then(|ctx| ctx.remote_node())
                .unwrap_or_default();
            node.send_qos_request(link, QosRequest { node_id: target, kind: 0 })
        }
    }
}

fn report(node: &SimNode) -> NodeReport {
    let observer = node.handler();
    NodeReport {
        node_id: node.node_id(),
        cluster: *node.cluster_state(),
        links: node
            .links()
            .iter()
            .map(|(link, ctx)| LinkReport {
                link,
                remote_node: ctx.remote_node(),
                phase: ctx.handshake().phase(),
            })
            .collect(),
        delivered_messages: observer.delivered_messages,
        qos_reports: observer.qos_reports,
        handshake_events: observer.handshake_events,
    }
}

/// One end of a configured link
#[derive(Debug, Clone, Copy)]
struct LinkEnd {
    node: NodeId,
    link: LinkId,
}

/// A running simulation
pub struct Simulation {
    nodes: HashMap<NodeId, mpsc::UnboundedSender<NodeCommand>>,
    tasks: Vec<JoinHandle<()>>,
    links: Vec<(LinkEnd, LinkEnd, Option<i8>)>,
}

impl Simulation {
    /// Create every node and spawn its task; links stay down
    pub fn start(config: &SimConfig) -> Result<Self> {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for entry in &config.nodes {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(entry.node_id, tx);
            receivers.insert(entry.node_id, rx);
        }

        // link ids are assigned per node in topology order, starting at 1
        let mut next_link: HashMap<NodeId, LinkId> = HashMap::new();
        let mut links = Vec::new();
        for entry in &config.links {
            let mut end = |node: NodeId| {
                let counter = next_link.entry(node).or_insert(0);
                *counter += 1;
                LinkEnd { node, link: *counter }
            };
            let a = end(entry.a);
            let b = end(entry.b);
            links.push((a, b, entry.rssi));
        }

        let mut tasks = Vec::new();
        for entry in &config.nodes {
            let mut routes = HashMap::new();
            for (a, b, _) in &links {
                for (local, remote) in [(a, b), (b, a)] {
                    if local.node == entry.node_id {
                        let peer = senders
                            .get(&remote.node)
                            .with_context(|| format!("link to unknown node {}", remote.node))?;
                        routes.insert(local.link, (peer.clone(), remote.link));
                    }
                }
            }

            let transport = ChannelTransport {
                node_id: entry.node_id,
                routes,
            };
            let observer = NodeObserver {
                node_id: entry.node_id,
                ..NodeObserver::default()
            };
            let mut node = MeshNode::new(config.node_config(entry), transport, observer)?;
            if let Some(seed) = entry.cluster {
                node = node.with_cluster_state(seed.to_state());
            }

            let Some(commands) = receivers.remove(&entry.node_id) else {
                bail!("duplicate node id {}", entry.node_id);
            };
            tasks.push(tokio::spawn(run_node(node, commands)));
        }

        info!(
            "Started {} nodes with {} links",
            config.nodes.len(),
            links.len()
        );

        Ok(Self {
            nodes: senders,
            tasks,
            links,
        })
    }

    fn command(&self, node: NodeId, command: NodeCommand) {
        match self.nodes.get(&node) {
            Some(tx) => {
                if tx.send(command).is_err() {
                    warn!("Node {} is no longer running", node);
                }
            }
            None => warn!("No node {}", node),
        }
    }

    fn find_link(&self, a: NodeId, b: NodeId) -> Option<(LinkEnd, LinkEnd)> {
        self.links.iter().find_map(|(x, y, _)| {
            if x.node == a && y.node == b {
                Some((*x, *y))
            } else if x.node == b && y.node == a {
                Some((*y, *x))
            } else {
                None
            }
        })
    }

    /// Bring up both ends of every link
    pub fn connect_all(&self) {
        for (a, b, rssi) in &self.links {
            for end in [a, b] {
                self.command(
                    end.node,
                    NodeCommand::LinkUp {
                        link: end.link,
                        rssi: *rssi,
                    },
                );
            }
        }
    }

    /// Take down the link between two nodes
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        let Some((x, y)) = self.find_link(a, b) else {
            warn!("No link between nodes {} and {}", a, b);
            return;
        };
        info!("Taking down link between nodes {} and {}", a, b);
        for end in [x, y] {
            self.command(end.node, NodeCommand::LinkDown { link: end.link });
        }
    }

    /// Send an application message from one node to a neighbor
    pub fn send(&self, from: NodeId, to: NodeId, kind: SendKind, data: Bytes) {
        match self.find_link(from, to) {
            Some((local, _)) => self.command(from, NodeCommand::Send { link: local.link, kind, data }),
            None => warn!("No link between nodes {} and {}", from, to),
        }
    }

    /// Advance every node's timers
    pub fn tick(&self) {
        for node in self.nodes.keys() {
            self.command(*node, NodeCommand::Tick);
        }
    }

    /// Collect reports from every node, ordered by node id
    pub async fn reports(&self) -> Vec<NodeReport> {
        let mut reports = Vec::with_capacity(self.nodes.len());
        for tx in self.nodes.values() {
            let (reply, response) = oneshot::channel();
            if tx.send(NodeCommand::Report(reply)).is_ok() {
                if let Ok(report) = response.await {
                    reports.push(report);
                }
            }
        }
        reports.sort_by_key(|report| report.node_id);
        reports
    }

    /// Stop all node tasks
    pub async fn shutdown(self) {
        drop(self.nodes);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
