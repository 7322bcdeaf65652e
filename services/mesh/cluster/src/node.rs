//! Link dispatcher for one mesh node.
//!
//! [`MeshNode`] owns the node's [`ClusterState`] and one [`LinkContext`] per
//! direct link. Raw link writes go in through [`MeshNode::on_bytes_received`],
//! get reassembled per link, and are routed by message type: handshake
//! messages drive the merge state machine, QoS messages are surfaced (and
//! answered when addressed to us), everything else is handed to the
//! application untouched.
//!
//! The node performs no I/O itself. Writes leave through a [`LinkTransport`],
//! notifications through a [`MeshEventHandler`], and time only advances when
//! the caller passes an `Instant` in.

use std::time::{Duration, Instant};

use bytes::Bytes;
use mesh_wire::{
    ClusterAck1, ClusterAck2, ClusterId, ClusterInfoUpdate, ClusterSize, ClusterWelcome,
    DataPayload, FixedPayload, Fragmenter, LogicalMessage, MessageType, ModuleRequest, NodeId,
    PacketHeader, QosConnectionData, QosReport, QosRequest, ReassemblyConfig, WireError,
    BROADCAST_NODE_ID, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REASSEMBLY_TIMEOUT, DEFAULT_WRITE_UNIT,
    QOS_SLOTS,
};
use tracing::{debug, info, trace, warn};

use crate::error::MeshError;
use crate::handshake::{
    best_hops, refresh_hops, HandshakeEvent, HandshakeMessage, HandshakePhase, MergeOutcome,
    WelcomeVerdict,
};
use crate::link::{LinkContext, LinkId, LinkTable};
use crate::state::ClusterState;

/// Default time a handshake may stay incomplete
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes fragments to the link layer
pub trait LinkTransport {
    /// Write one fragment, at most one write unit long
    fn send_raw(&mut self, link: LinkId, bytes: Bytes);
}

/// Receives everything the node surfaces
///
/// All methods default to doing nothing.
pub trait MeshEventHandler {
    /// A message the node does not consume itself, including unknown types
    fn on_logical_message(&mut self, _link: LinkId, _header: &PacketHeader, _payload: &Bytes) {}

    /// A handshake or cluster-state transition
    fn on_handshake_event(&mut self, _link: LinkId, _event: &HandshakeEvent) {}

    /// A decoded QoS message
    fn on_qos_report(&mut self, _link: LinkId, _report: &QosReport) {}
}

impl MeshEventHandler for () {}

/// Node settings
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Our node id, never 0
    pub node_id: NodeId,
    /// Link write unit in bytes
    pub write_unit: usize,
    /// Whether this node is a sink
    pub is_sink: bool,
    /// Largest message accepted by reassembly
    pub max_message_size: usize,
    /// How long a partial message may wait for its next fragment
    pub reassembly_timeout: Duration,
    /// How long a handshake may stay incomplete
    pub handshake_timeout: Duration,
}

impl NodeConfig {
    /// Default settings for `node_id`
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    fn reassembly(&self) -> ReassemblyConfig {
        ReassemblyConfig {
            max_message_size: self.max_message_size,
            timeout: self.reassembly_timeout,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            write_unit: DEFAULT_WRITE_UNIT,
            is_sink: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// The two application data channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannel {
    /// DATA_1
    Data1,
    /// DATA_2
    Data2,
}

impl DataChannel {
    /// Message type of the channel
    pub fn message_type(self) -> MessageType {
        match self {
            DataChannel::Data1 => MessageType::Data1,
            DataChannel::Data2 => MessageType::Data2,
        }
    }
}

/// Module requests that can be sent to a neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleAction {
    /// MODULE_SET_CONFIG
    SetConfig,
    /// MODULE_GET_CONFIG
    GetConfig,
    /// MODULE_SET_ACTIVE
    SetActive,
    /// MODULE_TRIGGER_ACTION
    TriggerAction,
}

impl ModuleAction {
    /// Message type of the request
    pub fn message_type(self) -> MessageType {
        match self {
            ModuleAction::SetConfig => MessageType::ModuleSetConfig,
            ModuleAction::GetConfig => MessageType::ModuleGetConfig,
            ModuleAction::SetActive => MessageType::ModuleSetActive,
            ModuleAction::TriggerAction => MessageType::ModuleTriggerAction,
        }
    }
}

/// One mesh node and its links
#[derive(Debug)]
pub struct MeshNode<T, H> {
    config: NodeConfig,
    state: ClusterState,
    cluster_counter: u16,
    fragmenter: Fragmenter,
    links: LinkTable,
    transport: T,
    handler: H,
}

impl<T: LinkTransport, H: MeshEventHandler> MeshNode<T, H> {
    /// Create a node in its own single-node cluster
    pub fn new(config: NodeConfig, transport: T, handler: H) -> Result<Self, MeshError> {
        let fragmenter = Fragmenter::new(config.write_unit)?;
        let state = ClusterState::singleton(config.node_id, config.is_sink);

        debug!(
            "Created node {} in cluster {:#010x} (write unit {})",
            config.node_id,
            state.cluster_id(),
            config.write_unit
        );

        Ok(Self {
            config,
            state,
            cluster_counter: 0,
            fragmenter,
            links: LinkTable::new(),
            transport,
            handler,
        })
    }

    /// Start from a known cluster state instead of a fresh singleton
    pub fn with_cluster_state(mut self, state: ClusterState) -> Self {
        self.state = state;
        self
    }

    /// Our node id
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Node settings
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Current cluster membership
    pub fn cluster_state(&self) -> &ClusterState {
        &self.state
    }

    /// All links
    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    /// Handshake phase of a link
    pub fn link_phase(&self, link: LinkId) -> Option<HandshakePhase> {
        self.links.get(link).map(|ctx| ctx.handshake().phase())
    }

    /// The link layer
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The link layer, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The event handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The event handler, mutably
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// A link finished connecting: announce our cluster on it
    ///
    /// Calling this again on an existing link restarts its handshake; a
    /// merged link is first accounted as lost.
    pub fn link_ready(&mut self, link: LinkId, write_handle: u16, now: Instant) {
        if self.links.get(link).is_some_and(|ctx| ctx.handshake.is_merged()) {
            self.sever(link);
        }

        let reassembly = self.config.reassembly();
        let ctx = self
            .links
            .get_or_insert_with(link, || LinkContext::new(write_handle, reassembly));
        ctx.write_handle = write_handle;
        let welcome = ctx.handshake.start(&self.state, write_handle, now);

        debug!(
            "Link {} ready, announcing cluster {:#010x} (size {})",
            link, welcome.cluster_id, welcome.cluster_size
        );
        self.emit(link, HandshakeMessage::Welcome(welcome));
    }

    /// A link went away
    ///
    /// Buffered fragments are dropped. If the link was merged, the part of
    /// the cluster behind it is subtracted and the remaining neighbors are told.
    pub fn link_closed(&mut self, link: LinkId) -> Result<(), MeshError> {
        if self.links.get(link).is_none() {
            return Err(MeshError::UnknownLink(link));
        }

        self.sever(link);
        if let Some(ctx) = self.links.remove(link) {
            if ctx.reassembly_in_progress() {
                debug!("Dropped partial message on closed link {}", link);
            }
        }
        debug!("Link {} closed", link);
        Ok(())
    }

    /// Feed one raw link write
    ///
    /// Unknown links are registered implicitly with write handle 0 until
    /// [`MeshNode::link_ready`] supplies one. Errors describe why the write
    /// or the message it completed was dropped; the node stays usable.
    pub fn on_bytes_received(&mut self, link: LinkId, bytes: Bytes, now: Instant) -> Result<(), MeshError> {
        let reassembly = self.config.reassembly();
        let ctx = self
            .links
            .get_or_insert_with(link, || LinkContext::new(0, reassembly));

        let message = match ctx.reassembler.push(bytes, now) {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!("Dropping write on link {}: {}", link, err);
                return Err(err.into());
            }
        };

        if message.header.sender != BROADCAST_NODE_ID {
            ctx.remote_node = Some(message.header.sender);
        }

        self.dispatch(link, message, now)
    }

    /// Expire stale reassembly buffers and stuck handshakes
    pub fn tick(&mut self, now: Instant) {
        let timeout = self.config.handshake_timeout;
        let mut timed_out = Vec::new();

        for (link, ctx) in self.links.iter_mut() {
            if ctx.reassembler.expire(now) {
                warn!("Dropped incomplete message on link {} after timeout", link);
            }
            if let Some(phase) = ctx.handshake.expire(now, timeout) {
                timed_out.push((link, phase));
            }
        }

        for (link, phase) in timed_out {
            warn!("Handshake on link {} timed out in {:?}", link, phase);
            self.handler
                .on_handshake_event(link, &HandshakeEvent::TimedOut { phase });
        }
    }

    /// Record the signal strength measured on a link
    pub fn record_rssi(&mut self, link: LinkId, rssi: i8) -> Result<(), MeshError> {
        let ctx = self.links.get_mut(link).ok_or(MeshError::UnknownLink(link))?;
        ctx.rssi = Some(rssi);
        Ok(())
    }

    /// Turn the sink role on or off, telling merged neighbors if hops change
    pub fn set_sink(&mut self, is_sink: bool) {
        if self.config.is_sink == is_sink {
            return;
        }
        self.config.is_sink = is_sink;

        if self.refresh_hops() {
            info!(
                "Node {} sink role {}, hops to sink now {}",
                self.config.node_id,
                if is_sink { "enabled" } else { "disabled" },
                self.state.hops_to_sink()
            );
            let cluster_id = self.state.cluster_id();
            self.fan_out(None, cluster_id, 0);
        }
    }

    /// Send a logical message, fragmenting as needed
    ///
    /// Returns the number of link writes.
    pub fn send_message(
        &mut self,
        link: LinkId,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<usize, MeshError> {
        let receiver = self
            .links
            .get(link)
            .map(LinkContext::receiver)
            .ok_or(MeshError::UnknownLink(link))?;

        if payload.len() > self.config.max_message_size {
            return Err(WireError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_message_size,
            }
            .into());
        }

        let header = PacketHeader::new(message_type, self.config.node_id, receiver);
        Ok(self.write(link, header, payload))
    }

    /// Send application data that fits a single write
    pub fn send_data(&mut self, link: LinkId, channel: DataChannel, data: Bytes) -> Result<usize, MeshError> {
        let capacity = DataPayload::capacity(self.config.write_unit);
        if data.len() > capacity {
            return Err(WireError::PayloadTooLarge {
                size: data.len(),
                max: capacity,
            }
            .into());
        }

        let payload = DataPayload::new(data)?;
        self.send_message(link, channel.message_type(), &payload.to_bytes())
    }

    /// Send a module request
    pub fn send_module_request(
        &mut self,
        link: LinkId,
        action: ModuleAction,
        request: &ModuleRequest,
    ) -> Result<usize, MeshError> {
        self.send_message(link, action.message_type(), &request.to_bytes())
    }

    /// Ask the neighbor on `link` for its connection report
    pub fn send_qos_request(&mut self, link: LinkId, request: QosRequest) -> Result<usize, MeshError> {
        self.send_message(link, MessageType::QosRequest, &request.to_bytes())
    }

    fn dispatch(&mut self, link: LinkId, message: LogicalMessage, now: Instant) -> Result<(), MeshError> {
        let LogicalMessage { header, payload } = message;

        let message_type = match header.kind() {
            Ok(message_type) => message_type,
            Err(_) => {
                debug!(
                    "Passing message of unknown type {} from link {} through",
                    header.message_type, link
                );
                self.handler.on_logical_message(link, &header, &payload);
                return Ok(());
            }
        };

        trace!(
            "Received {:?} ({} bytes) from node {} on link {}",
            message_type,
            payload.len(),
            header.sender,
            link
        );

        match message_type {
            MessageType::ClusterWelcome => {
                let welcome = ClusterWelcome::decode(&payload)?;
                self.handle_welcome(link, header.sender, welcome, now)
            }
            MessageType::ClusterAck1 => {
                let ack = ClusterAck1::decode(&payload)?;
                self.handle_ack1(link, ack)
            }
            MessageType::ClusterAck2 => {
                let ack = ClusterAck2::decode(&payload)?;
                self.handle_ack2(link, ack)
            }
            MessageType::ClusterInfoUpdate => {
                let update = ClusterInfoUpdate::decode(&payload)?;
                self.handle_info_update(link, update)
            }
            MessageType::QosRequest | MessageType::QosConnectionData | MessageType::AdvInfo => {
                self.handle_qos(link, message_type, &payload)
            }
            _ => {
                self.handler.on_logical_message(link, &header, &payload);
                Ok(())
            }
        }
    }

    fn handle_welcome(
        &mut self,
        link: LinkId,
        remote_node: NodeId,
        welcome: ClusterWelcome,
        now: Instant,
    ) -> Result<(), MeshError> {
        if self.links.get(link).is_some_and(|ctx| ctx.handshake.is_merged()) {
            debug!("WELCOME on merged link {}, re-entering handshake", link);
            self.sever(link);
        }

        let local_node = self.config.node_id;
        let ctx = self.links.get_mut(link).ok_or(MeshError::UnknownLink(link))?;
        let write_handle = ctx.write_handle;
        let outcome = ctx
            .handshake
            .on_welcome(&self.state, welcome, local_node, remote_node, write_handle, now);

        for reply in outcome.replies {
            self.emit(link, reply);
        }

        match outcome.verdict {
            WelcomeVerdict::Ignored => {
                self.handler
                    .on_handshake_event(link, &HandshakeEvent::WelcomeIgnored { remote_node });
            }
            WelcomeVerdict::SameCluster(cluster_id) => {
                self.handler.on_handshake_event(
                    link,
                    &HandshakeEvent::WelcomeReceived { remote_node, welcome },
                );
                warn!(
                    "Node {} on link {} is already in cluster {:#010x}",
                    remote_node, link, cluster_id
                );
                self.handler
                    .on_handshake_event(link, &HandshakeEvent::SameCluster { cluster_id });
            }
            WelcomeVerdict::Winning | WelcomeVerdict::Joining => {
                debug!(
                    "WELCOME from node {} on link {}: cluster {:#010x} size {}, we {}",
                    remote_node,
                    link,
                    welcome.cluster_id,
                    welcome.cluster_size,
                    if outcome.verdict == WelcomeVerdict::Winning { "win" } else { "join" }
                );
                self.handler.on_handshake_event(
                    link,
                    &HandshakeEvent::WelcomeReceived { remote_node, welcome },
                );
            }
        }

        Ok(())
    }

    fn handle_ack1(&mut self, link: LinkId, ack: ClusterAck1) -> Result<(), MeshError> {
        let ctx = self.links.get_mut(link).ok_or(MeshError::UnknownLink(link))?;
        match ctx.handshake.on_ack1(&mut self.state, ack) {
            Ok(outcome) => {
                self.finish_merge(link, outcome);
                Ok(())
            }
            Err(err) => Err(self.reject(link, err)),
        }
    }

    fn handle_ack2(&mut self, link: LinkId, ack: ClusterAck2) -> Result<(), MeshError> {
        let ctx = self.links.get_mut(link).ok_or(MeshError::UnknownLink(link))?;
        match ctx.handshake.on_ack2(&mut self.state, ack) {
            Ok(outcome) => {
                self.finish_merge(link, outcome);
                Ok(())
            }
            Err(err) => Err(self.reject(link, err)),
        }
    }

    /// Log a refused handshake message and surface it to the handler
    fn reject(&mut self, link: LinkId, err: MeshError) -> MeshError {
        let event = match err {
            MeshError::UnexpectedHandshakeMessage {
                message_type,
                phase,
            } => {
                warn!("Resetting link {}: {}", link, err);
                HandshakeEvent::UnexpectedMessage {
                    message_type,
                    phase,
                }
            }
            MeshError::StaleClusterUpdate { local, received } => {
                warn!("Rejected cluster update on link {}: {}", link, err);
                HandshakeEvent::StaleUpdate { local, received }
            }
            _ => return err,
        };
        self.handler.on_handshake_event(link, &event);
        err
    }

    fn finish_merge(&mut self, link: LinkId, outcome: MergeOutcome) {
        if let Some(reply) = outcome.reply {
            self.emit(link, reply);
        }

        if outcome.drift != 0 {
            let cluster_id = self.state.cluster_id();
            let correction = ClusterInfoUpdate {
                current_cluster_id: cluster_id,
                new_cluster_id: cluster_id,
                cluster_size_change: outcome.drift,
                hops_to_sink: self.hops_excluding(Some(link)),
            };
            debug!(
                "Cluster grew by {} during handshake on link {}, correcting peer",
                outcome.drift, link
            );
            self.announce(link, HandshakeMessage::InfoUpdate(correction));
        }

        info!(
            "Node {} merged over link {} ({:?}): cluster {:#010x}, size {}, hops to sink {}",
            self.config.node_id,
            link,
            outcome.role,
            self.state.cluster_id(),
            self.state.cluster_size(),
            self.state.hops_to_sink()
        );
        self.handler.on_handshake_event(
            link,
            &HandshakeEvent::Merged {
                role: outcome.role,
                cluster_id: self.state.cluster_id(),
                cluster_size: self.state.cluster_size(),
                hops_to_sink: self.state.hops_to_sink(),
            },
        );

        self.fan_out(Some(link), outcome.previous_cluster_id, outcome.size_change);
    }

    fn handle_info_update(&mut self, link: LinkId, update: ClusterInfoUpdate) -> Result<(), MeshError> {
        let ctx = self.links.get_mut(link).ok_or(MeshError::UnknownLink(link))?;
        let outcome = match ctx.handshake.on_info_update(&mut self.state, update) {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.reject(link, err)),
        };

        if outcome.crossed {
            debug!(
                "Cluster update on link {} crossed ours: peer {:#010x} -> {:#010x}, keeping {:#010x}",
                link,
                update.current_cluster_id,
                update.new_cluster_id,
                self.state.cluster_id()
            );
        }

        let hops_changed = self.refresh_hops();
        let id_changed = outcome.previous_cluster_id != self.state.cluster_id();
        if outcome.size_change == 0 && !id_changed && !hops_changed && !outcome.peer_hops_changed {
            trace!("Cluster update on link {} changed nothing", link);
            return Ok(());
        }

        debug!(
            "Cluster update on link {}: cluster {:#010x}, size {} ({:+}), hops to sink {}",
            link,
            self.state.cluster_id(),
            self.state.cluster_size(),
            outcome.size_change,
            self.state.hops_to_sink()
        );
        self.handler.on_handshake_event(
            link,
            &HandshakeEvent::ClusterUpdated {
                previous_cluster_id: outcome.previous_cluster_id,
                cluster_id: self.state.cluster_id(),
                cluster_size: self.state.cluster_size(),
                size_change: outcome.size_change,
                hops_to_sink: self.state.hops_to_sink(),
            },
        );

        self.fan_out(Some(link), outcome.previous_cluster_id, outcome.size_change);
        Ok(())
    }

    fn handle_qos(&mut self, link: LinkId, message_type: MessageType, payload: &[u8]) -> Result<(), MeshError> {
        let Some(report) = QosReport::decode(message_type, payload) else {
            return Ok(());
        };
        let report = report?;

        self.handler.on_qos_report(link, &report);

        if let QosReport::Request(request) = report {
            if request.is_addressed_to(self.config.node_id) {
                self.answer_qos_request(link)?;
            }
        }
        Ok(())
    }

    fn answer_qos_request(&mut self, link: LinkId) -> Result<(), MeshError> {
        let entries: Vec<(NodeId, i8)> = self
            .links
            .iter()
            .filter_map(|(_, ctx)| Some((ctx.remote_node?, ctx.rssi?)))
            .take(QOS_SLOTS)
            .collect();
        let report = QosConnectionData::from_entries(&entries)?;

        debug!("Answering QoS request on link {} with {} neighbors", link, entries.len());
        self.send_message(link, MessageType::QosConnectionData, &report.to_bytes())?;
        Ok(())
    }

    /// Take a merged link out of the cluster and propagate the split
    fn sever(&mut self, link: LinkId) {
        let node_id = self.config.node_id;
        let Some(ctx) = self.links.get_mut(link) else {
            return;
        };
        let Some(outcome) = ctx
            .handshake
            .sever(&mut self.state, node_id, &mut self.cluster_counter)
        else {
            return;
        };

        self.refresh_hops();
        info!(
            "Node {} lost link {}: cluster {:#010x} -> {:#010x}, size {}",
            node_id,
            link,
            outcome.previous_cluster_id,
            self.state.cluster_id(),
            self.state.cluster_size()
        );
        self.handler.on_handshake_event(
            link,
            &HandshakeEvent::LinkLost {
                previous_cluster_id: outcome.previous_cluster_id,
                cluster_id: self.state.cluster_id(),
                cluster_size: self.state.cluster_size(),
                size_change: outcome.size_change,
            },
        );

        self.fan_out(Some(link), outcome.previous_cluster_id, outcome.size_change);
    }

    /// Send INFO_UPDATE to every merged link except `exclude`
    fn fan_out(&mut self, exclude: Option<LinkId>, previous_cluster_id: ClusterId, size_change: ClusterSize) {
        let cluster_id = self.state.cluster_id();
        for target in self.links.merged_except(exclude) {
            let update = ClusterInfoUpdate {
                current_cluster_id: previous_cluster_id,
                new_cluster_id: cluster_id,
                cluster_size_change: size_change,
                hops_to_sink: self.hops_excluding(Some(target)),
            };
            self.announce(target, HandshakeMessage::InfoUpdate(update));
        }
    }

    /// Send an INFO_UPDATE on a merged link, remembering the id it names
    fn announce(&mut self, link: LinkId, message: HandshakeMessage) {
        if let HandshakeMessage::InfoUpdate(update) = &message {
            if let Some(ctx) = self.links.get_mut(link) {
                ctx.handshake.announce(update.new_cluster_id);
            }
        }
        self.emit(link, message);
    }

    /// Hops to sink as seen by the neighbor on `exclude`
    fn hops_excluding(&self, exclude: Option<LinkId>) -> ClusterSize {
        best_hops(self.config.is_sink, self.links.peer_hops_except(exclude))
    }

    fn refresh_hops(&mut self) -> bool {
        let hops = self.hops_excluding(None);
        refresh_hops(&mut self.state, hops)
    }

    fn emit(&mut self, link: LinkId, message: HandshakeMessage) {
        let receiver = self
            .links
            .get(link)
            .map(LinkContext::receiver)
            .unwrap_or_default();
        let header = PacketHeader::new(message.message_type(), self.config.node_id, receiver);
        trace!("Sending {:?} on link {}", message, link);
        self.write(link, header, &message.to_bytes());
    }

    fn write(&mut self, link: LinkId, header: PacketHeader, payload: &[u8]) -> usize {
        let fragments = self.fragmenter.fragment(header, payload);
        let count = fragments.len();
        for fragment in fragments {
            self.transport.send_raw(link, fragment);
        }
        count
    }
}

impl LinkTransport for Vec<(LinkId, Bytes)> {
    fn send_raw(&mut self, link: LinkId, bytes: Bytes) {
        self.push((link, bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::{ContinuationHeader, NO_SINK};

    type Outbox = Vec<(LinkId, Bytes)>;

    #[derive(Debug, Default)]
    struct Recorder {
        messages: Vec<(LinkId, PacketHeader, Bytes)>,
        events: Vec<(LinkId, HandshakeEvent)>,
        reports: Vec<(LinkId, QosReport)>,
    }

    impl MeshEventHandler for Recorder {
        fn on_logical_message(&mut self, link: LinkId, header: &PacketHeader, payload: &Bytes) {
            self.messages.push((link, *header, payload.clone()));
        }

        fn on_handshake_event(&mut self, link: LinkId, event: &HandshakeEvent) {
            self.events.push((link, *event));
        }

        fn on_qos_report(&mut self, link: LinkId, report: &QosReport) {
            self.reports.push((link, *report));
        }
    }

    fn node(node_id: NodeId) -> MeshNode<Outbox, Recorder> {
        MeshNode::new(NodeConfig::new(node_id), Outbox::new(), Recorder::default()).unwrap()
    }

    /// Deliver everything `from` has queued to `to`, link ids mirrored
    fn deliver(from: &mut MeshNode<Outbox, Recorder>, to: &mut MeshNode<Outbox, Recorder>, now: Instant) {
        for (link, bytes) in std::mem::take(from.transport_mut()) {
            let _ = to.on_bytes_received(link, bytes, now);
        }
    }

    fn pump(a: &mut MeshNode<Outbox, Recorder>, b: &mut MeshNode<Outbox, Recorder>, now: Instant) {
        while !a.transport().is_empty() || !b.transport().is_empty() {
            deliver(a, b, now);
            deliver(b, a, now);
        }
    }

    #[test]
    fn test_invalid_write_unit() {
        let config = NodeConfig {
            write_unit: 5,
            ..NodeConfig::new(1)
        };
        let err = MeshNode::new(config, Outbox::new(), ()).unwrap_err();
        assert_eq!(err, MeshError::Wire(WireError::InvalidWriteUnit(5)));
    }

    #[test]
    fn test_link_ready_sends_welcome() {
        let now = Instant::now();
        let mut a = node(1);
        a.link_ready(3, 7, now);

        assert_eq!(a.link_phase(3), Some(HandshakePhase::WelcomeSent));
        let (link, bytes) = &a.transport()[0];
        assert_eq!(*link, 3);
        let mut buf = bytes.clone();
        let header = PacketHeader::decode(&mut buf).unwrap();
        assert_eq!(header.kind().unwrap(), MessageType::ClusterWelcome);
        assert_eq!(header.sender, 1);
        assert_eq!(header.receiver, 0);
        assert!(!header.fragmented);
        let welcome = ClusterWelcome::decode(&buf).unwrap();
        assert_eq!(welcome.cluster_id, 1);
        assert_eq!(welcome.mesh_write_handle, 7);
    }

    #[test]
    fn test_merge_over_one_link() {
        let now = Instant::now();
        let mut a = node(1).with_cluster_state(ClusterState::new(5, 3, 2));
        let mut b = node(2).with_cluster_state(ClusterState::new(9, 1, NO_SINK));

        a.link_ready(1, 1, now);
        pump(&mut a, &mut b, now);

        for n in [&a, &b] {
            assert_eq!(n.cluster_state().cluster_id(), 5);
            assert_eq!(n.cluster_state().cluster_size(), 4);
            assert_eq!(n.link_phase(1), Some(HandshakePhase::Merged));
        }
        assert_eq!(b.cluster_state().hops_to_sink(), 3);
        assert!(b.handler().events.iter().any(|(_, event)| matches!(
            event,
            HandshakeEvent::Merged { cluster_id: 5, cluster_size: 4, .. }
        )));
    }

    #[test]
    fn test_data_passes_through_fragmented() {
        let now = Instant::now();
        let mut a = node(1);
        let mut b = node(2);
        a.link_ready(1, 1, now);
        pump(&mut a, &mut b, now);

        let payload: Vec<u8> = (0..26).collect();
        assert_eq!(a.send_message(1, MessageType::Data1, &payload).unwrap(), 2);
        let (_, first) = &a.transport()[0];
        assert_eq!(first.len(), 20);
        let (_, second) = &a.transport()[1];
        assert_eq!(second.len(), 12);
        assert_eq!(
            ContinuationHeader::peek(second).unwrap(),
            ContinuationHeader::new(false, MessageType::Data1.code())
        );

        deliver(&mut a, &mut b, now);
        let (link, header, received) = b.handler().messages.last().unwrap();
        assert_eq!(*link, 1);
        assert_eq!(header.receiver, 2);
        assert_eq!(&received[..], &payload[..]);
    }

    #[test]
    fn test_unknown_type_passes_through() {
        let now = Instant::now();
        let mut b = node(2);
        let mut raw = PacketHeader::with_raw_type(99, 1, 2).to_bytes().to_vec();
        raw.extend_from_slice(b"hi");

        b.on_bytes_received(4, Bytes::from(raw), now).unwrap();
        let (link, header, payload) = &b.handler().messages[0];
        assert_eq!(*link, 4);
        assert_eq!(header.message_type, 99);
        assert_eq!(&payload[..], b"hi");
        assert_eq!(b.links().get(4).unwrap().remote_node(), Some(1));
    }

    #[test]
    fn test_truncated_welcome_is_malformed() {
        let mut b = node(2);
        let mut raw = PacketHeader::new(MessageType::ClusterWelcome, 1, 2).to_bytes().to_vec();
        raw.extend_from_slice(&[1, 2, 3]);

        let err = b
            .on_bytes_received(1, Bytes::from(raw), Instant::now())
            .unwrap_err();
        assert!(matches!(err, MeshError::Wire(WireError::MalformedPayload { .. })));
        assert_eq!(*b.cluster_state(), ClusterState::singleton(2, false));
    }

    #[test]
    fn test_unexpected_ack2_resets_link() {
        let now = Instant::now();
        let mut b = node(2);
        b.link_ready(1, 1, now);

        let mut raw = PacketHeader::new(MessageType::ClusterAck2, 1, 2).to_bytes().to_vec();
        raw.extend_from_slice(&ClusterAck2 { cluster_id: 77, cluster_size: 9 }.to_bytes());
        let err = b.on_bytes_received(1, Bytes::from(raw), now).unwrap_err();

        assert_eq!(
            err,
            MeshError::UnexpectedHandshakeMessage {
                message_type: MessageType::ClusterAck2,
                phase: HandshakePhase::WelcomeSent
            }
        );
        assert_eq!(b.link_phase(1), Some(HandshakePhase::Idle));
        assert_eq!(b.cluster_state().cluster_id(), 2);
        assert_eq!(
            b.handler().events.last().map(|(_, event)| *event),
            Some(HandshakeEvent::UnexpectedMessage {
                message_type: MessageType::ClusterAck2,
                phase: HandshakePhase::WelcomeSent
            })
        );
    }

    #[test]
    fn test_foreign_update_reported() {
        let now = Instant::now();
        let mut a = node(1);
        let mut b = node(2);
        a.link_ready(1, 1, now);
        pump(&mut a, &mut b, now);
        let before = *b.cluster_state();

        let update = ClusterInfoUpdate {
            current_cluster_id: 0xDEAD,
            new_cluster_id: 0xBEEF,
            cluster_size_change: 4,
            hops_to_sink: 1,
        };
        let mut raw = PacketHeader::new(MessageType::ClusterInfoUpdate, 1, 2).to_bytes().to_vec();
        raw.extend_from_slice(&update.to_bytes());
        let err = b.on_bytes_received(1, Bytes::from(raw), now).unwrap_err();

        assert_eq!(err, MeshError::StaleClusterUpdate { local: 2, received: 0xDEAD });
        assert_eq!(*b.cluster_state(), before);
        assert_eq!(b.link_phase(1), Some(HandshakePhase::Merged));
        assert_eq!(
            b.handler().events.last().map(|(_, event)| *event),
            Some(HandshakeEvent::StaleUpdate { local: 2, received: 0xDEAD })
        );
    }

    #[test]
    fn test_implicit_link_has_no_write_handle() {
        let now = Instant::now();
        let mut a = node(1);
        let mut b = node(2);
        a.link_ready(3, 7, now);
        deliver(&mut a, &mut b, now);

        assert_eq!(b.links().get(3).unwrap().write_handle(), 0);
        let (_, bytes) = &b.transport()[0];
        let mut buf = bytes.clone();
        let header = PacketHeader::decode(&mut buf).unwrap();
        assert_eq!(header.kind().unwrap(), MessageType::ClusterWelcome);
        assert_eq!(ClusterWelcome::decode(&buf).unwrap().mesh_write_handle, 0);
    }

    #[test]
    fn test_handshake_timeout() {
        let now = Instant::now();
        let mut a = node(1);
        a.link_ready(1, 1, now);

        a.tick(now + Duration::from_secs(1));
        assert_eq!(a.link_phase(1), Some(HandshakePhase::WelcomeSent));

        a.tick(now + DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(a.link_phase(1), Some(HandshakePhase::Idle));
        assert_eq!(
            a.handler().events.last().map(|(_, event)| *event),
            Some(HandshakeEvent::TimedOut {
                phase: HandshakePhase::WelcomeSent
            })
        );
    }

    #[test]
    fn test_link_closed_splits_cluster() {
        let now = Instant::now();
        let mut a = node(1);
        let mut b = node(2);
        a.link_ready(1, 1, now);
        pump(&mut a, &mut b, now);
        assert_eq!(a.cluster_state().cluster_size(), 2);

        a.link_closed(1).unwrap();
        b.link_closed(1).unwrap();
        assert_eq!(a.cluster_state().cluster_size(), 1);
        assert_eq!(b.cluster_state().cluster_size(), 1);
        assert_ne!(a.cluster_state().cluster_id(), b.cluster_state().cluster_id());
        assert!(a.links().is_empty());
        assert_eq!(a.link_closed(1), Err(MeshError::UnknownLink(1)));
    }

    #[test]
    fn test_link_closed_mid_reassembly() {
        let now = Instant::now();
        let mut a = node(1);
        let mut b = node(2);
        a.link_ready(1, 1, now);
        pump(&mut a, &mut b, now);

        let payload: Vec<u8> = (0..26).collect();
        a.send_message(1, MessageType::Data2, &payload).unwrap();
        let (link, first) = a.transport_mut().remove(0);
        b.on_bytes_received(link, first, now).unwrap();
        assert!(b.links().get(1).unwrap().reassembly_in_progress());

        b.link_closed(1).unwrap();
        a.link_closed(1).unwrap();
        a.transport_mut().clear();
        assert!(b.handler().messages.is_empty());

        // the same link id comes back with a clean buffer
        a.link_ready(1, 1, now);
        pump(&mut a, &mut b, now);
        assert!(!b.links().get(1).unwrap().reassembly_in_progress());

        a.send_message(1, MessageType::Data2, &payload).unwrap();
        deliver(&mut a, &mut b, now);
        assert_eq!(b.handler().messages.len(), 1);
        let (_, header, received) = &b.handler().messages[0];
        assert_eq!(header.kind().unwrap(), MessageType::Data2);
        assert_eq!(&received[..], &payload[..]);
    }

    #[test]
    fn test_qos_request_answered() {
        let now = Instant::now();
        let mut a = node(1);
        let mut b = node(2);
        a.link_ready(1, 1, now);
        pump(&mut a, &mut b, now);
        b.record_rssi(1, -55).unwrap();

        a.send_qos_request(1, QosRequest { node_id: 2, kind: 0 }).unwrap();
        pump(&mut a, &mut b, now);

        assert!(matches!(b.handler().reports[0], (1, QosReport::Request(_))));
        let (_, QosReport::ConnectionData(data)) = a.handler().reports[0] else {
            panic!("expected connection data, got {:?}", a.handler().reports);
        };
        assert_eq!(data.entries().collect::<Vec<_>>(), vec![(1, -55)]);

        // addressed to someone else: reported, not answered
        a.send_qos_request(1, QosRequest { node_id: 9, kind: 0 }).unwrap();
        pump(&mut a, &mut b, now);
        assert_eq!(b.handler().reports.len(), 2);
        assert_eq!(a.handler().reports.len(), 1);
    }

    #[test]
    fn test_send_data_capacity() {
        let now = Instant::now();
        let mut a = node(1);
        a.link_ready(1, 1, now);
        a.transport_mut().clear();

        let fits = Bytes::from(vec![7u8; DataPayload::capacity(DEFAULT_WRITE_UNIT)]);
        assert_eq!(a.send_data(1, DataChannel::Data2, fits).unwrap(), 1);
        assert_eq!(a.transport()[0].1.len(), DEFAULT_WRITE_UNIT);
        assert_eq!(a.transport()[0].1[0] >> 1, MessageType::Data2.code());

        let too_big = Bytes::from(vec![7u8; DataPayload::capacity(DEFAULT_WRITE_UNIT) + 1]);
        assert!(matches!(
            a.send_data(1, DataChannel::Data1, too_big),
            Err(MeshError::Wire(WireError::PayloadTooLarge { .. }))
        ));
        assert_eq!(a.send_data(9, DataChannel::Data1, Bytes::new()), Err(MeshError::UnknownLink(9)));
    }

    #[test]
    fn test_module_request() {
        let now = Instant::now();
        let mut a = node(1);
        let mut b = node(2);
        a.link_ready(1, 1, now);
        pump(&mut a, &mut b, now);

        let request = ModuleRequest::new(3, Bytes::from_static(b"on"));
        a.send_module_request(1, ModuleAction::SetActive, &request).unwrap();
        pump(&mut a, &mut b, now);

        let (_, header, payload) = b.handler().messages.last().unwrap();
        assert_eq!(header.kind().unwrap(), MessageType::ModuleSetActive);
        assert_eq!(ModuleRequest::decode(payload).unwrap(), request);
    }

    #[test]
    fn test_set_sink_propagates_hops() {
        let now = Instant::now();
        let mut a = node(1);
        let mut b = node(2);
        a.link_ready(1, 1, now);
        pump(&mut a, &mut b, now);
        assert_eq!(b.cluster_state().hops_to_sink(), NO_SINK);

        a.set_sink(true);
        pump(&mut a, &mut b, now);
        assert_eq!(a.cluster_state().hops_to_sink(), 0);
        assert_eq!(b.cluster_state().hops_to_sink(), 1);

        a.set_sink(false);
        pump(&mut a, &mut b, now);
        assert_eq!(a.cluster_state().hops_to_sink(), NO_SINK);
        assert_eq!(b.cluster_state().hops_to_sink(), NO_SINK);
    }
}
