//! Per-link cluster merge handshake.
//!
//! Both ends of a new link announce their cluster with `CLUSTER_WELCOME`.
//! Once a side knows both announcements it decides the merge the same way
//! the peer does: the larger cluster wins, equal sizes go to the larger
//! cluster id. The losing side answers `CLUSTER_ACK_1`, the winning side
//! answers that with the authoritative `CLUSTER_ACK_2`.
//!
//! ```text
//!            link ready / WELCOME in Idle
//!   Idle ───────────────────────────────▶ WelcomeSent
//!                                            │ peer WELCOME
//!                   ┌────────── we win ──────┴───── we lose, send ACK_1 ──┐
//!                   ▼                                                     ▼
//!            WelcomeReceived ──ACK_1, send ACK_2──▶ Merged ◀──ACK_2── Ack1Exchanged
//! ```
//!
//! The ACK_2 exchange completes inside a single transition, so there is no
//! resting state between ACK_2 and `Merged`.
//!
//! A merged link keeps the size of the cluster part behind it and the hop
//! count its peer advertised, which is what `CLUSTER_INFO_UPDATE` deltas and
//! link loss are accounted against.
//!
//! When both ends of a merged link change cluster id at the same time, their
//! updates cross and each names an id the receiver has already left. Such an
//! update still carries a valid size delta, so it is applied as long as its
//! `current_cluster_id` is one the link has carried since the two ends last
//! agreed. The id is settled by the merge roles: the side that won the merge
//! on this link keeps its id, the side that joined takes the winner's.

use mesh_wire::{
    ClusterAck1, ClusterAck2, ClusterId, ClusterInfoUpdate, ClusterSize, ClusterWelcome,
    FixedPayload, MessageType, NodeId, NO_SINK,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::MeshError;
use crate::state::{generate_cluster_id, ClusterState};

/// Observable handshake phase of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakePhase {
    /// No handshake in progress
    Idle,
    /// Our WELCOME is out, the peer's has not arrived
    WelcomeSent,
    /// Both WELCOMEs known, we won and wait for ACK_1
    WelcomeReceived,
    /// Both WELCOMEs known, we lost, sent ACK_1 and wait for ACK_2
    Ack1Exchanged,
    /// Merge complete
    Merged,
}

/// Which side of the merge this node was on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeRole {
    /// Our cluster absorbed the peer's
    Won,
    /// We joined the peer's cluster
    Joined,
}

/// Bookkeeping of a merged link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedLink {
    /// Side of the merge this node was on
    pub role: MergeRole,
    /// Nodes reachable through this link
    pub subtree_size: ClusterSize,
    /// Hops to sink advertised by the peer, not counting this node
    pub peer_hops: ClusterSize,
}

/// A handshake message ready to be framed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// CLUSTER_WELCOME
    Welcome(ClusterWelcome),
    /// CLUSTER_ACK_1
    Ack1(ClusterAck1),
    /// CLUSTER_ACK_2
    Ack2(ClusterAck2),
    /// CLUSTER_INFO_UPDATE
    InfoUpdate(ClusterInfoUpdate),
}

impl HandshakeMessage {
    /// Message type on the wire
    pub fn message_type(&self) -> MessageType {
        match self {
            HandshakeMessage::Welcome(_) => MessageType::ClusterWelcome,
            HandshakeMessage::Ack1(_) => MessageType::ClusterAck1,
            HandshakeMessage::Ack2(_) => MessageType::ClusterAck2,
            HandshakeMessage::InfoUpdate(_) => MessageType::ClusterInfoUpdate,
        }
    }

    /// Encoded payload
    pub fn to_bytes(&self) -> Bytes {
        match self {
            HandshakeMessage::Welcome(payload) => payload.to_bytes(),
            HandshakeMessage::Ack1(payload) => payload.to_bytes(),
            HandshakeMessage::Ack2(payload) => payload.to_bytes(),
            HandshakeMessage::InfoUpdate(payload) => payload.to_bytes(),
        }
    }
}

/// Events surfaced to the cluster-management collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeEvent {
    /// The peer announced its cluster
    WelcomeReceived {
        /// Announcing node
        remote_node: NodeId,
        /// The announcement
        welcome: ClusterWelcome,
    },
    /// A WELCOME arrived mid-handshake from a node with a higher id
    WelcomeIgnored {
        /// Announcing node
        remote_node: NodeId,
    },
    /// Both ends already share a cluster; the link should be dropped
    SameCluster {
        /// The shared cluster
        cluster_id: ClusterId,
    },
    /// The link completed a merge
    Merged {
        /// Side of the merge this node was on
        role: MergeRole,
        /// Cluster after the merge
        cluster_id: ClusterId,
        /// Size after the merge
        cluster_size: ClusterSize,
        /// Hops to sink after the merge
        hops_to_sink: ClusterSize,
    },
    /// An INFO_UPDATE from this link changed the cluster
    ClusterUpdated {
        /// Cluster before the update
        previous_cluster_id: ClusterId,
        /// Cluster after the update
        cluster_id: ClusterId,
        /// Size after the update
        cluster_size: ClusterSize,
        /// Applied size change
        size_change: ClusterSize,
        /// Hops to sink after the update
        hops_to_sink: ClusterSize,
    },
    /// A merged link went away and took its part of the cluster with it
    LinkLost {
        /// Cluster before the split
        previous_cluster_id: ClusterId,
        /// Cluster after the split
        cluster_id: ClusterId,
        /// Size after the split
        cluster_size: ClusterSize,
        /// Applied size change
        size_change: ClusterSize,
    },
    /// The handshake did not complete in time and was reset
    TimedOut {
        /// Phase the handshake was stuck in
        phase: HandshakePhase,
    },
    /// A handshake message arrived out of sequence and the link was reset
    UnexpectedMessage {
        /// Type of the offending message
        message_type: MessageType,
        /// Phase the link was in
        phase: HandshakePhase,
    },
    /// An INFO_UPDATE for a cluster this link never carried was ignored
    StaleUpdate {
        /// Our cluster
        local: ClusterId,
        /// Cluster the update was meant for
        received: ClusterId,
    },
}

/// How a received WELCOME was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WelcomeVerdict {
    /// Dropped in favor of the handshake in progress
    Ignored,
    /// Both sides are in the same cluster
    SameCluster(ClusterId),
    /// We win and wait for ACK_1
    Winning,
    /// We lose and wait for ACK_2
    Joining,
}

/// Result of processing a WELCOME
#[derive(Debug, Clone)]
pub struct WelcomeOutcome {
    /// Messages to send back on the link, in order
    pub replies: SmallVec<[HandshakeMessage; 2]>,
    /// Resolution of the WELCOME
    pub verdict: WelcomeVerdict,
}

/// Result of completing a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Side of the merge this node was on
    pub role: MergeRole,
    /// ACK_2 to send back, for the winning side
    pub reply: Option<HandshakeMessage>,
    /// Cluster before the merge
    pub previous_cluster_id: ClusterId,
    /// Size change other neighbors have to apply
    pub size_change: ClusterSize,
    /// Growth of our cluster since our WELCOME, owed to the winning side
    pub drift: ClusterSize,
}

/// Result of applying an INFO_UPDATE or losing a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaOutcome {
    /// Cluster before the change
    pub previous_cluster_id: ClusterId,
    /// Size change actually applied
    pub size_change: ClusterSize,
    /// The peer's advertised hop count changed
    pub peer_hops_changed: bool,
    /// The update crossed one of ours on the way
    pub crossed: bool,
}

const KNOWN_IDS: usize = 8;

/// Cluster ids a merged link has carried since its ends last agreed
#[derive(Debug, Clone)]
struct KnownIds(SmallVec<[ClusterId; KNOWN_IDS]>);

impl KnownIds {
    fn new(cluster_id: ClusterId) -> Self {
        let mut ids = SmallVec::new();
        ids.push(cluster_id);
        Self(ids)
    }

    fn contains(&self, cluster_id: ClusterId) -> bool {
        self.0.contains(&cluster_id)
    }

    fn record(&mut self, cluster_id: ClusterId) {
        if self.contains(cluster_id) {
            return;
        }
        if self.0.len() == KNOWN_IDS {
            self.0.remove(0);
        }
        self.0.push(cluster_id);
    }

    fn reset(&mut self, cluster_id: ClusterId) {
        self.0.clear();
        self.0.push(cluster_id);
    }
}

#[derive(Debug, Clone)]
enum LinkState {
    Idle,
    WelcomeSent {
        local: ClusterWelcome,
        started: Instant,
    },
    WelcomeReceived {
        local: ClusterWelcome,
        remote: ClusterWelcome,
        started: Instant,
    },
    Ack1Exchanged {
        local: ClusterWelcome,
        remote: ClusterWelcome,
        started: Instant,
    },
    Merged { link: MergedLink, known: KnownIds },
}

/// Whether our announcement wins over the peer's
///
/// Both sides evaluate the same pair of announcements, so they always agree.
pub fn local_cluster_wins(local: &ClusterWelcome, remote: &ClusterWelcome) -> bool {
    (local.cluster_size, local.cluster_id) > (remote.cluster_size, remote.cluster_id)
}

/// Best hop count given the hop counts advertised by merged peers
pub fn best_hops<I>(is_sink: bool, peer_hops: I) -> ClusterSize
where
    I: IntoIterator<Item = ClusterSize>,
{
    if is_sink {
        return 0;
    }
    peer_hops
        .into_iter()
        .filter(|hops| *hops >= 0)
        .map(|hops| hops.saturating_add(1))
        .min()
        .unwrap_or(NO_SINK)
}

/// Store a recomputed hop count, reporting whether it changed
pub(crate) fn refresh_hops(state: &mut ClusterState, hops: ClusterSize) -> bool {
    if state.hops_to_sink() == hops {
        return false;
    }
    state.set_hops_to_sink(hops);
    true
}

/// Take a shorter sink path offered by a newly merged peer
fn improve_hops(state: &mut ClusterState, peer_hops: ClusterSize) {
    if peer_hops < 0 {
        return;
    }
    let candidate = peer_hops.saturating_add(1);
    if !state.has_sink() || candidate < state.hops_to_sink() {
        state.set_hops_to_sink(candidate);
    }
}

/// Handshake state of one link
#[derive(Debug, Clone)]
pub struct LinkHandshake {
    state: LinkState,
}

impl LinkHandshake {
    /// Create an idle handshake
    pub fn new() -> Self {
        Self {
            state: LinkState::Idle,
        }
    }

    /// Current phase
    pub fn phase(&self) -> HandshakePhase {
        match self.state {
            LinkState::Idle => HandshakePhase::Idle,
            LinkState::WelcomeSent { .. } => HandshakePhase::WelcomeSent,
            LinkState::WelcomeReceived { .. } => HandshakePhase::WelcomeReceived,
            LinkState::Ack1Exchanged { .. } => HandshakePhase::Ack1Exchanged,
            LinkState::Merged { .. } => HandshakePhase::Merged,
        }
    }

    /// Merge bookkeeping, if the link is merged
    pub fn merged(&self) -> Option<&MergedLink> {
        match &self.state {
            LinkState::Merged { link, .. } => Some(link),
            _ => None,
        }
    }

    /// Whether the link is merged
    pub fn is_merged(&self) -> bool {
        self.merged().is_some()
    }

    /// The peer's announcement for the handshake in progress
    pub fn remote_welcome(&self) -> Option<&ClusterWelcome> {
        match &self.state {
            LinkState::WelcomeReceived { remote, .. } | LinkState::Ack1Exchanged { remote, .. } => {
                Some(remote)
            }
            _ => None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = LinkState::Idle;
    }

    fn unexpected(&mut self, message_type: MessageType) -> MeshError {
        let phase = self.phase();
        self.reset();
        MeshError::UnexpectedHandshakeMessage {
            message_type,
            phase,
        }
    }

    /// Announce our cluster on this link
    pub(crate) fn start(&mut self, state: &ClusterState, write_handle: u16, now: Instant) -> ClusterWelcome {
        let local = ClusterWelcome {
            cluster_id: state.cluster_id(),
            cluster_size: state.cluster_size(),
            mesh_write_handle: write_handle,
            hops_to_sink: state.hops_to_sink(),
        };
        self.state = LinkState::WelcomeSent {
            local,
            started: now,
        };
        local
    }

    /// Process the peer's WELCOME
    ///
    /// A merged link must be severed by the caller first.
    pub(crate) fn on_welcome(
        &mut self,
        state: &ClusterState,
        remote: ClusterWelcome,
        local_node: NodeId,
        remote_node: NodeId,
        write_handle: u16,
        now: Instant,
    ) -> WelcomeOutcome {
        let mut replies = SmallVec::new();

        let (local, started) = match self.state {
            LinkState::WelcomeSent { local, started } => (local, started),
            LinkState::WelcomeReceived { .. } | LinkState::Ack1Exchanged { .. }
                if remote_node >= local_node =>
            {
                debug!(
                    "Ignoring WELCOME from node {} during {:?}",
                    remote_node,
                    self.phase()
                );
                return WelcomeOutcome {
                    replies,
                    verdict: WelcomeVerdict::Ignored,
                };
            }
            _ => {
                if self.phase() != HandshakePhase::Idle {
                    debug!(
                        "Restarting handshake for WELCOME from node {} during {:?}",
                        remote_node,
                        self.phase()
                    );
                }
                let local = self.start(state, write_handle, now);
                replies.push(HandshakeMessage::Welcome(local));
                (local, now)
            }
        };

        if local.cluster_id == remote.cluster_id {
            self.reset();
            return WelcomeOutcome {
                replies,
                verdict: WelcomeVerdict::SameCluster(local.cluster_id),
            };
        }

        let verdict = if local_cluster_wins(&local, &remote) {
            self.state = LinkState::WelcomeReceived {
                local,
                remote,
                started,
            };
            WelcomeVerdict::Winning
        } else {
            self.state = LinkState::Ack1Exchanged {
                local,
                remote,
                started,
            };
            replies.push(HandshakeMessage::Ack1(ClusterAck1::new(state.hops_to_sink())));
            WelcomeVerdict::Joining
        };

        WelcomeOutcome { replies, verdict }
    }

    /// Winning side: the peer agreed to join, commit the merge
    pub(crate) fn on_ack1(&mut self, state: &mut ClusterState, ack: ClusterAck1) -> Result<MergeOutcome, MeshError> {
        let LinkState::WelcomeReceived { remote, .. } = self.state else {
            return Err(self.unexpected(MessageType::ClusterAck1));
        };

        let joined = remote.cluster_size.max(1);
        let previous_cluster_id = state.cluster_id();
        let size_change = state.apply_size_change(joined);
        improve_hops(state, ack.hops_to_sink);

        self.state = LinkState::Merged {
            link: MergedLink {
                role: MergeRole::Won,
                subtree_size: joined,
                peer_hops: ack.hops_to_sink.max(NO_SINK),
            },
            known: KnownIds::new(state.cluster_id()),
        };

        Ok(MergeOutcome {
            role: MergeRole::Won,
            reply: Some(HandshakeMessage::Ack2(ClusterAck2 {
                cluster_id: state.cluster_id(),
                cluster_size: state.cluster_size(),
            })),
            previous_cluster_id,
            size_change,
            drift: 0,
        })
    }

    /// Joining side: adopt the merged cluster
    ///
    /// ACK_2 is computed from our WELCOME. If our cluster grew since then, the
    /// growth is added here and reported as `drift` so the winning side can
    /// be told about it.
    pub(crate) fn on_ack2(&mut self, state: &mut ClusterState, ack: ClusterAck2) -> Result<MergeOutcome, MeshError> {
        let LinkState::Ack1Exchanged { local, remote, .. } = self.state else {
            return Err(self.unexpected(MessageType::ClusterAck2));
        };

        let previous_cluster_id = state.cluster_id();
        let live_size = state.cluster_size();
        let drift = live_size.saturating_sub(local.cluster_size);

        state.adopt(ack.cluster_id, ack.cluster_size.saturating_add(drift));
        let size_change = state.cluster_size().saturating_sub(live_size);
        improve_hops(state, remote.hops_to_sink);

        self.state = LinkState::Merged {
            link: MergedLink {
                role: MergeRole::Joined,
                subtree_size: size_change.max(1),
                peer_hops: remote.hops_to_sink.max(NO_SINK),
            },
            known: KnownIds::new(ack.cluster_id),
        };

        Ok(MergeOutcome {
            role: MergeRole::Joined,
            reply: None,
            previous_cluster_id,
            size_change,
            drift,
        })
    }

    /// Note a cluster id we announced to the peer
    pub(crate) fn announce(&mut self, cluster_id: ClusterId) {
        if let LinkState::Merged { known, .. } = &mut self.state {
            known.record(cluster_id);
        }
    }

    /// Apply a delta received from the peer
    ///
    /// The update must target our cluster or an id this link carried since
    /// both ends last agreed; anything else is stale and leaves the state
    /// untouched. A crossed update keeps its size delta, and only the side
    /// that joined over this link follows the peer's new id.
    pub(crate) fn on_info_update(
        &mut self,
        state: &mut ClusterState,
        update: ClusterInfoUpdate,
    ) -> Result<DeltaOutcome, MeshError> {
        let LinkState::Merged { link: merged, known } = &mut self.state else {
            return Err(self.unexpected(MessageType::ClusterInfoUpdate));
        };

        let previous_cluster_id = state.cluster_id();
        let in_sync = update.current_cluster_id == previous_cluster_id;
        if !in_sync && !known.contains(update.current_cluster_id) {
            return Err(MeshError::StaleClusterUpdate {
                local: previous_cluster_id,
                received: update.current_cluster_id,
            });
        }

        let renamed = update.new_cluster_id != update.current_cluster_id;
        let follow = renamed && (in_sync || merged.role == MergeRole::Joined);
        if in_sync {
            known.reset(previous_cluster_id);
        }
        known.record(update.new_cluster_id);

        let peer_hops = update.hops_to_sink.max(NO_SINK);
        let peer_hops_changed = merged.peer_hops != peer_hops;
        merged.peer_hops = peer_hops;
        merged.subtree_size = merged
            .subtree_size
            .saturating_add(update.cluster_size_change)
            .max(1);

        let size_change = state.apply_size_change(update.cluster_size_change);
        if follow && update.new_cluster_id != previous_cluster_id {
            state.set_cluster_id(update.new_cluster_id);
        }

        Ok(DeltaOutcome {
            previous_cluster_id,
            size_change,
            peer_hops_changed,
            crossed: !in_sync,
        })
    }

    /// Tear the link out of the cluster
    ///
    /// Returns `None` if the link was not merged. The side that joined over
    /// this link founds a new cluster id so the two halves stay distinct.
    pub(crate) fn sever(
        &mut self,
        state: &mut ClusterState,
        node_id: NodeId,
        counter: &mut u16,
    ) -> Option<DeltaOutcome> {
        let merged = *self.merged()?;
        self.reset();

        let previous_cluster_id = state.cluster_id();
        let size_change = state.apply_size_change(merged.subtree_size.saturating_neg());
        if merged.role == MergeRole::Joined {
            *counter = counter.wrapping_add(1).max(1);
            state.set_cluster_id(generate_cluster_id(node_id, *counter));
        }

        Some(DeltaOutcome {
            previous_cluster_id,
            size_change,
            peer_hops_changed: merged.peer_hops >= 0,
            crossed: false,
        })
    }

    /// Reset a handshake stuck for longer than `timeout`
    pub(crate) fn expire(&mut self, now: Instant, timeout: Duration) -> Option<HandshakePhase> {
        let started = match self.state {
            LinkState::WelcomeSent { started, .. }
            | LinkState::WelcomeReceived { started, .. }
            | LinkState::Ack1Exchanged { started, .. } => started,
            LinkState::Idle | LinkState::Merged { .. } => return None,
        };
        if now.saturating_duration_since(started) < timeout {
            return None;
        }
        let phase = self.phase();
        self.reset();
        Some(phase)
    }
}

impl Default for LinkHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn welcome(cluster_id: ClusterId, cluster_size: ClusterSize, hops: ClusterSize) -> ClusterWelcome {
        ClusterWelcome {
            cluster_id,
            cluster_size,
            mesh_write_handle: 1,
            hops_to_sink: hops,
        }
    }

    #[test]
    fn test_winner_rule() {
        assert!(local_cluster_wins(&welcome(5, 3, 2), &welcome(9, 1, -1)));
        assert!(!local_cluster_wins(&welcome(9, 1, -1), &welcome(5, 3, 2)));
        // equal size goes to the larger id
        assert!(local_cluster_wins(&welcome(9, 2, -1), &welcome(5, 2, -1)));
        assert!(!local_cluster_wins(&welcome(5, 2, -1), &welcome(9, 2, -1)));
    }

    #[test]
    fn test_best_hops() {
        assert_eq!(best_hops(true, [3, 4]), 0);
        assert_eq!(best_hops(false, [NO_SINK, 3, 1]), 2);
        assert_eq!(best_hops(false, [NO_SINK]), NO_SINK);
        assert_eq!(best_hops(false, Vec::new()), NO_SINK);
    }

    #[test]
    fn test_two_sided_merge() {
        let now = Instant::now();
        let mut a_state = ClusterState::new(5, 3, 2);
        let mut b_state = ClusterState::new(9, 1, NO_SINK);
        let mut a = LinkHandshake::new();
        let mut b = LinkHandshake::new();

        let a_welcome = a.start(&a_state, 1, now);
        assert_eq!(a.phase(), HandshakePhase::WelcomeSent);

        // B answers from Idle with its own WELCOME and, losing, ACK_1
        let b_out = b.on_welcome(&b_state, a_welcome, 2, 1, 1, now);
        assert_eq!(b_out.verdict, WelcomeVerdict::Joining);
        assert_eq!(b.phase(), HandshakePhase::Ack1Exchanged);
        assert_eq!(b_out.replies.len(), 2);
        let HandshakeMessage::Welcome(b_welcome) = b_out.replies[0] else {
            panic!("expected WELCOME, got {:?}", b_out.replies[0]);
        };
        let HandshakeMessage::Ack1(ack1) = b_out.replies[1] else {
            panic!("expected ACK_1, got {:?}", b_out.replies[1]);
        };
        assert_eq!(ack1.hops_to_sink, NO_SINK);

        let a_out = a.on_welcome(&a_state, b_welcome, 1, 2, 1, now);
        assert_eq!(a_out.verdict, WelcomeVerdict::Winning);
        assert!(a_out.replies.is_empty());
        assert_eq!(a.phase(), HandshakePhase::WelcomeReceived);

        let a_merge = a.on_ack1(&mut a_state, ack1).unwrap();
        assert_eq!(a_merge.size_change, 1);
        let Some(HandshakeMessage::Ack2(ack2)) = a_merge.reply else {
            panic!("winner must answer ACK_2");
        };
        assert_eq!(ack2, ClusterAck2 { cluster_id: 5, cluster_size: 4 });

        let b_merge = b.on_ack2(&mut b_state, ack2).unwrap();
        assert_eq!(b_merge.drift, 0);
        assert_eq!(b_merge.size_change, 3);

        assert_eq!((a_state.cluster_id(), a_state.cluster_size()), (5, 4));
        assert_eq!((b_state.cluster_id(), b_state.cluster_size()), (5, 4));
        assert_eq!(a_state.hops_to_sink(), 2);
        assert_eq!(b_state.hops_to_sink(), 3);
        assert_eq!(a.merged().unwrap().subtree_size, 1);
        assert_eq!(b.merged().unwrap().subtree_size, 3);
        assert_eq!(b.merged().unwrap().role, MergeRole::Joined);
    }

    #[test]
    fn test_same_cluster() {
        let now = Instant::now();
        let state = ClusterState::new(7, 2, NO_SINK);
        let mut link = LinkHandshake::new();
        link.start(&state, 1, now);

        let outcome = link.on_welcome(&state, welcome(7, 2, NO_SINK), 1, 2, 1, now);
        assert_eq!(outcome.verdict, WelcomeVerdict::SameCluster(7));
        assert_eq!(link.phase(), HandshakePhase::Idle);
    }

    #[test]
    fn test_unexpected_ack2_resets() {
        let mut state = ClusterState::new(7, 2, NO_SINK);
        let mut link = LinkHandshake::new();

        let err = link
            .on_ack2(&mut state, ClusterAck2 { cluster_id: 1, cluster_size: 9 })
            .unwrap_err();
        assert_eq!(
            err,
            MeshError::UnexpectedHandshakeMessage {
                message_type: MessageType::ClusterAck2,
                phase: HandshakePhase::Idle
            }
        );
        assert_eq!(state, ClusterState::new(7, 2, NO_SINK));

        link.start(&state, 1, Instant::now());
        assert!(link.on_ack1(&mut state, ClusterAck1::new(0)).is_err());
        assert_eq!(link.phase(), HandshakePhase::Idle);
    }

    #[test]
    fn test_welcome_mid_handshake_tie_break() {
        let now = Instant::now();
        let state = ClusterState::new(7, 1, NO_SINK);

        // we are node 5 and lost against node 8; a second WELCOME from 8 is ignored
        let mut link = LinkHandshake::new();
        link.start(&state, 1, now);
        link.on_welcome(&state, welcome(8, 4, NO_SINK), 5, 8, 1, now);
        assert_eq!(link.phase(), HandshakePhase::Ack1Exchanged);
        let outcome = link.on_welcome(&state, welcome(8, 4, NO_SINK), 5, 8, 1, now);
        assert_eq!(outcome.verdict, WelcomeVerdict::Ignored);
        assert!(outcome.replies.is_empty());
        assert_eq!(link.phase(), HandshakePhase::Ack1Exchanged);

        // against lower node 3 we restart from its WELCOME
        let mut link = LinkHandshake::new();
        link.start(&state, 1, now);
        link.on_welcome(&state, welcome(3, 4, NO_SINK), 5, 3, 1, now);
        let outcome = link.on_welcome(&state, welcome(3, 4, NO_SINK), 5, 3, 1, now);
        assert_eq!(outcome.verdict, WelcomeVerdict::Joining);
        assert!(matches!(outcome.replies[0], HandshakeMessage::Welcome(_)));
        assert!(matches!(outcome.replies[1], HandshakeMessage::Ack1(_)));
    }

    #[test]
    fn test_joining_side_reports_drift() {
        let now = Instant::now();
        let mut state = ClusterState::new(2, 1, NO_SINK);
        let mut link = LinkHandshake::new();
        link.start(&state, 1, now);
        link.on_welcome(&state, welcome(3, 1, NO_SINK), 2, 3, 1, now);
        assert_eq!(link.phase(), HandshakePhase::Ack1Exchanged);

        // another link grew our cluster before ACK_2 arrived
        state.apply_size_change(1);

        let outcome = link
            .on_ack2(&mut state, ClusterAck2 { cluster_id: 3, cluster_size: 2 })
            .unwrap();
        assert_eq!(outcome.drift, 1);
        assert_eq!(outcome.size_change, 1);
        assert_eq!(state.cluster_size(), 3);
        assert_eq!(link.merged().unwrap().subtree_size, 1);
    }

    fn merged_link(state: &mut ClusterState, role_won: bool) -> LinkHandshake {
        let now = Instant::now();
        let mut link = LinkHandshake::new();
        link.start(state, 1, now);
        if role_won {
            link.on_welcome(state, welcome(1, 1, NO_SINK), 9, 1, 1, now);
            link.on_ack1(state, ClusterAck1::new(NO_SINK)).unwrap();
        } else {
            link.on_welcome(state, welcome(0xFFFF, 50, 1), 9, 1, 1, now);
            let size = state.cluster_size() + 50;
            link.on_ack2(state, ClusterAck2 { cluster_id: 0xFFFF, cluster_size: size }).unwrap();
        }
        link
    }

    #[test]
    fn test_info_update_applies_delta() {
        let mut state = ClusterState::new(100, 3, NO_SINK);
        let mut link = merged_link(&mut state, true);
        assert_eq!(state.cluster_size(), 4);

        let outcome = link
            .on_info_update(
                &mut state,
                ClusterInfoUpdate {
                    current_cluster_id: 100,
                    new_cluster_id: 100,
                    cluster_size_change: 2,
                    hops_to_sink: 1,
                },
            )
            .unwrap();
        assert_eq!(outcome.size_change, 2);
        assert!(outcome.peer_hops_changed);
        assert_eq!(state.cluster_size(), 6);
        assert_eq!(link.merged().unwrap().subtree_size, 3);
        assert_eq!(link.merged().unwrap().peer_hops, 1);
    }

    #[test]
    fn test_info_update_never_below_one() {
        let mut state = ClusterState::new(100, 1, NO_SINK);
        let mut link = merged_link(&mut state, true);

        for change in [-1, -5, 3, i16::MIN, -2] {
            link.on_info_update(
                &mut state,
                ClusterInfoUpdate {
                    current_cluster_id: 100,
                    new_cluster_id: 100,
                    cluster_size_change: change,
                    hops_to_sink: NO_SINK,
                },
            )
            .unwrap();
            assert!(state.cluster_size() >= 1);
            assert!(link.merged().unwrap().subtree_size >= 1);
        }
    }

    #[test]
    fn test_stale_info_update_rejected() {
        let mut state = ClusterState::new(100, 3, NO_SINK);
        let mut link = merged_link(&mut state, true);
        let before = state;

        let err = link
            .on_info_update(
                &mut state,
                ClusterInfoUpdate {
                    current_cluster_id: 42,
                    new_cluster_id: 43,
                    cluster_size_change: 5,
                    hops_to_sink: 0,
                },
            )
            .unwrap_err();
        assert_eq!(err, MeshError::StaleClusterUpdate { local: 100, received: 42 });
        assert_eq!(state, before);
        assert!(link.is_merged());
    }

    #[test]
    fn test_info_update_before_merge_is_unexpected() {
        let mut state = ClusterState::new(100, 3, NO_SINK);
        let mut link = LinkHandshake::new();
        link.start(&state, 1, Instant::now());

        let err = link
            .on_info_update(
                &mut state,
                ClusterInfoUpdate {
                    current_cluster_id: 100,
                    new_cluster_id: 100,
                    cluster_size_change: 1,
                    hops_to_sink: 0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, MeshError::UnexpectedHandshakeMessage { .. }));
        assert_eq!(link.phase(), HandshakePhase::Idle);
    }

    #[test]
    fn test_sever_winner_keeps_id() {
        let mut state = ClusterState::new(100, 3, NO_SINK);
        let mut link = merged_link(&mut state, true);
        let mut counter = 0;

        let outcome = link.sever(&mut state, 9, &mut counter).unwrap();
        assert_eq!(outcome.size_change, -1);
        assert_eq!(state.cluster_id(), 100);
        assert_eq!(state.cluster_size(), 3);
        assert_eq!(counter, 0);
        assert!(link.sever(&mut state, 9, &mut counter).is_none());
    }

    #[test]
    fn test_sever_joined_side_renews_id() {
        let mut state = ClusterState::new(9, 2, NO_SINK);
        let mut link = merged_link(&mut state, false);
        assert_eq!(state.cluster_id(), 0xFFFF);
        assert_eq!(state.cluster_size(), 52);
        assert_eq!(state.hops_to_sink(), 2);

        let mut counter = 0;
        let outcome = link.sever(&mut state, 9, &mut counter).unwrap();
        assert_eq!(outcome.previous_cluster_id, 0xFFFF);
        assert_eq!(outcome.size_change, -50);
        assert!(outcome.peer_hops_changed);
        assert_eq!(state.cluster_size(), 2);
        assert_eq!(state.cluster_id(), generate_cluster_id(9, 1));
    }

    #[test]
    fn test_expire() {
        let start = Instant::now();
        let state = ClusterState::new(1, 1, NO_SINK);
        let mut link = LinkHandshake::new();
        link.start(&state, 1, start);

        let timeout = Duration::from_secs(2);
        assert_eq!(link.expire(start + Duration::from_secs(1), timeout), None);
        assert_eq!(
            link.expire(start + timeout, timeout),
            Some(HandshakePhase::WelcomeSent)
        );
        assert_eq!(link.phase(), HandshakePhase::Idle);
    }

    fn update(current: ClusterId, new: ClusterId, change: ClusterSize) -> ClusterInfoUpdate {
        ClusterInfoUpdate {
            current_cluster_id: current,
            new_cluster_id: new,
            cluster_size_change: change,
            hops_to_sink: NO_SINK,
        }
    }

    #[test]
    fn test_crossed_update_winner_keeps_id() {
        let mut state = ClusterState::new(100, 3, NO_SINK);
        let mut link = merged_link(&mut state, true);

        // we moved to 200 and told the peer while it moved to 300
        state.set_cluster_id(200);
        link.announce(200);

        let outcome = link.on_info_update(&mut state, update(100, 300, 2)).unwrap();
        assert!(outcome.crossed);
        assert_eq!(outcome.size_change, 2);
        assert_eq!(state.cluster_id(), 200);
        assert_eq!(state.cluster_size(), 6);
        assert_eq!(link.merged().unwrap().subtree_size, 3);

        // the peer's follow-up still names the id it left
        let outcome = link.on_info_update(&mut state, update(300, 300, 1)).unwrap();
        assert!(outcome.crossed);
        assert_eq!(state.cluster_id(), 200);
        assert_eq!(state.cluster_size(), 7);
    }

    #[test]
    fn test_crossed_update_joined_side_follows() {
        let mut state = ClusterState::new(9, 2, NO_SINK);
        let mut link = merged_link(&mut state, false);
        assert_eq!(state.cluster_id(), 0xFFFF);

        state.set_cluster_id(0x1234);
        link.announce(0x1234);

        let outcome = link.on_info_update(&mut state, update(0xFFFF, 0x5555, 1)).unwrap();
        assert!(outcome.crossed);
        assert_eq!(outcome.previous_cluster_id, 0x1234);
        assert_eq!(state.cluster_id(), 0x5555);
        assert_eq!(state.cluster_size(), 53);

        // a size-only update does not pull us back
        link.on_info_update(&mut state, update(0x1234, 0x1234, 0)).unwrap();
        assert_eq!(state.cluster_id(), 0x5555);
    }

    #[test]
    fn test_agreement_forgets_old_ids() {
        let mut state = ClusterState::new(100, 3, NO_SINK);
        let mut link = merged_link(&mut state, true);

        link.on_info_update(&mut state, update(100, 150, 0)).unwrap();
        assert_eq!(state.cluster_id(), 150);
        link.on_info_update(&mut state, update(150, 150, 1)).unwrap();

        // both ends agreed on 150, so 100 is foreign again
        let before = state;
        let err = link.on_info_update(&mut state, update(100, 400, 1)).unwrap_err();
        assert_eq!(err, MeshError::StaleClusterUpdate { local: 150, received: 100 });
        assert_eq!(state, before);
    }
}
