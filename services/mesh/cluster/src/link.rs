//! Per-link bookkeeping.

use std::collections::BTreeMap;

use mesh_wire::{ClusterSize, NodeId, ReassemblyConfig, Reassembler, BROADCAST_NODE_ID};

use crate::handshake::LinkHandshake;

/// Link identifier assigned by the link layer
pub type LinkId = u16;

/// Everything a node tracks about one direct link
#[derive(Debug)]
pub struct LinkContext {
    pub(crate) remote_node: Option<NodeId>,
    pub(crate) write_handle: u16,
    pub(crate) reassembler: Reassembler,
    pub(crate) handshake: LinkHandshake,
    pub(crate) rssi: Option<i8>,
}

impl LinkContext {
    pub(crate) fn new(write_handle: u16, reassembly: ReassemblyConfig) -> Self {
        Self {
            remote_node: None,
            write_handle,
            reassembler: Reassembler::new(reassembly),
            handshake: LinkHandshake::new(),
            rssi: None,
        }
    }

    /// Peer node id, once it has sent anything
    pub fn remote_node(&self) -> Option<NodeId> {
        self.remote_node
    }

    /// Handle advertised in our WELCOME
    pub fn write_handle(&self) -> u16 {
        self.write_handle
    }

    /// Handshake state
    pub fn handshake(&self) -> &LinkHandshake {
        &self.handshake
    }

    /// Last recorded signal strength
    pub fn rssi(&self) -> Option<i8> {
        self.rssi
    }

    /// Whether a partial message is buffered
    pub fn reassembly_in_progress(&self) -> bool {
        self.reassembler.in_progress()
    }

    /// Receiver id for messages sent on this link
    pub fn receiver(&self) -> NodeId {
        self.remote_node.unwrap_or(BROADCAST_NODE_ID)
    }
}

/// Links of a node, ordered by id
#[derive(Debug, Default)]
pub struct LinkTable {
    links: BTreeMap<LinkId, LinkContext>,
}

impl LinkTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a link
    pub fn get(&self, link: LinkId) -> Option<&LinkContext> {
        self.links.get(&link)
    }

    pub(crate) fn get_mut(&mut self, link: LinkId) -> Option<&mut LinkContext> {
        self.links.get_mut(&link)
    }

    pub(crate) fn get_or_insert_with<F>(&mut self, link: LinkId, create: F) -> &mut LinkContext
    where
        F: FnOnce() -> LinkContext,
    {
        self.links.entry(link).or_insert_with(create)
    }

    pub(crate) fn remove(&mut self, link: LinkId) -> Option<LinkContext> {
        self.links.remove(&link)
    }

    /// Number of links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether there are no links
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Iterate over links in id order
    pub fn iter(&self) -> impl Iterator<Item = (LinkId, &LinkContext)> {
        self.links.iter().map(|(id, ctx)| (*id, ctx))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (LinkId, &mut LinkContext)> {
        self.links.iter_mut().map(|(id, ctx)| (*id, ctx))
    }

    /// Merged links other than `exclude`
    pub fn merged_except(&self, exclude: Option<LinkId>) -> Vec<LinkId> {
        self.iter()
            .filter(|(id, ctx)| Some(*id) != exclude && ctx.handshake.is_merged())
            .map(|(id, _)| id)
            .collect()
    }

    /// Hop counts advertised over merged links other than `exclude`
    pub fn peer_hops_except(&self, exclude: Option<LinkId>) -> impl Iterator<Item = ClusterSize> + '_ {
        self.iter()
            .filter(move |(id, _)| Some(*id) != exclude)
            .filter_map(|(_, ctx)| ctx.handshake.merged().map(|merged| merged.peer_hops))
    }
}
