//! Routes to peers, with per-peer connection state.
//!
//! A peer's connection record is created lazily on its first route and
//! marked connected the first time the dispatcher sends to it. The record
//! lives as long as at least one route maps to the peer.

use std::collections::{HashMap, HashSet};

use crate::collections::HashedQueue;
use crate::identifier::{Identifier, Node, NodeIdentity};
use crate::node::Health;

/// Connection record of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnection {
    /// The peer.
    pub node: Node,
    /// Where it publishes heartbeats.
    pub health: Health,
    /// Whether the scale-out socket is connected to it.
    pub connected: bool,
}

/// Identifier to peers, with round-robin selection.
#[derive(Debug, Default)]
pub struct ExternalRoutingTable {
    routes: HashMap<Identifier, HashedQueue<NodeIdentity>>,
    node_routes: HashMap<NodeIdentity, HashSet<Identifier>>,
    peers: HashMap<NodeIdentity, PeerConnection>,
}

impl ExternalRoutingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `identifier` to `node`. Idempotent; creates a not-connected
    /// record for unknown peers. Returns the peer's record.
    pub fn add_message_route(
        &mut self,
        node: Node,
        health: Health,
        identifier: Identifier,
    ) -> PeerConnection {
        let identity = node.identity.clone();
        self.routes
            .entry(identifier.clone())
            .or_default()
            .try_enqueue(identity.clone());
        self.node_routes
            .entry(identity.clone())
            .or_default()
            .insert(identifier);
        self.peers
            .entry(identity)
            .or_insert(PeerConnection {
                node,
                health,
                connected: false,
            })
            .clone()
    }

    /// Next peer for `identifier`, rotating it to the back.
    pub fn find_route(&mut self, identifier: &Identifier) -> Option<PeerConnection> {
        let identity = self.routes.get_mut(identifier)?.rotate()?;
        self.peers.get(&identity).cloned()
    }

    /// Next peer for `identifier` that `eligible` accepts.
    ///
    /// Rotates past rejected peers; gives up after one full turn.
    pub fn find_route_where(
        &mut self,
        identifier: &Identifier,
        mut eligible: impl FnMut(&PeerConnection) -> bool,
    ) -> Option<PeerConnection> {
        let nodes = self.routes.get_mut(identifier)?;
        for _ in 0..nodes.len() {
            let identity = nodes.rotate()?;
            match self.peers.get(&identity) {
                Some(peer) if eligible(peer) => return Some(peer.clone()),
                _ => {}
            }
        }
        None
    }

    /// Every peer for `identifier`, without rotating.
    pub fn find_all_routes(&self, identifier: &Identifier) -> Vec<PeerConnection> {
        self.routes
            .get(identifier)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|identity| self.peers.get(identity).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Connection record of `node`.
    pub fn find_peer(&self, node: &NodeIdentity) -> Option<PeerConnection> {
        self.peers.get(node).cloned()
    }

    /// Mark `node` connected. Returns whether it is known.
    pub fn mark_connected(&mut self, node: &NodeIdentity) -> bool {
        match self.peers.get_mut(node) {
            Some(peer) => {
                peer.connected = true;
                true
            }
            None => false,
        }
    }

    /// Remove `node` and all its routes. Returns its record, whose
    /// `connected` flag tells whether the caller must disconnect.
    pub fn remove_node_route(&mut self, node: &NodeIdentity) -> Option<PeerConnection> {
        if let Some(identifiers) = self.node_routes.remove(node) {
            for identifier in identifiers {
                self.unmap(&identifier, node);
            }
        }
        self.peers.remove(node)
    }

    /// Remove some of `node`'s routes.
    ///
    /// The connection record is evicted, and returned, only once no route
    /// maps to the node anymore.
    pub fn remove_message_routes(
        &mut self,
        node: &NodeIdentity,
        identifiers: &[Identifier],
    ) -> Option<PeerConnection> {
        let remaining = self.node_routes.get_mut(node)?;
        for identifier in identifiers {
            remaining.remove(identifier);
        }
        let emptied = remaining.is_empty();
        for identifier in identifiers {
            self.unmap(identifier, node);
        }
        if emptied {
            self.node_routes.remove(node);
            self.peers.remove(node)
        } else {
            None
        }
    }

    fn unmap(&mut self, identifier: &Identifier, node: &NodeIdentity) {
        if let Some(nodes) = self.routes.get_mut(identifier) {
            nodes.remove(node);
            if nodes.is_empty() {
                self.routes.remove(identifier);
            }
        }
    }

    /// Routes registered for `node`.
    pub fn routes_of(&self, node: &NodeIdentity) -> Vec<Identifier> {
        let mut routes: Vec<Identifier> = self
            .node_routes
            .get(node)
            .map(|routes| routes.iter().cloned().collect())
            .unwrap_or_default();
        routes.sort();
        routes
    }

    /// Copy of the table, sorted by identifier.
    pub fn snapshot(&self) -> Vec<(Identifier, Vec<NodeIdentity>)> {
        let mut snapshot: Vec<(Identifier, Vec<NodeIdentity>)> = self
            .routes
            .iter()
            .map(|(identifier, nodes)| (identifier.clone(), nodes.iter().cloned().collect()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }
}
