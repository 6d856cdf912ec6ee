//! Routes to receivers hosted by this node.

use std::collections::HashMap;

use crate::collections::HashedQueue;
use crate::identifier::{Identifier, ReceiverIdentifier};
use crate::message::control::MessageContract;

/// Identifier to local receivers, with round-robin selection.
#[derive(Debug, Default)]
pub struct InternalRoutingTable {
    routes: HashMap<Identifier, HashedQueue<ReceiverIdentifier>>,
    receivers: HashMap<ReceiverIdentifier, HashMap<Identifier, bool>>,
}

impl InternalRoutingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `contract` to `receiver`. Idempotent; returns whether it was new.
    pub fn add_message_route(&mut self, receiver: ReceiverIdentifier, contract: MessageContract) -> bool {
        let added = self
            .routes
            .entry(contract.identifier.clone())
            .or_default()
            .try_enqueue(receiver.clone());
        self.receivers
            .entry(receiver)
            .or_default()
            .insert(contract.identifier, contract.keep_local);
        added
    }

    /// Next receiver for `identifier`, rotating it to the back.
    pub fn find_route(&mut self, identifier: &Identifier) -> Option<ReceiverIdentifier> {
        self.routes.get_mut(identifier)?.rotate()
    }

    /// Every receiver for `identifier`, without rotating.
    pub fn find_all_routes(&self, identifier: &Identifier) -> Vec<ReceiverIdentifier> {
        self.routes
            .get(identifier)
            .map(|receivers| receivers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any local receiver handles `identifier`.
    pub fn can_route(&self, identifier: &Identifier) -> bool {
        self.routes.contains_key(identifier)
    }

    /// Remove `receiver` and every route it registered.
    ///
    /// Returns the cluster-visible identifiers no other local receiver
    /// handles anymore; the node should stop announcing them.
    pub fn remove_receiver(&mut self, receiver: &ReceiverIdentifier) -> Vec<Identifier> {
        let Some(identifiers) = self.receivers.remove(receiver) else {
            return Vec::new();
        };
        let mut orphaned = Vec::new();
        for (identifier, keep_local) in identifiers {
            let emptied = match self.routes.get_mut(&identifier) {
                Some(receivers) => {
                    receivers.remove(receiver);
                    receivers.is_empty()
                }
                None => false,
            };
            if emptied {
                self.routes.remove(&identifier);
                if !keep_local {
                    orphaned.push(identifier);
                }
            }
        }
        orphaned.sort();
        orphaned
    }

    /// Whether some receiver registered `identifier` without `keep_local`.
    pub fn is_global(&self, identifier: &Identifier) -> bool {
        self.receivers
            .values()
            .any(|routes| routes.get(identifier) == Some(&false))
    }

    /// Identifiers announced to the cluster: registered by at least one
    /// receiver without `keep_local`.
    pub fn global_routes(&self) -> Vec<Identifier> {
        let mut global: Vec<Identifier> = self
            .routes
            .keys()
            .filter(|identifier| self.is_global(identifier))
            .cloned()
            .collect();
        global.sort();
        global
    }

    /// Copy of the table, sorted by identifier.
    pub fn snapshot(&self) -> Vec<(Identifier, Vec<ReceiverIdentifier>)> {
        let mut snapshot: Vec<(Identifier, Vec<ReceiverIdentifier>)> = self
            .routes
            .iter()
            .map(|(identifier, receivers)| (identifier.clone(), receivers.iter().cloned().collect()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }
}
