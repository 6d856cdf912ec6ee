//! This node's identity and the addresses it actually bound.

use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::identifier::{Node, NodeIdentity};

/// Where a node publishes its heartbeats, and how often.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Health {
    /// Heartbeat publisher address.
    pub address: String,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
}

/// Identity and bound addresses of the local node.
///
/// The scale-out and heartbeat addresses are only known once the
/// dispatcher and the heartbeat sender have bound a free address from
/// their ranges, so both start empty.
#[derive(Debug)]
pub struct LocalNode {
    identity: NodeIdentity,
    scale_out_address: RwLock<Option<String>>,
    health: RwLock<Option<Health>>,
}

impl LocalNode {
    /// Create local node info with nothing bound yet.
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            scale_out_address: RwLock::new(None),
            health: RwLock::new(None),
        }
    }

    /// Identity of this node.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// This node as peers see it. Address is empty until bound.
    pub fn node(&self) -> Node {
        Node::new(
            self.identity.clone(),
            self.scale_out_address.read().clone().unwrap_or_default(),
        )
    }

    /// Scale-out address, once bound.
    pub fn scale_out_address(&self) -> Option<String> {
        self.scale_out_address.read().clone()
    }

    /// Record the bound scale-out address.
    pub fn set_scale_out_address(&self, address: impl Into<String>) {
        *self.scale_out_address.write() = Some(address.into());
    }

    /// Heartbeat publishing info, once bound.
    pub fn health(&self) -> Option<Health> {
        self.health.read().clone()
    }

    /// Record the bound heartbeat address.
    pub fn set_health(&self, health: Health) {
        *self.health.write() = Some(health);
    }
}
