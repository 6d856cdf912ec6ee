//! Rendezvous coordinator directory.
//!
//! Nodes learn about each other through a small set of coordinator
//! processes. The directory keeps them in failover order: the head is the
//! coordinator the node is currently talking to, [`rotate`] fails over to
//! the next one, [`promote`] jumps to an announced leader. Host names are
//! re-resolved off the lock with [`refresh`].
//!
//! [`rotate`]: RendezvousDirectory::rotate
//! [`promote`]: RendezvousDirectory::promote
//! [`refresh`]: RendezvousDirectory::refresh

use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RendezvousError;

/// Address pair of one coordinator.
///
/// Equality and hashing use the configured addresses only; the resolved
/// connect addresses are a cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousEndpoint {
    /// Address nodes send registrations and requests to.
    pub unicast: String,
    /// Address the coordinator publishes heartbeats and announcements on.
    pub broadcast: String,
    #[serde(skip)]
    resolved: Option<(String, String)>,
}

impl RendezvousEndpoint {
    /// Create an endpoint from configured addresses.
    pub fn new(unicast: impl Into<String>, broadcast: impl Into<String>) -> Self {
        Self {
            unicast: unicast.into(),
            broadcast: broadcast.into(),
            resolved: None,
        }
    }

    /// Address to connect the unicast socket to.
    pub fn unicast_address(&self) -> &str {
        self.resolved
            .as_ref()
            .map(|(unicast, _)| unicast.as_str())
            .unwrap_or(&self.unicast)
    }

    /// Address to connect the broadcast subscriber to.
    pub fn broadcast_address(&self) -> &str {
        self.resolved
            .as_ref()
            .map(|(_, broadcast)| broadcast.as_str())
            .unwrap_or(&self.broadcast)
    }

    /// Re-resolve `tcp://host:port` addresses.
    ///
    /// Addresses that are not tcp, or do not resolve, keep their configured
    /// value.
    pub async fn refresh(&mut self) {
        self.resolved = Some((resolve(&self.unicast).await, resolve(&self.broadcast).await));
    }
}

async fn resolve(address: &str) -> String {
    let Some(host_port) = address.strip_prefix("tcp://") else {
        return address.to_string();
    };
    match tokio::net::lookup_host(host_port).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => format!("tcp://{addr}"),
            None => address.to_string(),
        },
        Err(e) => {
            debug!(address, error = %e, "address did not resolve, keeping configured value");
            address.to_string()
        }
    }
}

impl PartialEq for RendezvousEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.unicast == other.unicast && self.broadcast == other.broadcast
    }
}

impl Eq for RendezvousEndpoint {}

impl Hash for RendezvousEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unicast.hash(state);
        self.broadcast.hash(state);
    }
}

fn validate(nodes: &[RendezvousEndpoint]) -> Result<(), RendezvousError> {
    if nodes.is_empty() {
        return Err(RendezvousError::Empty);
    }
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node) {
            return Err(RendezvousError::DuplicateEndpoint {
                unicast: node.unicast.clone(),
                broadcast: node.broadcast.clone(),
            });
        }
    }
    Ok(())
}

/// Ordered set of coordinators; the head is current.
#[derive(Debug)]
pub struct RendezvousDirectory {
    nodes: Mutex<VecDeque<RendezvousEndpoint>>,
}

impl RendezvousDirectory {
    /// Create a directory. Fails on an empty set or duplicate endpoints.
    pub fn new(nodes: Vec<RendezvousEndpoint>) -> Result<Self, RendezvousError> {
        validate(&nodes)?;
        Ok(Self {
            nodes: Mutex::new(nodes.into()),
        })
    }

    /// The coordinator currently in use.
    pub fn current(&self) -> Option<RendezvousEndpoint> {
        self.nodes.lock().front().cloned()
    }

    /// Move the current coordinator to the tail and return the new current
    /// one.
    pub fn rotate(&self) -> Option<RendezvousEndpoint> {
        let mut nodes = self.nodes.lock();
        let moved = nodes.pop_front()?;
        nodes.push_back(moved.clone());
        let next = nodes.front().cloned();
        info!(
            from = %moved.unicast,
            to = ?next.as_ref().map(|n| n.unicast.as_str()),
            "rotated rendezvous server"
        );
        next
    }

    /// Re-resolve `endpoint`'s addresses and store them if it is still a
    /// member.
    pub async fn refresh(&self, endpoint: &RendezvousEndpoint) {
        let mut refreshed = endpoint.clone();
        refreshed.refresh().await;
        let mut nodes = self.nodes.lock();
        if let Some(slot) = nodes.iter_mut().find(|node| **node == refreshed) {
            slot.resolved = refreshed.resolved;
        }
    }

    /// Make `endpoint` current if it is a member. Returns whether it was.
    pub fn promote(&self, endpoint: &RendezvousEndpoint) -> bool {
        let mut nodes = self.nodes.lock();
        match nodes.iter().position(|node| node == endpoint) {
            Some(pos) => {
                if let Some(node) = nodes.remove(pos) {
                    nodes.push_front(node);
                }
                true
            }
            None => false,
        }
    }

    /// Replace the whole set. Invalid sets leave the directory unchanged.
    pub fn reconfigure(&self, nodes: Vec<RendezvousEndpoint>) -> Result<(), RendezvousError> {
        validate(&nodes)?;
        *self.nodes.lock() = nodes.into();
        Ok(())
    }

    /// Ordered copy of the set.
    pub fn nodes(&self) -> Vec<RendezvousEndpoint> {
        self.nodes.lock().iter().cloned().collect()
    }
}
