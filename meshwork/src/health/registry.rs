//! Per-peer health metadata.
//!
//! Peers enter the registry when the dispatcher first hears about them and
//! leave it on explicit deletion or when a sweep finds them dead.
//!
//! Two sweeps read it:
//!
//! ```text
//! connected peer,   now - last_heartbeat > interval × missing_heartbeats  -> dead
//! unconnected peer, now - last_heartbeat > peer_is_stale_after           -> stale
//! ```

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::HealthConfig;
use crate::identifier::NodeIdentity;

/// Shortest heartbeat interval accepted from a peer.
pub const MIN_PEER_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Longest heartbeat interval accepted from a peer.
pub const MAX_PEER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3600);

/// Clamp a peer-announced heartbeat interval into the accepted range.
pub fn bounded_heartbeat_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_PEER_HEARTBEAT_INTERVAL, MAX_PEER_HEARTBEAT_INTERVAL)
}

/// Health metadata of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMemberMeta {
    /// When the last heartbeat (or successful probe) was seen.
    pub last_known_heartbeat: Instant,
    /// Interval the peer publishes heartbeats at.
    pub heartbeat_interval: Duration,
    /// Where the peer publishes heartbeats.
    pub health_address: String,
    /// The peer's scale-out address.
    pub scale_out_address: String,
    /// Whether this node subscribed to the peer's heartbeats.
    pub connection_established: bool,
}

/// Keyed store of [`ClusterMemberMeta`].
#[derive(Debug)]
pub struct PeerHealthRegistry {
    peers: Mutex<HashMap<NodeIdentity, ClusterMemberMeta>>,
    peer_is_stale_after: Duration,
    missing_heartbeats_before_deletion: u32,
}

impl PeerHealthRegistry {
    /// Create an empty registry with thresholds from `config`.
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            peer_is_stale_after: config.peer_is_stale_after,
            missing_heartbeats_before_deletion: config.missing_heartbeats_before_deletion,
        }
    }

    /// Metadata of `node`, if registered.
    pub fn find(&self, node: &NodeIdentity) -> Option<ClusterMemberMeta> {
        self.peers.lock().get(node).cloned()
    }

    /// Register `node` unless already present; never overwrites.
    ///
    /// Returns the stored metadata.
    pub fn find_or_add(&self, node: NodeIdentity, meta: ClusterMemberMeta) -> ClusterMemberMeta {
        self.peers.lock().entry(node).or_insert(meta).clone()
    }

    /// Remove `node`.
    pub fn remove(&self, node: &NodeIdentity) -> Option<ClusterMemberMeta> {
        self.peers.lock().remove(node)
    }

    /// Number of registered peers.
    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Connected peers that missed too many heartbeats.
    ///
    /// A deadline too large to represent never expires.
    pub fn peers_with_expired_heartbeat(&self, now: Instant) -> Vec<(NodeIdentity, ClusterMemberMeta)> {
        let missing = self.missing_heartbeats_before_deletion;
        self.select(|meta| {
            meta.connection_established
                && meta
                    .heartbeat_interval
                    .checked_mul(missing)
                    .is_some_and(|deadline| {
                        now.saturating_duration_since(meta.last_known_heartbeat) > deadline
                    })
        })
    }

    /// Unconnected peers silent for longer than `peer_is_stale_after`.
    pub fn stale_peers(&self, now: Instant) -> Vec<(NodeIdentity, ClusterMemberMeta)> {
        let stale_after = self.peer_is_stale_after;
        self.select(|meta| {
            !meta.connection_established
                && now.saturating_duration_since(meta.last_known_heartbeat) > stale_after
        })
    }

    fn select(
        &self,
        predicate: impl Fn(&ClusterMemberMeta) -> bool,
    ) -> Vec<(NodeIdentity, ClusterMemberMeta)> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, meta)| predicate(meta))
            .map(|(node, meta)| (node.clone(), meta.clone()))
            .collect()
    }

    /// Record a heartbeat from `node` at `at`. Returns whether it is registered.
    pub fn update_last_heartbeat(&self, node: &NodeIdentity, at: Instant) -> bool {
        match self.peers.lock().get_mut(node) {
            Some(meta) => {
                meta.last_known_heartbeat = at;
                true
            }
            None => false,
        }
    }

    /// Mark whether `node`'s heartbeats are subscribed to.
    pub fn set_connection_established(&self, node: &NodeIdentity, established: bool) -> bool {
        match self.peers.lock().get_mut(node) {
            Some(meta) => {
                meta.connection_established = established;
                true
            }
            None => false,
        }
    }

    /// Shortest heartbeat interval among registered peers.
    pub fn min_heartbeat_interval(&self) -> Option<Duration> {
        self.peers
            .lock()
            .values()
            .map(|meta| meta.heartbeat_interval)
            .min()
    }

    /// Identities of all registered peers.
    pub fn keys(&self) -> Vec<NodeIdentity> {
        self.peers.lock().keys().cloned().collect()
    }
}
