//! Fabric configuration.
//!
//! Every section has production defaults and a `for_testing` preset with
//! short timings. [`FabricConfig::builder`] validates the assembled
//! configuration on [`build`](FabricConfigBuilder::build).
//!
//! Loading configuration from files is left to the host; all structs
//! derive `serde` traits for that purpose.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RendezvousError};
use crate::identifier::NodeIdentity;
use crate::rendezvous::RendezvousEndpoint;

/// Cluster membership settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembershipConfig {
    /// Coordinator silence after which the node fails over to the next one.
    pub heartbeat_silence_before_failover: Duration,
    /// Run without cluster: no coordinator, no health monitoring.
    pub run_as_standalone: bool,
}

impl Default for ClusterMembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_silence_before_failover: Duration::from_secs(10),
            run_as_standalone: false,
        }
    }
}

impl ClusterMembershipConfig {
    /// Short failover timing for tests.
    pub fn for_testing() -> Self {
        Self {
            heartbeat_silence_before_failover: Duration::from_millis(500),
            run_as_standalone: false,
        }
    }
}

/// Discovery channel and throttle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Outbound discovery queue capacity.
    pub max_discovery_sender_queue_length: usize,
    /// Pending route-discovery request capacity.
    pub max_discovery_request_queue_length: usize,
    /// Requests flushed per throttle tick.
    pub discovery_requests_per_send_batch: usize,
    /// Throttle tick.
    pub discovery_sending_period: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_discovery_sender_queue_length: 1000,
            max_discovery_request_queue_length: 10_000,
            discovery_requests_per_send_batch: 100,
            discovery_sending_period: Duration::from_secs(2),
        }
    }
}

impl DiscoveryConfig {
    /// Fast throttle for tests.
    pub fn for_testing() -> Self {
        Self {
            discovery_sending_period: Duration::from_millis(100),
            ..Self::default()
        }
    }
}

/// Cluster route auto-discovery after start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAutoDiscoveryConfig {
    /// Base delay before requesting cluster routes.
    pub start_delay: Duration,
    /// The base delay is multiplied by a random factor in `1..=max`.
    pub start_delay_max_multiplier: u32,
}

impl Default for ClusterAutoDiscoveryConfig {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_secs(1),
            start_delay_max_multiplier: 3,
        }
    }
}

impl ClusterAutoDiscoveryConfig {
    /// Short delay for tests.
    pub fn for_testing() -> Self {
        Self {
            start_delay: Duration::from_millis(50),
            start_delay_max_multiplier: 1,
        }
    }
}

/// Peer health monitoring settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between this node's heartbeats.
    pub heartbeat_interval: Duration,
    /// Unconnected peers silent for this long are dropped.
    pub peer_is_stale_after: Duration,
    /// Connected peers missing this many heartbeats are declared dead.
    pub missing_heartbeats_before_deletion: u32,
    /// Stale-peer sweep period.
    pub stale_peers_check_interval: Duration,
    /// In-process address the monitor's relay publishes on.
    pub intercom_address: String,
    /// Candidate addresses for this node's heartbeat publisher.
    pub heartbeat_address_range: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            peer_is_stale_after: Duration::from_secs(30),
            missing_heartbeats_before_deletion: 2,
            stale_peers_check_interval: Duration::from_secs(10),
            intercom_address: "inproc://health".to_string(),
            heartbeat_address_range: (8100..8110)
                .map(|port| format!("tcp://0.0.0.0:{port}"))
                .collect(),
        }
    }
}

impl HealthConfig {
    /// Short timings and in-process addresses prefixed with `node`.
    pub fn for_testing(node: &str) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            peer_is_stale_after: Duration::from_millis(600),
            missing_heartbeats_before_deletion: 2,
            stale_peers_check_interval: Duration::from_millis(200),
            intercom_address: format!("inproc://{node}/health"),
            heartbeat_address_range: (0..3)
                .map(|i| format!("inproc://{node}/heartbeat-{i}"))
                .collect(),
        }
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// In-process address local actors and fabric loops connect to.
    pub local_address: String,
    /// Candidate addresses for the scale-out listener.
    pub scale_out_address_range: Vec<String>,
    /// Settle delay after connecting to a new peer.
    pub connection_establish_wait: Duration,
    /// Upper bound on joining loops at shutdown or restart.
    pub shutdown_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            local_address: "inproc://router".to_string(),
            scale_out_address_range: (8000..8010)
                .map(|port| format!("tcp://0.0.0.0:{port}"))
                .collect(),
            connection_establish_wait: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl RouterConfig {
    /// Short timings and in-process addresses prefixed with `node`.
    pub fn for_testing(node: &str) -> Self {
        Self {
            local_address: format!("inproc://{node}/router"),
            scale_out_address_range: (0..3)
                .map(|i| format!("inproc://{node}/scaleout-{i}"))
                .collect(),
            connection_establish_wait: Duration::from_millis(10),
            shutdown_timeout: Duration::from_millis(500),
        }
    }
}

/// Complete fabric configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Identity of this node; random when unset.
    pub node_identity: Option<NodeIdentity>,
    /// Membership settings.
    pub cluster_membership: ClusterMembershipConfig,
    /// Discovery settings.
    pub discovery: DiscoveryConfig,
    /// Auto-discovery settings.
    pub cluster_auto_discovery: ClusterAutoDiscoveryConfig,
    /// Health settings.
    pub health: HealthConfig,
    /// Dispatcher settings.
    pub router: RouterConfig,
    /// Coordinators in failover order.
    pub rendezvous_servers: Vec<RendezvousEndpoint>,
}

impl FabricConfig {
    /// Start building a configuration from defaults.
    pub fn builder() -> FabricConfigBuilder {
        FabricConfigBuilder {
            config: FabricConfig::default(),
        }
    }

    /// Test presets for every section, addresses prefixed with `node`.
    pub fn for_testing(node: &str) -> FabricConfigBuilder {
        FabricConfigBuilder {
            config: FabricConfig {
                node_identity: Some(NodeIdentity::new(node.as_bytes().to_vec())),
                cluster_membership: ClusterMembershipConfig::for_testing(),
                discovery: DiscoveryConfig::for_testing(),
                cluster_auto_discovery: ClusterAutoDiscoveryConfig::for_testing(),
                health: HealthConfig::for_testing(node),
                router: RouterConfig::for_testing(node),
                rendezvous_servers: Vec::new(),
            },
        }
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cluster_membership.run_as_standalone {
            if self.rendezvous_servers.is_empty() {
                return Err(ConfigError::MissingRendezvous);
            }
            let mut seen = std::collections::HashSet::new();
            for endpoint in &self.rendezvous_servers {
                if !seen.insert(endpoint) {
                    return Err(RendezvousError::DuplicateEndpoint {
                        unicast: endpoint.unicast.clone(),
                        broadcast: endpoint.broadcast.clone(),
                    }
                    .into());
                }
            }
            if self.health.heartbeat_address_range.is_empty() {
                return Err(ConfigError::EmptyAddressRange {
                    name: "health.heartbeat_address_range",
                });
            }
        }
        if self.router.scale_out_address_range.is_empty() {
            return Err(ConfigError::EmptyAddressRange {
                name: "router.scale_out_address_range",
            });
        }
        let positive = [
            (
                "discovery.max_discovery_sender_queue_length",
                self.discovery.max_discovery_sender_queue_length,
            ),
            (
                "discovery.max_discovery_request_queue_length",
                self.discovery.max_discovery_request_queue_length,
            ),
            (
                "discovery.discovery_requests_per_send_batch",
                self.discovery.discovery_requests_per_send_batch,
            ),
            (
                "health.missing_heartbeats_before_deletion",
                self.health.missing_heartbeats_before_deletion as usize,
            ),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::MustBePositive { name });
            }
        }
        let periods = [
            (
                "cluster_membership.heartbeat_silence_before_failover",
                self.cluster_membership.heartbeat_silence_before_failover,
            ),
            (
                "discovery.discovery_sending_period",
                self.discovery.discovery_sending_period,
            ),
            ("health.heartbeat_interval", self.health.heartbeat_interval),
            (
                "health.stale_peers_check_interval",
                self.health.stale_peers_check_interval,
            ),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                return Err(ConfigError::MustBePositive { name });
            }
        }
        Ok(())
    }
}

/// Builder for [`FabricConfig`].
#[derive(Debug, Clone)]
pub struct FabricConfigBuilder {
    config: FabricConfig,
}

impl FabricConfigBuilder {
    /// Set the node identity.
    pub fn node_identity(mut self, identity: NodeIdentity) -> Self {
        self.config.node_identity = Some(identity);
        self
    }

    /// Set the coordinators, in failover order.
    pub fn rendezvous_servers(mut self, servers: Vec<RendezvousEndpoint>) -> Self {
        self.config.rendezvous_servers = servers;
        self
    }

    /// Run without a cluster.
    pub fn standalone(mut self, standalone: bool) -> Self {
        self.config.cluster_membership.run_as_standalone = standalone;
        self
    }

    /// Replace the membership section.
    pub fn cluster_membership(mut self, section: ClusterMembershipConfig) -> Self {
        self.config.cluster_membership = section;
        self
    }

    /// Replace the discovery section.
    pub fn discovery(mut self, section: DiscoveryConfig) -> Self {
        self.config.discovery = section;
        self
    }

    /// Replace the auto-discovery section.
    pub fn cluster_auto_discovery(mut self, section: ClusterAutoDiscoveryConfig) -> Self {
        self.config.cluster_auto_discovery = section;
        self
    }

    /// Replace the health section.
    pub fn health(mut self, section: HealthConfig) -> Self {
        self.config.health = section;
        self
    }

    /// Replace the dispatcher section.
    pub fn router(mut self, section: RouterConfig) -> Self {
        self.config.router = section;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// See [`FabricConfig::validate`].
    pub fn build(self) -> Result<FabricConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rdv(n: u16) -> RendezvousEndpoint {
        RendezvousEndpoint::new(format!("inproc://rdv-{n}-u"), format!("inproc://rdv-{n}-b"))
    }

    #[test]
    fn test_defaults() {
        let config = FabricConfig::default();
        assert_eq!(
            config.cluster_membership.heartbeat_silence_before_failover,
            Duration::from_secs(10)
        );
        assert_eq!(config.discovery.max_discovery_sender_queue_length, 1000);
        assert_eq!(config.discovery.max_discovery_request_queue_length, 10_000);
        assert_eq!(config.discovery.discovery_requests_per_send_batch, 100);
        assert_eq!(config.health.missing_heartbeats_before_deletion, 2);
        assert_eq!(config.health.intercom_address, "inproc://health");
        assert_eq!(
            config.router.connection_establish_wait,
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_builder_requires_rendezvous_unless_standalone() {
        assert_eq!(
            FabricConfig::builder().build().err(),
            Some(ConfigError::MissingRendezvous)
        );
        assert!(FabricConfig::builder().standalone(true).build().is_ok());
        assert!(FabricConfig::builder()
            .rendezvous_servers(vec![rdv(1)])
            .build()
            .is_ok());
    }

    #[test]
    fn test_builder_rejects_duplicate_rendezvous() {
        let err = FabricConfig::builder()
            .rendezvous_servers(vec![rdv(1), rdv(1)])
            .build()
            .expect_err("duplicate");
        assert!(matches!(err, ConfigError::Rendezvous(_)));
    }

    #[test]
    fn test_builder_rejects_zero_settings() {
        let err = FabricConfig::builder()
            .standalone(true)
            .discovery(DiscoveryConfig {
                discovery_requests_per_send_batch: 0,
                ..DiscoveryConfig::default()
            })
            .build()
            .expect_err("zero batch");
        assert_eq!(
            err,
            ConfigError::MustBePositive {
                name: "discovery.discovery_requests_per_send_batch"
            }
        );

        let err = FabricConfig::builder()
            .standalone(true)
            .router(RouterConfig {
                scale_out_address_range: Vec::new(),
                ..RouterConfig::default()
            })
            .build()
            .expect_err("empty range");
        assert!(matches!(err, ConfigError::EmptyAddressRange { .. }));
    }

    #[test]
    fn test_builder_rejects_zero_periods() {
        let err = FabricConfig::builder()
            .standalone(true)
            .health(HealthConfig {
                heartbeat_interval: Duration::ZERO,
                ..HealthConfig::default()
            })
            .build()
            .expect_err("zero heartbeat interval");
        assert_eq!(
            err,
            ConfigError::MustBePositive {
                name: "health.heartbeat_interval"
            }
        );

        let err = FabricConfig::builder()
            .standalone(true)
            .discovery(DiscoveryConfig {
                discovery_sending_period: Duration::ZERO,
                ..DiscoveryConfig::default()
            })
            .build()
            .expect_err("zero sending period");
        assert_eq!(
            err,
            ConfigError::MustBePositive {
                name: "discovery.discovery_sending_period"
            }
        );

        let err = FabricConfig::builder()
            .standalone(true)
            .health(HealthConfig {
                stale_peers_check_interval: Duration::ZERO,
                ..HealthConfig::default()
            })
            .build()
            .expect_err("zero stale check interval");
        assert_eq!(
            err,
            ConfigError::MustBePositive {
                name: "health.stale_peers_check_interval"
            }
        );
    }

    #[test]
    fn test_for_testing_prefixes_addresses() {
        let config = FabricConfig::for_testing("n1")
            .rendezvous_servers(vec![rdv(1)])
            .build()
            .expect("valid");
        assert_eq!(config.router.local_address, "inproc://n1/router");
        assert_eq!(config.health.intercom_address, "inproc://n1/health");
        assert_eq!(
            config.node_identity,
            Some(NodeIdentity::new(b"n1".to_vec()))
        );
    }
}
