//! Node assembly.
//!
//! [`Fabric`] wires the rendezvous directory, the cluster monitor, the
//! health monitor and the dispatcher of one node from a [`FabricConfig`].

use std::sync::Arc;

use tracing::info;

use crate::config::FabricConfig;
use crate::discovery::{ClusterMonitor, ClusterMonitorService, StandaloneClusterMonitor};
use crate::dispatch::MessageRouter;
use crate::error::FabricError;
use crate::health::{ClusterHealthMonitor, PeerMonitor, StandaloneHealthMonitor};
use crate::identifier::NodeIdentity;
use crate::node::LocalNode;
use crate::rendezvous::RendezvousDirectory;
use crate::security::SecurityProvider;
use crate::transport::{InMemoryTransport, SocketFactory};

/// One node of the fabric.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use meshwork::{Fabric, FabricConfig, SharedKeySecurityProvider};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = FabricConfig::for_testing("node-a").standalone(true).build().unwrap();
/// let fabric = Fabric::builder(config)
///     .security(Arc::new(SharedKeySecurityProvider::single_domain("d", b"key".to_vec())))
///     .build()
///     .unwrap();
///
/// fabric.start().await.unwrap();
/// assert!(fabric.local_node().scale_out_address().is_some());
/// fabric.stop().await;
/// # }
/// ```
pub struct Fabric {
    config: FabricConfig,
    local: Arc<LocalNode>,
    directory: Option<Arc<RendezvousDirectory>>,
    router: MessageRouter,
}

impl Fabric {
    /// Start assembling a node from `config`.
    pub fn builder(config: FabricConfig) -> FabricBuilder {
        FabricBuilder {
            config,
            transport: None,
            security: None,
            cluster: None,
            health: None,
        }
    }

    /// Configuration the node was built from.
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Identity and bound addresses of this node.
    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local
    }

    /// Coordinator directory; `None` when running standalone.
    pub fn rendezvous(&self) -> Option<&Arc<RendezvousDirectory>> {
        self.directory.as_ref()
    }

    /// The dispatcher.
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Start the node.
    pub async fn start(&self) -> Result<(), FabricError> {
        self.router.start().await?;
        info!(
            node = %self.local.identity(),
            standalone = self.config.cluster_membership.run_as_standalone,
            "fabric started"
        );
        Ok(())
    }

    /// Stop the node.
    pub async fn stop(&self) {
        self.router.stop().await;
        info!(node = %self.local.identity(), "fabric stopped");
    }
}

/// Builder for [`Fabric`].
pub struct FabricBuilder {
    config: FabricConfig,
    transport: Option<Arc<dyn SocketFactory>>,
    security: Option<Arc<dyn SecurityProvider>>,
    cluster: Option<Arc<dyn ClusterMonitor>>,
    health: Option<Arc<dyn ClusterHealthMonitor>>,
}

impl FabricBuilder {
    /// Set the transport.
    ///
    /// If not set, defaults to a fresh [`InMemoryTransport`].
    pub fn transport(mut self, transport: Arc<dyn SocketFactory>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the security provider. Required.
    pub fn security(mut self, security: Arc<dyn SecurityProvider>) -> Self {
        self.security = Some(security);
        self
    }

    /// Replace the cluster monitor.
    ///
    /// If not set, defaults to [`ClusterMonitorService`], or to
    /// [`StandaloneClusterMonitor`] when running standalone.
    pub fn cluster_monitor(mut self, cluster: Arc<dyn ClusterMonitor>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Replace the health monitor.
    ///
    /// If not set, defaults to [`PeerMonitor`], or to
    /// [`StandaloneHealthMonitor`] when running standalone.
    pub fn health_monitor(mut self, health: Arc<dyn ClusterHealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no security
    /// provider was set.
    pub fn build(self) -> Result<Fabric, FabricError> {
        self.config.validate()?;
        let security = self.security.ok_or(FabricError::MissingComponent {
            component: "security provider",
        })?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(InMemoryTransport::new()));
        let identity = self
            .config
            .node_identity
            .clone()
            .unwrap_or_else(NodeIdentity::random);
        let local = Arc::new(LocalNode::new(identity));
        let standalone = self.config.cluster_membership.run_as_standalone;

        let directory = if standalone {
            None
        } else {
            Some(Arc::new(RendezvousDirectory::new(
                self.config.rendezvous_servers.clone(),
            )?))
        };
        let cluster: Arc<dyn ClusterMonitor> = match (self.cluster, &directory) {
            (Some(cluster), _) => cluster,
            (None, Some(directory)) => Arc::new(ClusterMonitorService::new(
                &self.config,
                Arc::clone(directory),
                Arc::clone(&transport),
                Arc::clone(&security),
                Arc::clone(&local),
            )),
            (None, None) => Arc::new(StandaloneClusterMonitor),
        };
        let health: Arc<dyn ClusterHealthMonitor> = match self.health {
            Some(health) => health,
            None if standalone => Arc::new(StandaloneHealthMonitor),
            None => Arc::new(PeerMonitor::new(
                &self.config,
                Arc::clone(&transport),
                Arc::clone(&security),
                Arc::clone(&local),
            )),
        };
        let router = MessageRouter::new(
            &self.config,
            Arc::clone(&local),
            transport,
            security,
            cluster,
            health,
        );

        Ok(Fabric {
            config: self.config,
            local,
            directory,
            router,
        })
    }
}
