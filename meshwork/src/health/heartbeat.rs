//! This node's own heartbeat publisher.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use super::registry::bounded_heartbeat_interval;
use crate::error::FabricError;
use crate::message::control::Heartbeat;
use crate::message::{DistributionPattern, Message};
use crate::node::{Health, LocalNode};
use crate::transport::{bind_first_free, Socket, SocketFactory, SocketKind};

/// Publishes a [`Heartbeat`] every `heartbeat_interval` on the first free
/// address of `heartbeat_address_range`.
pub struct HeartbeatSender {
    transport: Arc<dyn SocketFactory>,
    local: Arc<LocalNode>,
    address_range: Vec<String>,
    interval: Duration,
}

impl HeartbeatSender {
    /// Create a heartbeat sender.
    ///
    /// `interval` is clamped to the range peers accept.
    pub fn new(
        transport: Arc<dyn SocketFactory>,
        local: Arc<LocalNode>,
        address_range: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            local,
            address_range,
            interval: bounded_heartbeat_interval(interval),
        }
    }

    /// Bind the publisher and record the address on [`LocalNode`].
    ///
    /// # Errors
    ///
    /// [`FabricError::BindRangeExhausted`] when no address is free.
    pub fn bind(&self) -> Result<Box<dyn Socket>, FabricError> {
        let mut socket = self.transport.create_socket(SocketKind::Publisher, None);
        let address = bind_first_free(socket.as_mut(), &self.address_range, "heartbeat sender")?;
        self.local.set_health(Health {
            address,
            heartbeat_interval: self.interval,
        });
        Ok(socket)
    }

    /// Publish until cancelled.
    pub async fn run(self: Arc<Self>, mut socket: Box<dyn Socket>, cancel: CancellationToken) {
        let Some(health) = self.local.health() else {
            warn!("heartbeat sender started before binding");
            return;
        };
        info!(address = %health.address, interval = ?self.interval, "heartbeat sender started");

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let heartbeat = Heartbeat {
                        node_identity: self.local.identity().clone(),
                        heartbeat_interval: self.interval,
                        health_address: health.address.clone(),
                    };
                    match Message::create(&heartbeat, DistributionPattern::Broadcast) {
                        Ok(message) => {
                            if let Err(e) = socket.send(message).await {
                                warn!(error = %e, "failed to publish heartbeat");
                            } else {
                                trace!("heartbeat published");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to build heartbeat"),
                    }
                }
            }
        }
        info!(address = %health.address, "heartbeat sender stopped");
    }
}
