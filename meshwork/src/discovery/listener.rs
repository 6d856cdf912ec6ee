//! Inbound half of the discovery channel.
//!
//! The listener subscribes to the current coordinator's broadcast address
//! and classifies what it hears:
//!
//! 1. coordinator heartbeat ([`Ping`]): reset the watchdog and answer with a [`Pong`]
//! 2. dispatcher-bound control traffic: forwarded to the local dispatcher
//! 3. [`RendezvousConfigurationChanged`]: replace the coordinator set
//! 4. [`RendezvousNotLeader`]: promote the announced leader
//!
//! Coordinator announcements (3 and 4) are acted on only when their
//! signature verifies.
//!
//! A watchdog task fails over to the next coordinator when no heartbeat
//! arrives within `heartbeat_silence_before_failover`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Barrier, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::sender::DiscoveryMessageSender;
use crate::error::MessageError;
use crate::message::control::{
    ControlKind, DiscoverMessageRoute, Ping, Pong, RegisterExternalMessageRoute,
    RendezvousConfigurationChanged, RendezvousNotLeader, RequestClusterMessageRoutes,
    RequestNodeMessageRoutes, UnregisterMessageRoute, UnregisterNode,
};
use crate::message::{DistributionPattern, Message};
use crate::node::LocalNode;
use crate::rendezvous::{RendezvousDirectory, RendezvousEndpoint};
use crate::security::SecurityProvider;
use crate::transport::{Socket, SocketFactory, SocketKind};

/// Callback asking the owner to rebuild the discovery loops.
pub type RestartRequest = Arc<dyn Fn() + Send + Sync>;

/// Receives coordinator broadcasts and drives failover.
pub struct DiscoveryMessageListener {
    directory: Arc<RendezvousDirectory>,
    transport: Arc<dyn SocketFactory>,
    sender: Arc<DiscoveryMessageSender>,
    security: Arc<dyn SecurityProvider>,
    local: Arc<LocalNode>,
    dispatcher_address: String,
    silence_before_failover: Duration,
}

struct Signals {
    heartbeat: Notify,
    reconfigured: Notify,
}

impl DiscoveryMessageListener {
    /// Create a listener forwarding to the dispatcher at `dispatcher_address`.
    pub fn new(
        directory: Arc<RendezvousDirectory>,
        transport: Arc<dyn SocketFactory>,
        sender: Arc<DiscoveryMessageSender>,
        security: Arc<dyn SecurityProvider>,
        local: Arc<LocalNode>,
        dispatcher_address: impl Into<String>,
        silence_before_failover: Duration,
    ) -> Self {
        Self {
            directory,
            transport,
            sender,
            security,
            local,
            dispatcher_address: dispatcher_address.into(),
            silence_before_failover,
        }
    }

    /// Receive loop. Waits on `barrier` once both sockets are connected.
    pub async fn run(
        self: Arc<Self>,
        on_restart: RestartRequest,
        cancel: CancellationToken,
        barrier: Arc<Barrier>,
    ) {
        let current = self.directory.current();
        let mut subscriber = self.transport.create_socket(SocketKind::Subscriber, None);
        let mut dispatcher = self.transport.create_socket(SocketKind::Dealer, None);
        let connected = match &current {
            Some(endpoint) => subscriber
                .connect(endpoint.broadcast_address())
                .and_then(|()| dispatcher.connect(&self.dispatcher_address)),
            None => Ok(()),
        };
        barrier.wait().await;

        let coordinator = match (current, connected) {
            (Some(endpoint), Ok(())) => endpoint,
            (Some(endpoint), Err(e)) => {
                warn!(address = %endpoint.broadcast, error = %e, "discovery listener failed to connect");
                return;
            }
            (None, _) => {
                warn!("no rendezvous server to listen to");
                return;
            }
        };
        info!(address = %coordinator.broadcast_address(), "discovery listener started");

        let signals = Arc::new(Signals {
            heartbeat: Notify::new(),
            reconfigured: Notify::new(),
        });
        let watchdog_cancel = cancel.child_token();
        let watchdog = tokio::spawn(watchdog(
            Arc::clone(&self.directory),
            self.silence_before_failover,
            Arc::clone(&signals),
            Arc::clone(&on_restart),
            watchdog_cancel.clone(),
        ));

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = subscriber.receive() => received,
            };
            match received {
                Ok(message) => {
                    if let Err(e) = self
                        .handle(message, &coordinator, dispatcher.as_mut(), &signals, &on_restart)
                        .await
                    {
                        warn!(error = %e, "failed to process discovery message");
                    }
                }
                Err(e) if e.is_closed() => {
                    warn!("discovery listener socket closed");
                    break;
                }
                Err(e) => warn!(error = %e, "discovery listener receive failed"),
            }
        }

        watchdog_cancel.cancel();
        if let Err(e) = watchdog.await {
            debug!(error = %e, "watchdog task ended abnormally");
        }
        let _ = subscriber.disconnect(coordinator.broadcast_address());
        let _ = dispatcher.disconnect(&self.dispatcher_address);
        info!(address = %coordinator.broadcast_address(), "discovery listener stopped");
    }

    async fn handle(
        &self,
        message: Message,
        coordinator: &RendezvousEndpoint,
        dispatcher: &mut dyn Socket,
        signals: &Signals,
        on_restart: &RestartRequest,
    ) -> Result<(), MessageError> {
        match ControlKind::of(&message) {
            Some(ControlKind::Ping) => {
                signals.heartbeat.notify_one();
                let ping = message.payload::<Ping>()?;
                trace!(ping_id = ping.ping_id, "coordinator heartbeat");
                let pong = Message::create(
                    &Pong {
                        ping_id: ping.ping_id,
                        node: self.local.node(),
                    },
                    DistributionPattern::Unicast,
                )?;
                self.sender.enqueue(pong);
            }
            Some(kind) if kind.is_dispatcher_bound() => {
                if self.should_forward(kind, &message)? {
                    if let Err(e) = dispatcher.send(message).await {
                        warn!(?kind, error = %e, "failed to forward to dispatcher");
                    }
                } else {
                    trace!(?kind, "skipping own control message");
                }
            }
            Some(kind @ ControlKind::RendezvousConfigurationChanged)
            | Some(kind @ ControlKind::RendezvousNotLeader)
                if !self.is_authentic(&message) =>
            {
                warn!(?kind, domain = %message.domain, "ignoring unverified rendezvous announcement");
            }
            Some(ControlKind::RendezvousConfigurationChanged) => {
                let payload = message.payload::<RendezvousConfigurationChanged>()?;
                match self.directory.reconfigure(payload.nodes) {
                    Ok(()) => {
                        info!(nodes = ?self.directory.nodes(), "rendezvous configuration changed");
                        if self.directory.current().as_ref() != Some(coordinator) {
                            on_restart();
                        }
                        signals.reconfigured.notify_one();
                    }
                    Err(e) => warn!(error = %e, "ignoring invalid rendezvous configuration"),
                }
            }
            Some(ControlKind::RendezvousNotLeader) => {
                let payload = message.payload::<RendezvousNotLeader>()?;
                if payload.new_leader != *coordinator {
                    if self.directory.promote(&payload.new_leader) {
                        info!(leader = %payload.new_leader.unicast, "switching to rendezvous leader");
                        on_restart();
                        signals.reconfigured.notify_one();
                    } else {
                        error!(
                            leader = %payload.new_leader.unicast,
                            "announced rendezvous leader is not a configured server"
                        );
                    }
                }
            }
            kind => debug!(?kind, message = %message.identifier(), "dropping discovery message"),
        }
        Ok(())
    }

    fn is_authentic(&self, message: &Message) -> bool {
        message.verify(self.security.as_ref()).is_ok()
    }

    fn should_forward(&self, kind: ControlKind, message: &Message) -> Result<bool, MessageError> {
        let me = self.local.identity();
        let origin = match kind {
            ControlKind::RegisterExternalMessageRoute => {
                message.payload::<RegisterExternalMessageRoute>()?.node.identity
            }
            ControlKind::UnregisterMessageRoute => {
                message.payload::<UnregisterMessageRoute>()?.node.identity
            }
            ControlKind::UnregisterNode => message.payload::<UnregisterNode>()?.node.identity,
            ControlKind::DiscoverMessageRoute => {
                message.payload::<DiscoverMessageRoute>()?.requestor.identity
            }
            ControlKind::RequestClusterMessageRoutes => {
                message.payload::<RequestClusterMessageRoutes>()?.requestor.identity
            }
            ControlKind::RequestNodeMessageRoutes => {
                let payload = message.payload::<RequestNodeMessageRoutes>()?;
                if &payload.target_node_identity != me {
                    return Ok(false);
                }
                payload.requestor.identity
            }
            _ => return Ok(false),
        };
        Ok(&origin != me)
    }
}

async fn watchdog(
    directory: Arc<RendezvousDirectory>,
    silence: Duration,
    signals: Arc<Signals>,
    on_restart: RestartRequest,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = signals.heartbeat.notified() => {}
            _ = signals.reconfigured.notified() => {}
            _ = tokio::time::sleep(silence) => {
                warn!(silence = ?silence, "rendezvous server is silent, failing over");
                let previous = directory.current();
                directory.rotate();
                on_restart();
                if let Some(previous) = previous {
                    directory.refresh(&previous).await;
                }
            }
        }
    }
}
