//! Route-discovery request throttle.
//!
//! A dispatcher miss asks the cluster who handles a route. Misses for the
//! same route arrive in bursts, so requests are deduplicated while pending
//! and flushed in batches on a timer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::sender::DiscoveryMessageSender;
use crate::collections::HashedQueue;
use crate::config::DiscoveryConfig;
use crate::error::FabricError;
use crate::identifier::{Identifier, Node};
use crate::message::control::DiscoverMessageRoute;
use crate::message::{DistributionPattern, Message};
use crate::node::LocalNode;
use crate::security::SecurityProvider;

/// Deduplicating, rate-limited queue of route-discovery requests.
pub struct RouteDiscoveryThrottle {
    pending: Mutex<HashedQueue<Identifier>>,
    batch_size: usize,
    period: Duration,
    sender: Arc<DiscoveryMessageSender>,
    security: Arc<dyn SecurityProvider>,
    local: Arc<LocalNode>,
}

impl RouteDiscoveryThrottle {
    /// Create a throttle flushing onto `sender`.
    pub fn new(
        config: &DiscoveryConfig,
        sender: Arc<DiscoveryMessageSender>,
        security: Arc<dyn SecurityProvider>,
        local: Arc<LocalNode>,
    ) -> Self {
        Self {
            pending: Mutex::new(HashedQueue::bounded(
                config.max_discovery_request_queue_length,
            )),
            batch_size: config.discovery_requests_per_send_batch,
            period: config.discovery_sending_period,
            sender,
            security,
            local,
        }
    }

    /// Ask the cluster who handles `identifier`.
    ///
    /// Returns `false` when the request was already pending or the queue
    /// is full.
    pub fn request_discovery(&self, identifier: Identifier) -> bool {
        let queued = self.pending.lock().try_enqueue(identifier.clone());
        trace!(route = %identifier, queued, "route discovery requested");
        queued
    }

    /// Number of pending requests.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Flush one batch onto the discovery sender.
    ///
    /// Returns the number of messages enqueued.
    pub fn flush(&self) -> usize {
        let batch = self.pending.lock().peek(self.batch_size);
        if batch.is_empty() {
            return 0;
        }

        let requestor = self.local.node();
        let mut sent = 0;
        for route in &batch {
            for domain in self.domains(route) {
                match self.request(route, &domain, &requestor) {
                    Ok(message) => {
                        if self.sender.enqueue(message) {
                            sent += 1;
                        }
                    }
                    Err(e) => warn!(route = %route, domain = %domain, error = %e, "failed to build discovery request"),
                }
            }
        }
        self.pending.lock().remove_all(&batch);
        debug!(routes = batch.len(), messages = sent, "route discovery batch sent");
        sent
    }

    fn domains(&self, route: &Identifier) -> Vec<String> {
        match route {
            Identifier::Receiver(_) => self.security.allowed_domains(),
            Identifier::Message(identifier) => match self.security.domain_of(identifier) {
                Ok(domain) => vec![domain],
                Err(e) => {
                    warn!(route = %route, error = %e, "no domain for route, skipping discovery");
                    Vec::new()
                }
            },
        }
    }

    fn request(
        &self,
        route: &Identifier,
        domain: &str,
        requestor: &Node,
    ) -> Result<Message, FabricError> {
        let mut message = Message::create(
            &DiscoverMessageRoute {
                requestor: requestor.clone(),
                route: route.clone(),
            },
            DistributionPattern::Unicast,
        )?;
        message.set_domain(domain);
        message.sign(self.security.as_ref())?;
        Ok(message)
    }

    /// Flush loop, one batch per `discovery_sending_period`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(period = ?self.period, "route discovery throttle started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {
                    self.flush();
                }
            }
        }
        info!("route discovery throttle stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{MessageIdentifier, NodeIdentity, ReceiverIdentifier};
    use crate::rendezvous::{RendezvousDirectory, RendezvousEndpoint};
    use crate::security::SharedKeySecurityProvider;
    use crate::transport::InMemoryTransport;

    fn throttle(config: DiscoveryConfig) -> (Arc<DiscoveryMessageSender>, RouteDiscoveryThrottle) {
        let directory = Arc::new(
            RendezvousDirectory::new(vec![RendezvousEndpoint::new("inproc://u", "inproc://b")])
                .expect("valid"),
        );
        let local = Arc::new(LocalNode::new(NodeIdentity::new(b"me".to_vec())));
        let sender = Arc::new(DiscoveryMessageSender::new(
            directory,
            Arc::new(InMemoryTransport::new()),
            Arc::clone(&local),
            1000,
        ));
        let security = SharedKeySecurityProvider::new()
            .with_domain("a", b"ka".to_vec())
            .with_domain("b", b"kb".to_vec())
            .with_identity(b"IN-A".to_vec(), "a");
        let throttle =
            RouteDiscoveryThrottle::new(&config, Arc::clone(&sender), Arc::new(security), local);
        (sender, throttle)
    }

    fn message_route(identity: &[u8]) -> Identifier {
        Identifier::Message(MessageIdentifier::new(identity.to_vec(), 1, Vec::new()))
    }

    #[test]
    fn test_identical_requests_produce_one_message() {
        let (sender, throttle) = throttle(DiscoveryConfig::default());
        for _ in 0..10 {
            throttle.request_discovery(message_route(b"IN-A"));
        }
        assert_eq!(throttle.pending(), 1);
        assert_eq!(throttle.flush(), 1);
        assert_eq!(sender.queued(), 1);
        assert_eq!(throttle.pending(), 0);
    }

    #[test]
    fn test_request_can_be_requeued_after_flush() {
        let (_, throttle) = throttle(DiscoveryConfig::default());
        assert!(throttle.request_discovery(message_route(b"IN-A")));
        assert!(!throttle.request_discovery(message_route(b"IN-A")));
        throttle.flush();
        assert!(throttle.request_discovery(message_route(b"IN-A")));
    }

    #[test]
    fn test_receiver_wildcard_fans_out_per_domain() {
        let (sender, throttle) = throttle(DiscoveryConfig::default());
        throttle.request_discovery(Identifier::Receiver(ReceiverIdentifier::new(
            b"actor".to_vec(),
        )));
        assert_eq!(throttle.flush(), 2);
        assert_eq!(sender.queued(), 2);
    }

    #[test]
    fn test_unknown_domain_is_skipped_and_dropped() {
        let (sender, throttle) = throttle(DiscoveryConfig::default());
        throttle.request_discovery(message_route(b"UNKNOWN"));
        assert_eq!(throttle.flush(), 0);
        assert_eq!(sender.queued(), 0);
        assert_eq!(throttle.pending(), 0);
    }

    #[test]
    fn test_batch_and_capacity_limits() {
        let (_, throttle) = throttle(DiscoveryConfig {
            max_discovery_request_queue_length: 3,
            discovery_requests_per_send_batch: 2,
            ..DiscoveryConfig::default()
        });
        for i in 0..5u8 {
            throttle.request_discovery(message_route(&[b'X', i]));
        }
        assert_eq!(throttle.pending(), 3);
        throttle.flush();
        assert_eq!(throttle.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_on_period() {
        let (sender, throttle) = throttle(DiscoveryConfig::for_testing());
        let throttle = Arc::new(throttle);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&throttle).run(cancel.clone()));

        throttle.request_discovery(message_route(b"IN-A"));
        tokio::time::sleep(DiscoveryConfig::for_testing().discovery_sending_period * 2).await;
        assert_eq!(sender.queued(), 1);

        cancel.cancel();
        handle.await.expect("join");
    }
}
