//! Outbound half of the discovery channel.

use std::sync::Arc;

use tokio::sync::{mpsc, Barrier, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::message::Message;
use crate::node::LocalNode;
use crate::rendezvous::RendezvousDirectory;
use crate::transport::{Socket, SocketFactory, SocketKind};

/// Sends queued control messages to the current coordinator.
///
/// [`enqueue`](Self::enqueue) never blocks; [`run`](Self::run) drains the
/// queue into a dealer socket connected to the coordinator's unicast
/// address until cancelled.
pub struct DiscoveryMessageSender {
    directory: Arc<RendezvousDirectory>,
    transport: Arc<dyn SocketFactory>,
    local: Arc<LocalNode>,
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
}

impl DiscoveryMessageSender {
    /// Create a sender with a queue of `queue_length` messages.
    pub fn new(
        directory: Arc<RendezvousDirectory>,
        transport: Arc<dyn SocketFactory>,
        local: Arc<LocalNode>,
        queue_length: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_length.max(1));
        Self {
            directory,
            transport,
            local,
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Queue `message` for sending. Returns `false` if the queue is full.
    pub fn enqueue(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                trace!(error = %e, "discovery message rejected");
                false
            }
        }
    }

    /// Number of messages waiting to be sent.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Send loop. Waits on `barrier` once the socket is connected.
    ///
    /// On cancellation whatever is still queued is discarded.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, barrier: Arc<Barrier>) {
        let connection = self.directory.current().map(|endpoint| {
            let address = endpoint.unicast_address().to_string();
            let mut socket = self.transport.create_socket(
                SocketKind::Dealer,
                Some(self.local.identity().as_bytes().to_vec()),
            );
            let connected = socket.connect(&address);
            (socket, address, connected)
        });
        barrier.wait().await;

        let (mut socket, address) = match connection {
            Some((socket, address, Ok(()))) => (socket, address),
            Some((_, address, Err(e))) => {
                warn!(address = %address, error = %e, "discovery sender failed to connect");
                return;
            }
            None => {
                warn!("no rendezvous server to send to");
                return;
            }
        };
        info!(address = %address, "discovery sender started");

        let mut rx = tokio::select! {
            _ = cancel.cancelled() => return,
            rx = self.rx.lock() => rx,
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(message) => send(socket.as_mut(), message).await,
                    None => break,
                },
            }
        }

        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if let Err(e) = socket.disconnect(&address) {
            debug!(address = %address, error = %e, "disconnect failed");
        }
        info!(address = %address, discarded, "discovery sender stopped");
    }
}

async fn send(socket: &mut dyn Socket, message: Message) {
    let identifier = message.identifier();
    match socket.send(message).await {
        Ok(()) => trace!(message = %identifier, "discovery message sent"),
        Err(e) => warn!(message = %identifier, error = %e, "discovery message not sent"),
    }
}
