//! In-process transport
//!
//! Listeners register their inbound queue under an address in a shared
//! [`MemoryNetwork`]; connecting looks the address up and forwards the
//! outbound queue straight into it. Useful for wiring whole trees inside one
//! process and for exercising the orchestrator without sockets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use treecast_core::{Message, TreecastError, TreecastResult};

use crate::shared::{Lifecycle, Queues};
use crate::transport::{Transport, TransportFactory, TransportState};

/// Address registry shared by the memory transports of one simulated network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<Message>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory producing memory transports attached to this network
    pub fn factory(&self) -> TransportFactory {
        let network = self.clone();
        Arc::new(move || Arc::new(MemoryTransport::new(network.clone())) as Arc<dyn Transport>)
    }

    /// Addresses currently listening
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.listeners.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    fn register(&self, address: &str, inbound: mpsc::Sender<Message>) -> TreecastResult<()> {
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(address) {
            return Err(TreecastError::Bind {
                address: address.to_string(),
                reason: "address already in use".to_string(),
            });
        }
        listeners.insert(address.to_string(), inbound);
        Ok(())
    }

    fn lookup(&self, address: &str) -> TreecastResult<mpsc::Sender<Message>> {
        self.listeners
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| TreecastError::Connect {
                address: address.to_string(),
                reason: "no listener at address".to_string(),
            })
    }

    fn unregister(&self, address: &str) {
        self.listeners.lock().remove(address);
    }
}

/// Transport over a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: MemoryNetwork,
    lifecycle: Lifecycle,
    queues: Queues,
    listening_on: Mutex<Option<String>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl MemoryTransport {
    pub fn new(network: MemoryNetwork) -> Self {
        MemoryTransport {
            network,
            lifecycle: Lifecycle::new(),
            queues: Queues::new(),
            listening_on: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(address) = self.listening_on.lock().take() {
            self.network.unregister(&address);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, address: &str) -> TreecastResult<()> {
        self.lifecycle.ensure_idle()?;

        self.network.register(address, self.queues.inbound_sender()?)?;
        if let Err(e) = self.lifecycle.activate(TransportState::Listening) {
            self.network.unregister(address);
            return Err(e);
        }
        *self.listening_on.lock() = Some(address.to_string());
        let outbound = self.queues.take_outbound()?;

        tracing::debug!("memory transport listening on {}", address);
        self.tasks
            .spawn(forward_outbound(outbound, None, self.cancel.clone()));
        Ok(())
    }

    async fn connect(&self, address: &str) -> TreecastResult<()> {
        self.lifecycle.ensure_idle()?;

        let peer = self.network.lookup(address)?;
        self.lifecycle.activate(TransportState::Connected)?;
        let outbound = self.queues.take_outbound()?;

        tracing::debug!("memory transport connected to {}", address);
        self.tasks
            .spawn(forward_outbound(outbound, Some(peer), self.cancel.clone()));
        Ok(())
    }

    async fn close(&self) -> TreecastResult<()> {
        if !self.lifecycle.close() {
            return Ok(());
        }

        let listening_on = self.listening_on.lock().take();
        if let Some(address) = listening_on {
            self.network.unregister(&address);
        }

        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.queues.retire();
        Ok(())
    }

    fn take_inbound(&self) -> TreecastResult<mpsc::Receiver<Message>> {
        self.queues.take_inbound()
    }

    fn outbound(&self) -> mpsc::Sender<Message> {
        self.queues.outbound()
    }

    fn state(&self) -> TransportState {
        self.lifecycle.get()
    }
}

/// Move queued messages into the peer's inbound queue, one at a time
async fn forward_outbound(
    mut outbound: mpsc::Receiver<Message>,
    peer: Option<mpsc::Sender<Message>>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(msg) => msg,
                None => break,
            },
        };

        let Some(peer) = peer.as_ref() else {
            tracing::warn!("memory: failed to send message {}: {}", msg, TreecastError::NotConnected);
            continue;
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = peer.send(msg) => {
                if let Err(e) = sent {
                    tracing::warn!("memory: peer gone, dropping message {}", e.0);
                }
            }
        }
    }
}
