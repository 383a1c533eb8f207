//! Transport capability set and the server/client wrappers built on it

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use treecast_core::{Message, TreecastResult};

/// Transport lifecycle. A transport is either listening or connected, never
/// both, and is never reused once closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Listening,
    Connected,
    Closed,
}

impl TransportState {
    pub fn is_active(self) -> bool {
        matches!(self, TransportState::Listening | TransportState::Connected)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Idle => "idle",
            TransportState::Listening => "listening",
            TransportState::Connected => "connected",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Transport trait for carrying messages between tree nodes
///
/// Implementations own a bounded inbound queue (messages received from peers)
/// and a bounded outbound queue (messages to write to the connected peer).
/// Node and orchestrator code only ever sees this trait, so any
/// implementation can be swapped in through a [`TransportFactory`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind `address` and accept inbound connections.
    ///
    /// # Errors
    ///
    /// `AlreadyActive` if listening or connected, `TransportClosed` after
    /// close, `Bind` if the address cannot be bound.
    async fn listen(&self, address: &str) -> TreecastResult<()>;

    /// Dial a remote peer and start writing the outbound queue to it.
    ///
    /// # Errors
    ///
    /// `AlreadyActive` if listening or connected, `TransportClosed` after
    /// close, `Connect` if the peer cannot be reached.
    async fn connect(&self, address: &str) -> TreecastResult<()>;

    /// Stop every spawned loop, release the socket and retire both queues.
    /// Closing a closed transport is a no-op.
    async fn close(&self) -> TreecastResult<()>;

    /// Read end of the inbound queue; can be taken once.
    fn take_inbound(&self) -> TreecastResult<mpsc::Receiver<Message>>;

    /// Write end of the outbound queue
    fn outbound(&self) -> mpsc::Sender<Message>;

    fn state(&self) -> TransportState;

    /// Locally bound address while listening
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Creates a fresh transport for each server and client of an assembly
pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

/// Accepts inbound connections on a fixed address
pub struct Server {
    transport: Arc<dyn Transport>,
    address: String,
}

impl Server {
    pub fn new(transport: Arc<dyn Transport>, address: impl Into<String>) -> Self {
        Server {
            transport,
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Start listening on the server address
    pub async fn start(&self) -> TreecastResult<()> {
        self.transport.listen(&self.address).await
    }

    pub fn take_inbound(&self) -> TreecastResult<mpsc::Receiver<Message>> {
        self.transport.take_inbound()
    }

    pub fn outbound(&self) -> mpsc::Sender<Message> {
        self.transport.outbound()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn state(&self) -> TransportState {
        self.transport.state()
    }

    pub async fn close(&self) -> TreecastResult<()> {
        self.transport.close().await
    }
}

/// Dials one child at a fixed address
pub struct Client {
    transport: Arc<dyn Transport>,
    address: String,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, address: impl Into<String>) -> Self {
        Client {
            transport,
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect to the remote address
    pub async fn connect(&self) -> TreecastResult<()> {
        self.transport.connect(&self.address).await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.state() == TransportState::Connected
    }

    pub fn outbound(&self) -> mpsc::Sender<Message> {
        self.transport.outbound()
    }

    pub fn state(&self) -> TransportState {
        self.transport.state()
    }

    pub async fn close(&self) -> TreecastResult<()> {
        self.transport.close().await
    }
}
