//! TCP transport implementation
//!
//! Server role accepts any number of connections and reads newline-delimited
//! messages from each one. Client role holds exactly one connection and writes
//! the outbound queue to it in order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use treecast_core::{Message, TreecastError, TreecastResult};

use crate::shared::{Lifecycle, Queues};
use crate::transport::{Transport, TransportFactory, TransportState};
use crate::wire::{decode_line, dial_address, encode_line, listen_address, MAX_LINE_LENGTH};

/// How long a dial may take before it counts as a failed attempt
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport for treecast
pub struct TcpTransport {
    lifecycle: Lifecycle,
    queues: Queues,
    local_addr: RwLock<Option<SocketAddr>>,
    peer_addr: RwLock<Option<SocketAddr>>,
    dial_timeout: Duration,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_dial_timeout(DEFAULT_DIAL_TIMEOUT)
    }

    pub fn with_dial_timeout(dial_timeout: Duration) -> Self {
        TcpTransport {
            lifecycle: Lifecycle::new(),
            queues: Queues::new(),
            local_addr: RwLock::new(None),
            peer_addr: RwLock::new(None),
            dial_timeout,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Factory producing a fresh TCP transport per server or client
    pub fn factory() -> TransportFactory {
        Arc::new(|| Arc::new(TcpTransport::new()) as Arc<dyn Transport>)
    }

    /// Remote address while connected
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.read()
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, address: &str) -> TreecastResult<()> {
        self.lifecycle.ensure_idle()?;

        let bind_addr = listen_address(address);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| TreecastError::Bind {
                address: bind_addr.clone(),
                reason: e.to_string(),
            })?;
        let local = listener.local_addr().ok();

        self.lifecycle.activate(TransportState::Listening)?;
        let inbound = self.queues.inbound_sender()?;
        let outbound = self.queues.take_outbound()?;
        *self.local_addr.write() = local;

        tracing::info!("TCP transport listening on {}", local.map_or(bind_addr, |a| a.to_string()));

        self.tasks.spawn(accept_loop(
            listener,
            inbound,
            self.cancel.clone(),
            self.tasks.clone(),
        ));
        self.tasks.spawn(drain_outbound(outbound, None, self.cancel.clone()));
        Ok(())
    }

    async fn connect(&self, address: &str) -> TreecastResult<()> {
        self.lifecycle.ensure_idle()?;

        let target = dial_address(address);
        let stream = match timeout(self.dial_timeout, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TreecastError::Connect {
                    address: target,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TreecastError::Connect {
                    address: target,
                    reason: format!("timed out after {:?}", self.dial_timeout),
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("TCP: could not disable Nagle on {}: {}", target, e);
        }

        self.lifecycle.activate(TransportState::Connected)?;
        let outbound = self.queues.take_outbound()?;
        *self.peer_addr.write() = stream.peer_addr().ok();

        tracing::info!("TCP transport connected to {}", target);

        self.tasks
            .spawn(drain_outbound(outbound, Some(stream), self.cancel.clone()));
        Ok(())
    }

    async fn close(&self) -> TreecastResult<()> {
        if !self.lifecycle.close() {
            return Ok(());
        }

        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.queues.retire();

        tracing::debug!("TCP transport closed");
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

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }
}

/// Accept connections until cancelled, one reader task per connection
async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("TCP: accepted connection from {}", peer);
                    tasks.spawn(read_connection(stream, peer, inbound.clone(), cancel.clone()));
                }
                Err(e) => tracing::warn!("TCP: failed to accept connection: {}", e),
            }
        }
    }
}

/// Read lines from one connection into the inbound queue. Any read error,
/// including a line longer than `MAX_LINE_LENGTH`, ends this connection only.
async fn read_connection(
    stream: TcpStream,
    peer: SocketAddr,
    inbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next() => line,
        };

        match line {
            Some(Ok(line)) => {
                let Some(msg) = decode_line(&line) else {
                    continue;
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = inbound.send(msg) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                tracing::trace!("TCP: received message from {}: {}", peer, line);
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!(
                    "TCP: line from {} exceeds {} bytes, dropping connection",
                    peer,
                    MAX_LINE_LENGTH
                );
                return;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                tracing::warn!("TCP: read error on connection from {}: {}", peer, e);
                return;
            }
            None => {
                tracing::debug!("TCP: connection from {} closed", peer);
                return;
            }
        }
    }
}

/// Write queued messages to the connection in enqueue order. A failed write
/// is logged and the next message is tried.
async fn drain_outbound(
    mut outbound: mpsc::Receiver<Message>,
    mut conn: Option<TcpStream>,
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

        let Some(stream) = conn.as_mut() else {
            tracing::warn!("TCP: failed to send message {}: {}", msg, TreecastError::NotConnected);
            continue;
        };

        let line = encode_line(&msg);
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = stream.write_all(line.as_bytes()) => written,
        };
        match written {
            Ok(()) => tracing::trace!("TCP: sent message {}", msg),
            Err(e) => tracing::warn!("TCP: failed to write message {}: {}", msg, e),
        }
    }

    if let Some(mut stream) = conn {
        let _ = stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;

    const WAIT: Duration = Duration::from_secs(2);

    async fn listening() -> (TcpTransport, SocketAddr, mpsc::Receiver<Message>) {
        let transport = TcpTransport::new();
        transport.listen("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap();
        let inbound = transport.take_inbound().unwrap();
        (transport, addr, inbound)
    }

    #[tokio::test]
    async fn test_server_decodes_ping() {
        let (transport, addr, mut inbound) = listening().await;
        assert_eq!(transport.state(), TransportState::Listening);

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"ping\n").await.unwrap();

        let msg = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert_eq!(msg.content(), "ping");
        assert!(msg.id().is_empty());
        assert!(msg.source().is_empty());
        assert!(msg.timestamp().is_none());

        // Exactly one message for one line
        assert!(timeout(Duration::from_millis(100), inbound.recv()).await.is_err());

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_reads_concurrent_connections() {
        let (transport, addr, mut inbound) = listening().await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"from first\r\n\n").await.unwrap();
        second.write_all(b"from second\n").await.unwrap();

        let mut contents = Vec::new();
        for _ in 0..2 {
            let msg = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
            contents.push(msg.content().to_string());
        }
        contents.sort();
        assert_eq!(contents, vec!["from first", "from second"]);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_disconnect_leaves_listener_running() {
        let (transport, addr, mut inbound) = listening().await;

        let mut gone = TcpStream::connect(addr).await.unwrap();
        gone.write_all(b"bye\n").await.unwrap();
        drop(gone);
        assert_eq!(timeout(WAIT, inbound.recv()).await.unwrap().unwrap().content(), "bye");

        let mut later = TcpStream::connect(addr).await.unwrap();
        later.write_all(b"still here\n").await.unwrap();
        assert_eq!(
            timeout(WAIT, inbound.recv()).await.unwrap().unwrap().content(),
            "still here"
        );

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_line_drops_connection() {
        let (transport, addr, mut inbound) = listening().await;

        let mut flood = TcpStream::connect(addr).await.unwrap();
        let chunk = vec![b'x'; MAX_LINE_LENGTH];
        for _ in 0..4 {
            // The server may reset the socket part way through
            if flood.write_all(&chunk).await.is_err() {
                break;
            }
        }

        let mut buf = [0u8; 16];
        let read = timeout(WAIT, flood.read(&mut buf))
            .await
            .expect("server kept an undelimited line open");
        assert!(matches!(read, Ok(0) | Err(_)), "unexpected read {read:?}");
        assert!(inbound.try_recv().is_err());

        // Other peers are unaffected
        let mut next = TcpStream::connect(addr).await.unwrap();
        next.write_all(b"short\n").await.unwrap();
        assert_eq!(timeout(WAIT, inbound.recv()).await.unwrap().unwrap().content(), "short");

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_writes_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = TcpTransport::new();
        transport.connect(&addr.to_string()).await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        assert_eq!(transport.peer_addr(), Some(addr));
        let (mut accepted, _) = listener.accept().await.unwrap();

        let outbound = transport.outbound();
        outbound.send(Message::new("one", "1")).await.unwrap();
        outbound.send(Message::new("two\n", "2")).await.unwrap();
        outbound.send(Message::new("three", "3")).await.unwrap();

        let expected = b"one\ntwo\nthree\n";
        let mut buf = vec![0u8; expected.len()];
        timeout(WAIT, accepted.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, expected);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_role_per_transport() {
        let (transport, addr, _inbound) = listening().await;

        assert_eq!(
            transport.listen("127.0.0.1:0").await.unwrap_err(),
            TreecastError::AlreadyActive
        );
        assert_eq!(
            transport.connect(&addr.to_string()).await.unwrap_err(),
            TreecastError::AlreadyActive
        );

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let (first, addr, _inbound) = listening().await;

        let second = TcpTransport::new();
        let err = second.listen(&addr.to_string()).await.unwrap_err();
        assert!(matches!(err, TreecastError::Bind { .. }), "got {err:?}");
        assert_eq!(second.state(), TransportState::Idle);

        first.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let transport = TcpTransport::new();
        let err = transport.connect(&addr.to_string()).await.unwrap_err();
        assert!(matches!(err, TreecastError::Connect { .. }), "got {err:?}");
        assert_eq!(transport.state(), TransportState::Idle);
    }

    #[tokio::test]
    async fn test_close_retires_queues() {
        let (transport, addr, mut inbound) = listening().await;
        let outbound = transport.outbound();

        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);

        // Listener released
        assert!(timeout(WAIT, inbound.recv()).await.unwrap().is_none());
        assert!(outbound.send(Message::from_wire("late")).await.is_err());
        assert!(TcpListener::bind(addr).await.is_ok());

        // No reuse, repeated close is harmless
        assert_eq!(
            transport.listen("127.0.0.1:0").await.unwrap_err(),
            TreecastError::TransportClosed
        );
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_with_open_connections() {
        let (transport, addr, _inbound) = listening().await;
        let _idle_peer = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        timeout(WAIT, transport.close()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_idle_transport() {
        let transport = TcpTransport::new();
        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);
    }
}
