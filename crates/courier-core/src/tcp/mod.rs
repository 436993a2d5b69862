//! TCP Direct Transport
//!
//! Used when a peer's presence record advertises a reachable address.
//!
//! ## Inbound
//!
//! ```text
//! permit ──▶ accept loop ──spawn──▶ handler (one per connection, tracked in a JoinSet)
//!                                      │ FramedRead<FrameCodec>
//!                                      ├─ frame ──▶ dispatcher ──▶ write 0x01
//!                                      ├─ no frame within inbound_idle ──▶ drop connection
//!                                      └─ oversized / zero / garbled ──▶ drop connection
//! ```
//!
//! At most `max_inbound_connections` handlers run at once. The accept loop
//! waits for a free permit before taking the next connection off the
//! backlog.
//!
//! Senders are not authenticated at this layer. Frames are opaque
//! ciphertext and arrive with no identity attached.
//!
//! ## Outbound
//!
//! `send_direct` reuses a pooled connection when one exists. If the pooled
//! socket fails, it is evicted and the frame is retried once on a fresh
//! connection.

mod frame;
mod pool;

pub use frame::{FrameCodec, ACK_BYTE, MAX_FRAME_SIZE};
pub use pool::{ConnectionPool, TcpConnection};

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::TransportConfig;
use crate::error::{CourierError, CourierResult};
use crate::transport::{InboundMessage, InboundSender};

/// Successful delivery receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Address that acknowledged
    pub peer_addr: SocketAddr,
    /// Delivered over a pooled connection
    pub reused: bool,
}

struct ListenerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Framed TCP listener and sender.
pub struct TcpTransport {
    inbound: InboundSender,
    clock: SharedClock,
    pool: ConnectionPool,
    ack_timeout: Duration,
    connect_timeout: Duration,
    inbound_idle: Duration,
    max_inbound: usize,
    listener: Mutex<Option<ListenerHandle>>,
    active_inbound: Arc<AtomicUsize>,
}

impl TcpTransport {
    /// Create a transport delivering inbound frames to `inbound`.
    pub fn new(config: &TransportConfig, clock: SharedClock, inbound: InboundSender) -> Self {
        Self {
            inbound,
            clock,
            pool: ConnectionPool::new(config.max_pooled_connections, config.pool_idle()),
            ack_timeout: config.ack_timeout(),
            connect_timeout: config.connect_timeout(),
            inbound_idle: config.inbound_idle(),
            max_inbound: config.max_inbound_connections.max(1),
            listener: Mutex::new(None),
            active_inbound: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The outbound connection cache
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Inbound connections currently being served
    pub fn active_inbound(&self) -> usize {
        self.active_inbound.load(Ordering::SeqCst)
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|l| l.local_addr)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Listener
    // ═══════════════════════════════════════════════════════════════════════

    /// Bind on all interfaces and start accepting. Port 0 picks an
    /// ephemeral port; the bound address is returned.
    pub async fn start_listener(&self, port: u16) -> CourierResult<SocketAddr> {
        if self.listener.lock().is_some() {
            return Err(CourierError::InvalidState("listener already running".to_string()));
        }

        let listener = TcpListener::bind((IpAddr::from([0, 0, 0, 0]), port)).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            cancel.clone(),
            Inbound {
                sender: self.inbound.clone(),
                clock: self.clock.clone(),
                active: self.active_inbound.clone(),
                permits: Arc::new(Semaphore::new(self.max_inbound)),
                idle: self.inbound_idle,
            },
        ));

        let mut slot = self.listener.lock();
        if slot.is_some() {
            cancel.cancel();
            return Err(CourierError::InvalidState("listener already running".to_string()));
        }
        *slot = Some(ListenerHandle {
            local_addr,
            cancel,
            accept_task,
        });
        info!(%local_addr, "TCP listener started");
        Ok(local_addr)
    }

    /// Close the listening socket and wait for every connection handler.
    pub async fn stop_listener(&self) {
        let handle = self.listener.lock().take();
        let Some(handle) = handle else {
            return;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.accept_task.await {
            warn!(error = %e, "TCP accept loop ended abnormally");
        }
        info!(local_addr = %handle.local_addr, "TCP listener stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending
    // ═══════════════════════════════════════════════════════════════════════

    /// Deliver one frame to `address:port` and wait for its ack.
    pub async fn send_direct(&self, address: &str, port: u16, data: Bytes) -> CourierResult<Ack> {
        self.send_to_peer(address, port, data, None).await
    }

    /// As [`TcpTransport::send_direct`], tagging a new connection with the
    /// peer's public key.
    pub async fn send_to_peer(
        &self,
        address: &str,
        port: u16,
        data: Bytes,
        peer_pubkey: Option<Bytes>,
    ) -> CourierResult<Ack> {
        if data.is_empty() {
            return Err(CourierError::Param("payload is empty".to_string()));
        }
        if data.len() > MAX_FRAME_SIZE {
            return Err(CourierError::Param(format!(
                "payload of {} bytes exceeds {}",
                data.len(),
                MAX_FRAME_SIZE
            )));
        }
        if port == 0 {
            return Err(CourierError::Param("port must be non-zero".to_string()));
        }
        let ip: IpAddr = address
            .parse()
            .map_err(|_| CourierError::Param(format!("not an IP address: {:?}", address)))?;
        let addr = SocketAddr::new(ip, port);

        if let Some(mut conn) = self.pool.checkout(&addr) {
            match conn.exchange(data.clone(), self.ack_timeout).await {
                Ok(()) => {
                    self.pool.checkin(conn);
                    return Ok(Ack {
                        peer_addr: addr,
                        reused: true,
                    });
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Pooled connection failed, retrying on a fresh one");
                }
            }
        }

        let mut conn = self.connect(addr).await?;
        conn.peer_pubkey = peer_pubkey;
        conn.exchange(data, self.ack_timeout).await?;
        self.pool.checkin(conn);
        Ok(Ack {
            peer_addr: addr,
            reused: false,
        })
    }

    async fn connect(&self, addr: SocketAddr) -> CourierResult<TcpConnection> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CourierError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| CourierError::Network(format!("connecting to {}: {}", addr, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "set_nodelay failed");
        }
        Ok(TcpConnection::new(stream, addr, self.clock.now_secs()))
    }

    /// Stop listening and drop every cached connection.
    pub async fn shutdown(&self) {
        self.stop_listener().await;
        self.pool.clear();
    }
}

/// Shared state of one listener's connection handlers
struct Inbound {
    sender: InboundSender,
    clock: SharedClock,
    active: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
    idle: Duration,
}

async fn accept_loop(listener: TcpListener, cancel: CancellationToken, inbound: Inbound) {
    let mut handlers = JoinSet::new();
    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = inbound.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                log_finished(finished);
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let connected_at = inbound.clock.now_secs();
                    debug!(%peer_addr, connected_at, "Accepted TCP connection");
                    handlers.spawn(handle_connection(
                        stream,
                        peer_addr,
                        inbound.sender.clone(),
                        cancel.clone(),
                        inbound.active.clone(),
                        inbound.idle,
                        permit,
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "TCP accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                log_finished(finished);
            }
        }
    }

    drop(listener);
    while let Some(finished) = handlers.join_next().await {
        log_finished(finished);
    }
}

fn log_finished(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        warn!(error = %e, "Connection handler panicked");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    inbound: InboundSender,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
    idle: Duration,
    _permit: OwnedSemaphorePermit,
) {
    active.fetch_add(1, Ordering::SeqCst);
    let (reader, mut writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, FrameCodec::new());

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(idle, frames.next()) => next,
        };
        let next = match next {
            Ok(next) => next,
            Err(_) => {
                debug!(%peer_addr, idle_secs = idle.as_secs(), "No frame within idle bound, dropping connection");
                break;
            }
        };
        match next {
            Some(Ok(payload)) => {
                debug!(%peer_addr, len = payload.len(), "Received TCP frame");
                if inbound
                    .send(InboundMessage::from_tcp(payload, peer_addr))
                    .await
                    .is_err()
                {
                    debug!(%peer_addr, "Dispatcher gone, dropping connection");
                    break;
                }
                if let Err(e) = writer.write_all(&[ACK_BYTE]).await {
                    debug!(%peer_addr, error = %e, "Writing ack failed");
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(%peer_addr, error = %e, "Dropping connection");
                break;
            }
            None => break,
        }
    }
    active.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    fn transport() -> (TcpTransport, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let config = TransportConfig {
            ack_timeout_ms: 1_000,
            ..Default::default()
        };
        (TcpTransport::new(&config, system_clock(), tx), rx)
    }

    #[tokio::test]
    async fn test_send_direct_roundtrip() {
        let (server, mut rx) = transport();
        let (client, _) = transport();
        let addr = server.start_listener(0).await.unwrap();

        let ack = client
            .send_direct("127.0.0.1", addr.port(), Bytes::from_static(b"ciphertext"))
            .await
            .unwrap();
        assert!(!ack.reused);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.ciphertext, Bytes::from_static(b"ciphertext"));
        assert!(message.peer_pubkey.is_none());
        assert!(message.sender_fingerprint.is_none());

        // Second send rides the pooled connection
        let ack = client
            .send_direct("127.0.0.1", addr.port(), Bytes::from_static(b"again"))
            .await
            .unwrap();
        assert!(ack.reused);
        assert_eq!(rx.recv().await.unwrap().ciphertext, Bytes::from_static(b"again"));

        server.stop_listener().await;
    }

    #[tokio::test]
    async fn test_stale_pooled_connection_retried_once() {
        let (first_server, mut rx1) = transport();
        let (client, _) = transport();
        let addr = first_server.start_listener(0).await.unwrap();

        client
            .send_direct("127.0.0.1", addr.port(), Bytes::from_static(b"one"))
            .await
            .unwrap();
        rx1.recv().await.unwrap();
        assert_eq!(client.pool().len(), 1);

        // Restart the listener on the same port; the pooled socket is dead
        first_server.stop_listener().await;
        let (second_server, mut rx2) = transport();
        second_server.start_listener(addr.port()).await.unwrap();

        let ack = client
            .send_direct("127.0.0.1", addr.port(), Bytes::from_static(b"two"))
            .await
            .unwrap();
        assert!(!ack.reused);
        assert_eq!(rx2.recv().await.unwrap().ciphertext, Bytes::from_static(b"two"));
        second_server.stop_listener().await;
    }

    #[tokio::test]
    async fn test_zero_length_frame_drops_connection() {
        let (server, mut rx) = transport();
        let addr = server.start_listener(0).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        stream.write_all(&0u32.to_be_bytes()).await.unwrap();

        let mut buf = [0u8; 1];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "connection should be closed without an ack");
        assert!(rx.try_recv().is_err());
        server.stop_listener().await;
    }

    #[tokio::test]
    async fn test_bad_arguments_rejected() {
        let (client, _) = transport();
        assert!(matches!(
            client.send_direct("127.0.0.1", 1, Bytes::new()).await,
            Err(CourierError::Param(_))
        ));
        assert!(matches!(
            client.send_direct("not an ip", 1, Bytes::from_static(b"x")).await,
            Err(CourierError::Param(_))
        ));
        assert!(matches!(
            client.send_direct("127.0.0.1", 0, Bytes::from_static(b"x")).await,
            Err(CourierError::Param(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let (client, _) = transport();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = client
            .send_direct("127.0.0.1", port, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_idle_inbound_connection_closed() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = TransportConfig {
            inbound_idle_secs: 1,
            ..Default::default()
        };
        let server = TcpTransport::new(&config, system_clock(), tx);
        let addr = server.start_listener(0).await.unwrap();

        // Half a header, then silence
        let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        stream.write_all(&[0, 0]).await.unwrap();

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("server gives up on the idle connection")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(server.active_inbound(), 0);
        server.stop_listener().await;
    }

    #[tokio::test]
    async fn test_inbound_connection_limit_enforced() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = TransportConfig {
            max_inbound_connections: 1,
            ack_timeout_ms: 500,
            ..Default::default()
        };
        let server = TcpTransport::new(&config, system_clock(), tx);
        let addr = server.start_listener(0).await.unwrap();
        let (client, _) = transport();

        // Holds the only permit
        let hog = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        while server.active_inbound() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = client
            .send_direct("127.0.0.1", addr.port(), Bytes::from_static(b"blocked"))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Timeout(_)));
        assert_eq!(server.active_inbound(), 1);

        drop(hog);
        client
            .send_direct("127.0.0.1", addr.port(), Bytes::from_static(b"after"))
            .await
            .unwrap();
        loop {
            let message = rx.recv().await.unwrap();
            if message.ciphertext == Bytes::from_static(b"after") {
                break;
            }
        }
        server.stop_listener().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected_and_stop_is_idempotent() {
        let (server, _rx) = transport();
        server.start_listener(0).await.unwrap();
        assert!(matches!(
            server.start_listener(0).await,
            Err(CourierError::InvalidState(_))
        ));
        server.stop_listener().await;
        server.stop_listener().await;
        assert!(server.local_addr().is_none());
    }
}
