//! Outbound connection cache
//!
//! Connections are keyed by remote socket address. A sender checks a
//! connection out, uses it exclusively, and checks it back in only if the
//! exchange succeeded, so a broken socket never returns to the pool.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::SinkExt;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;
use tracing::trace;

use super::frame::{FrameCodec, ACK_BYTE};
use crate::error::{CourierError, CourierResult};

/// An established outbound connection.
pub struct TcpConnection {
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    reader: OwnedReadHalf,
    /// Peer public key, when the caller knows it
    pub peer_pubkey: Option<Bytes>,
    /// Remote address
    pub peer_addr: SocketAddr,
    /// Unix seconds at connect
    pub connected_at: u64,
    /// False once any exchange on the socket failed
    pub alive: bool,
    last_used: Instant,
}

impl TcpConnection {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, connected_at: u64) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            writer: FramedWrite::new(writer, FrameCodec::new()),
            reader,
            peer_pubkey: None,
            peer_addr,
            connected_at,
            alive: true,
            last_used: Instant::now(),
        }
    }

    /// Write one frame and wait up to `ack_timeout` for the ack byte.
    pub async fn exchange(&mut self, payload: Bytes, ack_timeout: Duration) -> CourierResult<()> {
        let result = self.exchange_inner(payload, ack_timeout).await;
        self.alive = result.is_ok();
        self.last_used = Instant::now();
        result
    }

    async fn exchange_inner(&mut self, payload: Bytes, ack_timeout: Duration) -> CourierResult<()> {
        self.writer.send(payload).await?;

        let ack = tokio::time::timeout(ack_timeout, self.reader.read_u8())
            .await
            .map_err(|_| {
                CourierError::Timeout(format!("no ack from {} within {:?}", self.peer_addr, ack_timeout))
            })?
            .map_err(|e| CourierError::Network(format!("reading ack from {}: {}", self.peer_addr, e)))?;

        if ack != ACK_BYTE {
            return Err(CourierError::Protocol(format!(
                "unexpected ack byte {:#04x} from {}",
                ack, self.peer_addr
            )));
        }
        Ok(())
    }

    fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer_addr", &self.peer_addr)
            .field("connected_at", &self.connected_at)
            .field("alive", &self.alive)
            .finish_non_exhaustive()
    }
}

/// Bounded cache of idle outbound connections.
pub struct ConnectionPool {
    idle: Mutex<HashMap<SocketAddr, TcpConnection>>,
    max_connections: usize,
    max_idle: Duration,
}

impl ConnectionPool {
    /// Create a pool holding at most `max_connections`, each idle for at
    /// most `max_idle`.
    pub fn new(max_connections: usize, max_idle: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_connections,
            max_idle,
        }
    }

    /// Take the cached connection to `addr`, if one is fresh enough.
    pub fn checkout(&self, addr: &SocketAddr) -> Option<TcpConnection> {
        let conn = self.idle.lock().remove(addr)?;
        if !conn.alive || conn.idle_for() > self.max_idle {
            trace!(%addr, "Dropping stale pooled connection");
            return None;
        }
        Some(conn)
    }

    /// Return a healthy connection for reuse.
    pub fn checkin(&self, conn: TcpConnection) {
        if !conn.alive || self.max_connections == 0 {
            return;
        }
        let mut idle = self.idle.lock();
        if !idle.contains_key(&conn.peer_addr) && idle.len() >= self.max_connections {
            let oldest = idle
                .iter()
                .max_by_key(|(_, c)| c.idle_for())
                .map(|(addr, _)| *addr);
            if let Some(oldest) = oldest {
                idle.remove(&oldest);
            }
        }
        idle.insert(conn.peer_addr, conn);
    }

    /// Close connections idle longer than the configured bound.
    pub fn prune_idle(&self) -> usize {
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|_, c| c.alive && c.idle_for() <= self.max_idle);
        before - idle.len()
    }

    /// Drop every cached connection.
    pub fn clear(&self) {
        self.idle.lock().clear();
    }

    /// Number of cached connections
    pub fn len(&self) -> usize {
        self.idle.lock().len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (TcpConnection::new(client.unwrap(), addr, 0), server.unwrap().0)
    }

    #[tokio::test]
    async fn test_exchange_reads_ack() {
        let (mut conn, mut server) = connected_pair().await;

        let serve = tokio::spawn(async move {
            let len = server.read_u32().await.unwrap();
            let mut buf = vec![0u8; len as usize];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(&[ACK_BYTE]).await.unwrap();
            buf
        });

        conn.exchange(Bytes::from_static(b"ping"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(conn.alive);
        assert_eq!(serve.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_missing_ack_times_out() {
        let (mut conn, _server) = connected_pair().await;
        let err = conn
            .exchange(Bytes::from_static(b"ping"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Timeout(_)));
        assert!(!conn.alive);
    }

    #[tokio::test]
    async fn test_wrong_ack_is_protocol_error() {
        let (mut conn, mut server) = connected_pair().await;
        tokio::spawn(async move {
            let len = server.read_u32().await.unwrap();
            let mut buf = vec![0u8; len as usize];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(&[0x7F]).await.unwrap();
            // Hold the socket open until the client is done
            let _ = server.read_u8().await;
        });

        let err = conn
            .exchange(Bytes::from_static(b"ping"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_pool_checkout_checkin() {
        let pool = ConnectionPool::new(4, Duration::from_secs(60));
        let (conn, _server) = connected_pair().await;
        let addr = conn.peer_addr;

        assert!(pool.checkout(&addr).is_none());
        pool.checkin(conn);
        assert_eq!(pool.len(), 1);

        let conn = pool.checkout(&addr).expect("cached connection");
        assert!(pool.is_empty());

        let mut dead = conn;
        dead.alive = false;
        pool.checkin(dead);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_pool_expires_idle_connections() {
        let pool = ConnectionPool::new(4, Duration::from_millis(20));
        let (conn, _server) = connected_pair().await;
        let addr = conn.peer_addr;
        pool.checkin(conn);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.prune_idle(), 1);
        assert!(pool.checkout(&addr).is_none());
    }

    #[tokio::test]
    async fn test_pool_bounded() {
        let pool = ConnectionPool::new(1, Duration::from_secs(60));
        let (first, _s1) = connected_pair().await;
        let (second, _s2) = connected_pair().await;
        let second_addr = second.peer_addr;

        pool.checkin(first);
        pool.checkin(second);
        assert_eq!(pool.len(), 1);
        assert!(pool.checkout(&second_addr).is_some());
    }
}
