//! Listening sockets with backpressure.
//!
//! # Responsibilities
//! - Bind the configured address once, before any worker starts
//! - Accept stream connections, enforcing max_connections via semaphore
//! - Bind the shared UDP socket for datagram mode
//!
//! # Design Decisions
//! - Every worker accepts on the same listener; the kernel spreads load
//! - The listener outlives worker generations, so reloads keep the port

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;

use crate::config::ListenerConfig;
use crate::dispatch::TransportKind;

/// Largest datagram we read.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(std::io::Error),
    /// Failed to accept connection.
    Accept(std::io::Error),
    /// The connection limit semaphore was closed.
    Closed,
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(e) => write!(f, "Failed to bind: {}", e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
            ListenerError::Closed => write!(f, "Listener closed"),
        }
    }
}

impl std::error::Error for ListenerError {}

fn parse_addr(config: &ListenerConfig) -> Result<SocketAddr, ListenerError> {
    config
        .bind_address
        .parse()
        .map_err(|e| ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
#[derive(Debug)]
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Configured maximum connections.
    max_connections: usize,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr = parse_addr(config)?;
        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        // Then accept the connection
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// The bound socket shared by all workers.
#[derive(Debug, Clone)]
pub enum BoundTransport {
    Stream(Arc<Listener>),
    Datagram(Arc<UdpSocket>),
}

/// One unit of inbound work.
#[derive(Debug)]
pub enum Inbound {
    Stream(TcpStream, SocketAddr, ConnectionPermit),
    Datagram(Bytes, SocketAddr),
}

impl BoundTransport {
    pub async fn bind(config: &ListenerConfig, kind: TransportKind) -> Result<Self, ListenerError> {
        if kind.is_stream() {
            return Ok(Self::Stream(Arc::new(Listener::bind(config).await?)));
        }

        let addr = parse_addr(config)?;
        let socket = UdpSocket::bind(addr).await.map_err(ListenerError::Bind)?;
        tracing::info!(address = %socket.local_addr().map_err(ListenerError::Bind)?, "UDP socket bound");
        Ok(Self::Datagram(Arc::new(socket)))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        match self {
            Self::Stream(listener) => listener.local_addr(),
            Self::Datagram(socket) => socket.local_addr(),
        }
    }

    /// Wait for the next connection or datagram.
    pub async fn next(&self) -> Result<Inbound, ListenerError> {
        match self {
            Self::Stream(listener) => {
                let (stream, peer, permit) = listener.accept().await?;
                Ok(Inbound::Stream(stream, peer, permit))
            }
            Self::Datagram(socket) => {
                let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
                let (len, peer) = socket.recv_from(&mut buf).await.map_err(ListenerError::Accept)?;
                buf.truncate(len);
                Ok(Inbound::Datagram(Bytes::from(buf), peer))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> ListenerConfig {
        ListenerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            max_connections: 2,
        }
    }

    #[tokio::test]
    async fn binds_ephemeral_ports() {
        let stream = BoundTransport::bind(&local(), TransportKind::Tcp).await.unwrap();
        assert!(matches!(stream, BoundTransport::Stream(_)));
        assert_ne!(stream.local_addr().unwrap().port(), 0);

        let datagram = BoundTransport::bind(&local(), TransportKind::Udp).await.unwrap();
        assert!(matches!(datagram, BoundTransport::Datagram(_)));
    }

    #[tokio::test]
    async fn rejects_unparseable_address() {
        let config = ListenerConfig {
            bind_address: "nowhere".to_string(),
            max_connections: 1,
        };
        assert!(matches!(
            BoundTransport::bind(&config, TransportKind::Http).await,
            Err(ListenerError::Bind(_))
        ));
    }

    #[tokio::test]
    async fn datagrams_keep_their_peer() {
        let bound = BoundTransport::bind(&local(), TransportKind::Udp).await.unwrap();
        let addr = bound.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ant-ping", addr).await.unwrap();

        match bound.next().await.unwrap() {
            Inbound::Datagram(payload, peer) => {
                assert_eq!(payload, Bytes::from_static(b"ant-ping"));
                assert_eq!(peer, client.local_addr().unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
