//! TCP listener with optional connection limit.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections
//! - Enforce `max_connections` via a semaphore
//! - Tell transient accept errors apart from fatal ones

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to accept: {0}")]
    Accept(io::Error),
}

impl ListenerError {
    /// Accept errors that only affect one connection attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ListenerError::Accept(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
            ) || is_fd_exhaustion(e),
            ListenerError::Bind { .. } => false,
        }
    }
}

/// EMFILE/ENFILE: back off and retry rather than stopping the server.
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23) | Some(24))
}

/// A TCP listener that optionally bounds concurrent connections.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Option<Arc<Semaphore>>,
}

impl Listener {
    pub async fn bind(addr: &str, max_connections: Option<usize>) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self::from_tcp(listener, max_connections))
    }

    pub fn from_tcp(listener: TcpListener, max_connections: Option<usize>) -> Self {
        if let Ok(local) = listener.local_addr() {
            tracing::info!(address = %local, max_connections = ?max_connections, "Listener bound");
        }
        Self {
            inner: listener,
            connection_limit: max_connections.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Accept a connection, waiting for a free slot first when limited.
    /// The permit must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, Option<OwnedSemaphorePermit>), ListenerError> {
        let permit = match &self.connection_limit {
            Some(limit) => Some(
                limit
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| ListenerError::Accept(io::Error::other(e)))?,
            ),
            None => None,
        };
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        tracing::debug!(peer_addr = %addr, "Connection accepted");
        Ok((stream, addr, permit))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port_and_accepts() {
        let listener = Listener::bind("127.0.0.1:0", Some(1)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_stream, _peer, permit) = listener.accept().await.unwrap();
        assert!(permit.is_some());
        client.await.unwrap();
    }

    #[test]
    fn classifies_errors() {
        let e = ListenerError::Accept(io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(e.is_transient());
        let e = ListenerError::Accept(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!e.is_transient());
    }
}
