//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to configured address(es)
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Graceful handling of accept errors
//!
//! # Design Decisions
//! - A `BoundListener` is moved, never shared: exactly one server instance
//!   owns a socket at any time, and transfer keeps the socket open
//! - The connection semaphore travels with the socket, so connections still
//!   held by a draining instance count against the cap of its successor

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::store::ListenerKey;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Address could not be parsed or the network is unsupported.
    #[error("invalid address {address}: {reason}")]
    Address { address: String, reason: String },

    /// Failed to bind to address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to accept connection.
    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),
}

/// A bound TCP socket and the connection limit attached to it.
#[derive(Debug)]
pub struct BoundListener {
    key: ListenerKey,
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
}

impl BoundListener {
    /// Bind the socket described by `key`.
    pub async fn bind(key: ListenerKey, max_connections: usize) -> Result<Self, ListenerError> {
        if key.address.network != "tcp" {
            return Err(ListenerError::Address {
                address: key.address.address.clone(),
                reason: format!("unsupported network '{}'", key.address.network),
            });
        }
        let addr: SocketAddr = key.address.address.parse().map_err(|e: std::net::AddrParseError| {
            ListenerError::Address {
                address: key.address.address.clone(),
                reason: e.to_string(),
            }
        })?;

        let listener = TcpListener::bind(addr).await.map_err(|source| ListenerError::Bind {
            address: key.address.address.clone(),
            source,
        })?;

        tracing::info!(
            listener = %key,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            key,
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
        })
    }

    pub fn key(&self) -> &ListenerKey {
        &self.key
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| {
                ListenerError::Accept(std::io::Error::other("connection limit closed"))
            })?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            listener = %self.key,
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
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
