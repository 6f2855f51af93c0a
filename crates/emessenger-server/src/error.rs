//! Server error types.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the relay.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error on the listener or a connection.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Could not bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// WebSocket-level failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Packet could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] emessenger_protocol::ProtocolError),

    /// The WebSocket upgrade did not finish in time.
    #[error("WebSocket handshake with {peer} timed out")]
    HandshakeTimeout { peer: SocketAddr },

    /// Shutdown requested.
    #[error("Server shutdown requested")]
    Shutdown,
}

impl ServerError {
    /// Creates a bind error.
    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind { addr, source }
    }
}
