//! Client error types.

use thiserror::Error;

use emessenger_core::SettingsError;
use emessenger_protocol::{Packet, ProtocolError};

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid connection settings.
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),

    /// The transport could not be opened or refused a frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// A reply could not be decoded, or a request could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The connection went away while the request was pending.
    #[error("connection reset")]
    ConnectionReset,

    /// The request needs an associated session.
    #[error("not associated with the relay")]
    NotAssociated,

    /// The associate handshake did not produce a session.
    #[error("association failed: {0}")]
    Association(#[from] AssociationError),

    /// The relay did not store a push.
    #[error("push not accepted: {0}")]
    PushRejected(String),

    /// The caller stopped waiting for a reply.
    #[error("timed out waiting for a reply")]
    Timeout,

    /// The relay server failed to start or stopped with an error.
    #[error("relay error: {0}")]
    Relay(String),

    /// The connection manager task is gone.
    #[error("connection manager stopped")]
    ManagerStopped,

    /// IO error (stdin, config file).
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Why the associate handshake did not produce a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssociationError {
    /// The relay answered `AssociationFailed`.
    #[error("relay refused association for client #{0:03}")]
    Rejected(u8),

    /// The relay answered `UnknownError`, usually because the ID is taken.
    #[error("relay reported an error for client #{0:03} (ID already in use?)")]
    ServerError(u8),

    /// The relay answered with something that is not a handshake reply.
    #[error("unexpected handshake reply: {0}")]
    UnexpectedResponse(Packet),

    /// The reply did not decode.
    #[error("malformed handshake reply: {0}")]
    Malformed(ProtocolError),
}

impl AssociationError {
    /// Classifies a handshake reply. Returns `None` for `AssociationSuccess`.
    pub fn from_reply(reply: &Packet) -> Option<Self> {
        if reply.is_association_success() {
            None
        } else if reply.is_association_failed() {
            Some(Self::Rejected(reply.client_id()))
        } else if reply.is_unknown_error() {
            Some(Self::ServerError(reply.client_id()))
        } else {
            Some(Self::UnexpectedResponse(reply.clone()))
        }
    }
}
