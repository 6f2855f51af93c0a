//! Protocol error types.

use thiserror::Error;

use crate::packet::PacketKind;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Zero-length frame.
    #[error("empty frame")]
    EmptyFrame,

    /// Kind byte outside the known range.
    #[error("unknown packet kind: {0}")]
    UnknownKind(u8),

    /// Subtype byte outside the range for its kind.
    #[error("unknown {kind} subtype: {subtype}")]
    UnknownSubtype { kind: PacketKind, subtype: u8 },

    /// Frame shorter than its kind (or declared payload) requires.
    #[error("truncated {kind} frame: expected {expected} bytes, got {received}")]
    Truncated {
        kind: PacketKind,
        expected: usize,
        received: usize,
    },

    /// Payload does not fit the one-byte length field.
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },
}
