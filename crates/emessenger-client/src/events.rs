//! What the connection reports back to its owner.

use serde::Serialize;

use emessenger_protocol::{ClientId, Packet};

use crate::error::AssociationError;

/// Notifications emitted by the connection manager.
///
/// State changes without an event of their own (connecting, closing) are
/// visible through [`crate::ClientHandle::state_changes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The relay accepted our client ID; polling has started.
    Associated { client_id: ClientId },
    /// The handshake was refused or answered with garbage.
    AssociationFailed { error: AssociationError },
    /// The relay closed the connection with 1001 "going away".
    ServerShutdown,
    /// The connection closed for any other reason.
    ConnectionLost { reason: String },
    /// The transport could not be opened.
    ConnectFailed { reason: String },
    /// A mailbox entry was delivered.
    MessageReceived { peer_id: ClientId, text: String },
    /// The relay answered a poll with something other than a message or
    /// `BufferEmpty`.
    ProtocolViolation { packet: Packet },
}

/// How the relay answered a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored in the recipient's mailbox.
    Ack,
    /// The recipient's mailbox is full.
    BufferFull,
    /// The relay answered `UnknownError`.
    Rejected,
    /// Anything else.
    Unexpected(Packet),
}

impl PushOutcome {
    /// Classifies a push reply.
    pub fn from_reply(reply: Packet) -> Self {
        if reply.is_positive_ack() {
            Self::Ack
        } else if reply.is_buffer_full() {
            Self::BufferFull
        } else if reply.is_unknown_error() {
            Self::Rejected
        } else {
            Self::Unexpected(reply)
        }
    }
}

/// A delivered message as printed by `listen --json`.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveredMessage {
    pub from: ClientId,
    pub text: String,
    pub received_at: chrono::DateTime<chrono::Local>,
}

impl DeliveredMessage {
    pub fn now(from: ClientId, text: impl Into<String>) -> Self {
        Self {
            from,
            text: text.into(),
            received_at: chrono::Local::now(),
        }
    }
}
