//! Session registry and per-client mailboxes.
//!
//! A client ID can be bound to at most one live connection. Mailboxes are
//! keyed by recipient and outlive the sessions that fill or drain them, so a
//! client that reconnects picks up whatever arrived while it was away.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use emessenger_protocol::ClientId;

/// Identifies one accepted connection for the lifetime of the process.
pub type ConnectionId = u64;

/// A payload waiting in a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Who pushed it.
    pub sender: ClientId,
    /// The text.
    pub payload: String,
}

/// Outcome of storing a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Stored,
    MailboxFull,
}

/// Outcome of an associate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociateResult {
    /// The ID is now bound to the requesting connection.
    Bound,
    /// Another connection (or this one) already holds the ID.
    InUse,
}

/// Relay state shared by every connection.
#[derive(Debug)]
pub struct RelayState {
    mailbox_capacity: usize,
    next_connection: ConnectionId,
    sessions: HashMap<ClientId, ConnectionId>,
    mailboxes: HashMap<ClientId, VecDeque<StoredMessage>>,
}

impl RelayState {
    /// Creates empty state whose mailboxes hold `mailbox_capacity` entries.
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            mailbox_capacity,
            next_connection: 1,
            sessions: HashMap::new(),
            mailboxes: HashMap::new(),
        }
    }

    /// Hands out an ID for a freshly accepted connection.
    pub fn register_connection(&mut self) -> ConnectionId {
        let id = self.next_connection;
        self.next_connection += 1;
        id
    }

    /// Binds `client` to `connection`.
    ///
    /// A connection that was bound to a different ID gives that one up.
    pub fn associate(&mut self, client: ClientId, connection: ConnectionId) -> AssociateResult {
        if self.sessions.contains_key(&client) {
            return AssociateResult::InUse;
        }
        self.sessions.retain(|_, owner| *owner != connection);
        self.sessions.insert(client, connection);
        info!(client, connection, "Client associated");
        AssociateResult::Bound
    }

    /// Returns true if `client` is bound to `connection`.
    pub fn is_associated(&self, client: ClientId, connection: ConnectionId) -> bool {
        self.sessions.get(&client) == Some(&connection)
    }

    /// Drops whatever session `connection` held. Mailboxes are kept.
    pub fn release(&mut self, connection: ConnectionId) -> Option<ClientId> {
        let client = self
            .sessions
            .iter()
            .find_map(|(client, owner)| (*owner == connection).then_some(*client))?;
        self.sessions.remove(&client);
        info!(client, connection, "Client session released");
        Some(client)
    }

    /// Appends a message to `recipient`'s mailbox.
    pub fn push(
        &mut self,
        sender: ClientId,
        recipient: ClientId,
        payload: impl Into<String>,
    ) -> PushResult {
        let mailbox = self.mailboxes.entry(recipient).or_default();
        if mailbox.len() >= self.mailbox_capacity {
            debug!(sender, recipient, "Mailbox full");
            return PushResult::MailboxFull;
        }
        mailbox.push_back(StoredMessage {
            sender,
            payload: payload.into(),
        });
        debug!(sender, recipient, queued = mailbox.len(), "Message stored");
        PushResult::Stored
    }

    /// Removes the oldest message for `client`.
    pub fn pop(&mut self, client: ClientId) -> Option<StoredMessage> {
        self.mailboxes.get_mut(&client)?.pop_front()
    }

    /// Number of messages waiting for `client`.
    pub fn mailbox_len(&self, client: ClientId) -> usize {
        self.mailboxes.get(&client).map_or(0, VecDeque::len)
    }

    /// Number of bound client IDs.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Relay state wrapped in an `Arc<RwLock>`.
pub type SharedRelay = Arc<RwLock<RelayState>>;

/// Creates new shared relay state.
pub fn new_shared_relay(mailbox_capacity: usize) -> SharedRelay {
    Arc::new(RwLock::new(RelayState::new(mailbox_capacity)))
}
