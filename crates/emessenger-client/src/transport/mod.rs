//! Transport abstraction.
//!
//! The connection manager never touches sockets. A [`Connector`] opens a
//! [`TransportLink`]: a handle for outbound frames plus a stream of inbound
//! events. Frame boundaries are preserved in both directions.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use url::Url;

use crate::error::{ClientError, ClientResult};

#[cfg(test)]
pub(crate) mod mock;
mod websocket;

pub use websocket::WebSocketConnector;

/// Close code a relay uses when it is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// A boxed future, so [`Connector`] stays object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Something sent towards the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One binary message.
    Frame(Vec<u8>),
    /// Ask the transport to close.
    Close,
}

/// Something that happened on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One binary message arrived.
    Frame(Vec<u8>),
    /// The transport closed. `code` is the peer's close code, if it sent one.
    Closed { code: Option<u16>, reason: String },
    /// The transport failed. No further events follow.
    Error(String),
}

impl TransportEvent {
    /// True when this is the relay's "going away" close.
    pub fn is_going_away(&self) -> bool {
        matches!(self, Self::Closed { code: Some(CLOSE_GOING_AWAY), .. })
    }
}

/// Sending side of an open transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl TransportHandle {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { outbound }
    }

    /// Queues one frame.
    ///
    /// Fails only when the transport has already gone away.
    pub fn send_frame(&self, frame: Vec<u8>) -> ClientResult<()> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ClientError::Transport("transport is closed".into()))
    }

    /// Asks the transport to close. A `Closed` event follows.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// An open transport.
#[derive(Debug)]
pub struct TransportLink {
    pub handle: TransportHandle,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports.
pub trait Connector: Send + Sync + 'static {
    /// Opens a transport to `url`.
    fn connect(&self, url: &Url) -> BoxFuture<'_, ClientResult<TransportLink>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn going_away_detection() {
        assert!(
            TransportEvent::Closed {
                code: Some(1001),
                reason: "going away".into()
            }
            .is_going_away()
        );
        assert!(
            !TransportEvent::Closed {
                code: Some(1000),
                reason: String::new()
            }
            .is_going_away()
        );
        assert!(
            !TransportEvent::Closed {
                code: None,
                reason: String::new()
            }
            .is_going_away()
        );
        assert!(!TransportEvent::Error("reset".into()).is_going_away());
    }

    #[test]
    fn send_after_close_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = TransportHandle::new(tx);
        drop(rx);

        assert!(matches!(
            handle.send_frame(vec![1, 0, 1]),
            Err(ClientError::Transport(_))
        ));
        handle.close();
    }
}
