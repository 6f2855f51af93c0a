//! In-memory transport for tests.
//!
//! Every successful `connect` hands the far end of the link to the test as a
//! [`MockPeer`], which plays the relay.

use std::time::Duration;

use tokio::sync::mpsc;
use url::Url;

use emessenger_protocol::Packet;

use super::{BoxFuture, Connector, Outbound, TransportEvent, TransportHandle, TransportLink};
use crate::error::{ClientError, ClientResult};

pub(crate) struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    refuse: bool,
    delay: Duration,
}

/// Receives the peers opened through a [`MockConnector`].
pub(crate) struct MockRelay {
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockConnector {
    pub(crate) fn new() -> (Self, MockRelay) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refuse: false,
                delay: Duration::ZERO,
            },
            MockRelay { peers: rx },
        )
    }

    /// Every connect attempt fails.
    pub(crate) fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Connect attempts take `delay` to complete.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'_, ClientResult<TransportLink>> {
        let url = url.clone();
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.refuse {
                return Err(ClientError::Transport(format!("{} refused", url)));
            }

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let _ = self.peers.send(MockPeer {
                url,
                outbound: outbound_rx,
                events: events_tx,
            });

            Ok(TransportLink {
                handle: TransportHandle::new(outbound_tx),
                events: events_rx,
            })
        })
    }
}

impl MockRelay {
    pub(crate) async fn next_peer(&mut self) -> MockPeer {
        self.peers.recv().await.expect("connector dropped")
    }

    /// A peer opened since the last call, if any.
    pub(crate) fn try_next_peer(&mut self) -> Option<MockPeer> {
        self.peers.try_recv().ok()
    }
}

/// The relay's end of one mock link.
pub(crate) struct MockPeer {
    pub(crate) url: Url,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockPeer {
    /// Next thing the client sent, `None` once the client dropped the link.
    pub(crate) async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Next frame the client sent, decoded.
    pub(crate) async fn recv_packet(&mut self) -> Packet {
        match self.recv().await {
            Some(Outbound::Frame(data)) => Packet::decode(&data).expect("client sent garbage"),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    pub(crate) fn reply(&self, packet: &Packet) {
        self.reply_raw(packet.encode().expect("test packet encodes"));
    }

    pub(crate) fn reply_raw(&self, data: Vec<u8>) {
        let _ = self.events.send(TransportEvent::Frame(data));
    }

    /// Simulates the relay closing with `code`.
    pub(crate) fn close(&self, code: u16, reason: &str) {
        let _ = self.events.send(TransportEvent::Closed {
            code: Some(code),
            reason: reason.to_string(),
        });
    }

    pub(crate) fn fail(&self, message: &str) {
        let _ = self.events.send(TransportEvent::Error(message.to_string()));
    }
}
