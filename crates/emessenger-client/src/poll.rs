//! Mailbox draining.
//!
//! One drain cycle sends `Get` until the relay reports the mailbox empty,
//! forwarding every delivered message as it arrives. Each `Get` goes back
//! through the connection manager, which refuses it once the session that
//! started the cycle is gone.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use emessenger_protocol::{ClientId, DataType, Packet};

use crate::correlator::ResponseFuture;
use crate::error::{ClientError, ClientResult};
use crate::events::ClientEvent;

/// A request handed to the connection manager on behalf of a drain cycle.
#[derive(Debug)]
pub(crate) struct PollRequest {
    pub packet: Packet,
    pub generation: u64,
    pub reply: oneshot::Sender<ClientResult<ResponseFuture>>,
}

/// How a drain cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainEnd {
    /// The relay answered `BufferEmpty`.
    Empty,
    /// The session ended mid-cycle.
    Interrupted,
    /// The relay answered with something else; the cycle was abandoned.
    Violation,
    /// A reply did not decode; the cycle was abandoned.
    Malformed,
}

/// Result of one drain cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainSummary {
    pub delivered: usize,
    pub end: DrainEnd,
}

/// Everything a drain cycle needs, detached from the manager.
pub(crate) struct DrainCycle {
    pub client_id: ClientId,
    pub generation: u64,
    pub submit: mpsc::UnboundedSender<PollRequest>,
    pub events: mpsc::UnboundedSender<ClientEvent>,
}

impl DrainCycle {
    /// Runs the cycle to completion.
    pub(crate) async fn run(self) -> DrainSummary {
        let mut delivered = 0;
        let end = loop {
            let reply = match self.get().await {
                Ok(reply) => reply,
                Err(ClientError::Protocol(e)) => {
                    warn!(error = %e, "Undecodable poll reply");
                    break DrainEnd::Malformed;
                }
                Err(e) => {
                    trace!(error = %e, "Drain interrupted");
                    break DrainEnd::Interrupted;
                }
            };

            match reply {
                reply if reply.is_buffer_empty() => break DrainEnd::Empty,
                Packet::Data {
                    message: DataType::GetResponse,
                    peer_id,
                    payload,
                    ..
                } => {
                    delivered += 1;
                    let _ = self.events.send(ClientEvent::MessageReceived {
                        peer_id,
                        text: payload,
                    });
                }
                other => {
                    warn!(packet = %other, "Unexpected poll reply");
                    let _ = self
                        .events
                        .send(ClientEvent::ProtocolViolation { packet: other });
                    break DrainEnd::Violation;
                }
            }
        };

        if delivered > 0 || end != DrainEnd::Empty {
            debug!(delivered, end = ?end, "Drain cycle finished");
        }
        DrainSummary { delivered, end }
    }

    async fn get(&self) -> ClientResult<Packet> {
        let (reply, rx) = oneshot::channel();
        self.submit
            .send(PollRequest {
                packet: Packet::get(self.client_id),
                generation: self.generation,
                reply,
            })
            .map_err(|_| ClientError::ManagerStopped)?;
        let response = rx.await.map_err(|_| ClientError::ManagerStopped)??;
        response.await
    }
}
