//! Pairs replies with requests by position.
//!
//! The wire carries no request IDs. The relay answers every frame exactly
//! once and in order, so the Nth inbound frame belongs to the Nth request
//! still waiting. A relay that answers out of order will mis-pair replies;
//! nothing here can detect that.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use emessenger_protocol::{Packet, ProtocolError};

use crate::error::{ClientError, ClientResult};
use crate::transport::TransportHandle;

type Pending = oneshot::Sender<ClientResult<Packet>>;

/// What happened to an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The oldest request got its reply.
    Resolved,
    /// The frame did not decode; the oldest request failed with the error.
    Failed(ProtocolError),
    /// Nothing was waiting; the frame was dropped.
    Stray,
}

/// Ordered queue of requests waiting for a reply.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: VecDeque<Pending>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `packet`, hands it to `transport` and queues a waiter.
    ///
    /// If encoding fails or the transport is gone, nothing is sent and
    /// nothing is queued.
    pub fn submit(
        &mut self,
        packet: &Packet,
        transport: &TransportHandle,
    ) -> ClientResult<ResponseFuture> {
        let frame = packet.encode()?;
        transport.send_frame(frame)?;

        let (tx, rx) = oneshot::channel();
        self.pending.push_back(tx);
        trace!(packet = %packet, pending = self.pending.len(), "Request submitted");
        Ok(ResponseFuture::new(rx))
    }

    /// Routes one inbound frame to the oldest waiter.
    ///
    /// A waiter whose caller gave up still consumes its reply, so later
    /// replies stay paired correctly.
    pub fn on_frame(&mut self, frame: &[u8]) -> FrameOutcome {
        let Some(head) = self.pending.pop_front() else {
            debug!(len = frame.len(), "Dropping frame with no pending request");
            return FrameOutcome::Stray;
        };

        match Packet::decode(frame) {
            Ok(packet) => {
                trace!(packet = %packet, "Reply matched");
                let _ = head.send(Ok(packet));
                FrameOutcome::Resolved
            }
            Err(e) => {
                debug!(error = %e, "Reply did not decode");
                let _ = head.send(Err(ClientError::Protocol(e.clone())));
                FrameOutcome::Failed(e)
            }
        }
    }

    /// Fails every waiter with [`ClientError::ConnectionReset`].
    ///
    /// Returns how many were failed.
    pub fn reset_all(&mut self) -> usize {
        let count = self.pending.len();
        for waiter in self.pending.drain(..) {
            let _ = waiter.send(Err(ClientError::ConnectionReset));
        }
        if count > 0 {
            debug!(count, "Pending requests reset");
        }
        count
    }

    /// Number of requests waiting.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Resolves to the reply paired with one request.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<ClientResult<Packet>>,
}

impl ResponseFuture {
    pub(crate) fn new(rx: oneshot::Receiver<ClientResult<Packet>>) -> Self {
        Self { rx }
    }
}

impl Future for ResponseFuture {
    type Output = ClientResult<Packet>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ClientError::ConnectionReset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Outbound;
    use tokio::sync::mpsc;

    fn transport() -> (TransportHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportHandle::new(tx), rx)
    }

    fn bytes(packet: &Packet) -> Vec<u8> {
        packet.encode().unwrap()
    }

    #[tokio::test]
    async fn replies_resolve_in_send_order() {
        let (handle, mut sent) = transport();
        let mut correlator = RequestCorrelator::new();

        let r1 = correlator.submit(&Packet::get(1), &handle).unwrap();
        let r2 = correlator.submit(&Packet::push(1, 2, "x"), &handle).unwrap();
        let r3 = correlator.submit(&Packet::get(1), &handle).unwrap();
        assert_eq!(correlator.pending(), 3);

        assert_eq!(
            sent.recv().await,
            Some(Outbound::Frame(bytes(&Packet::get(1))))
        );

        assert_eq!(
            correlator.on_frame(&bytes(&Packet::buffer_empty(1))),
            FrameOutcome::Resolved
        );
        assert_eq!(
            correlator.on_frame(&bytes(&Packet::positive_ack(1))),
            FrameOutcome::Resolved
        );
        assert_eq!(
            correlator.on_frame(&bytes(&Packet::get_response(1, 2, "y"))),
            FrameOutcome::Resolved
        );

        assert_eq!(r1.await.unwrap(), Packet::buffer_empty(1));
        assert_eq!(r2.await.unwrap(), Packet::positive_ack(1));
        assert_eq!(r3.await.unwrap(), Packet::get_response(1, 2, "y"));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn decode_failure_fails_only_the_head() {
        let (handle, _sent) = transport();
        let mut correlator = RequestCorrelator::new();

        let r1 = correlator.submit(&Packet::get(1), &handle).unwrap();
        let r2 = correlator.submit(&Packet::get(1), &handle).unwrap();

        assert_eq!(
            correlator.on_frame(&[7, 0, 1]),
            FrameOutcome::Failed(ProtocolError::UnknownKind(7))
        );
        correlator.on_frame(&bytes(&Packet::buffer_empty(1)));

        assert!(matches!(
            r1.await,
            Err(ClientError::Protocol(ProtocolError::UnknownKind(7)))
        ));
        assert_eq!(r2.await.unwrap(), Packet::buffer_empty(1));
    }

    #[test]
    fn stray_frame_is_dropped() {
        let mut correlator = RequestCorrelator::new();
        assert_eq!(
            correlator.on_frame(&bytes(&Packet::buffer_empty(1))),
            FrameOutcome::Stray
        );
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn reset_fails_everything_once() {
        let (handle, _sent) = transport();
        let mut correlator = RequestCorrelator::new();

        let r1 = correlator.submit(&Packet::get(1), &handle).unwrap();
        let r2 = correlator.submit(&Packet::push(1, 2, "a"), &handle).unwrap();

        assert_eq!(correlator.reset_all(), 2);
        assert_eq!(correlator.reset_all(), 0);

        assert!(matches!(r1.await, Err(ClientError::ConnectionReset)));
        assert!(matches!(r2.await, Err(ClientError::ConnectionReset)));
    }

    #[test]
    fn oversized_payload_is_not_queued() {
        let (handle, mut sent) = transport();
        let mut correlator = RequestCorrelator::new();

        let result = correlator.submit(&Packet::push(1, 2, "x".repeat(256)), &handle);
        assert!(matches!(
            result,
            Err(ClientError::Protocol(ProtocolError::PayloadTooLarge { size: 256, .. }))
        ));
        assert_eq!(correlator.pending(), 0);
        assert!(sent.try_recv().is_err());
    }

    #[test]
    fn closed_transport_is_not_queued() {
        let (handle, sent) = transport();
        drop(sent);
        let mut correlator = RequestCorrelator::new();

        assert!(matches!(
            correlator.submit(&Packet::get(1), &handle),
            Err(ClientError::Transport(_))
        ));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_still_consumes_its_reply() {
        let (handle, _sent) = transport();
        let mut correlator = RequestCorrelator::new();

        let abandoned = correlator.submit(&Packet::get(1), &handle).unwrap();
        let kept = correlator.submit(&Packet::push(1, 2, "b"), &handle).unwrap();
        drop(abandoned);

        assert_eq!(
            correlator.on_frame(&bytes(&Packet::buffer_empty(1))),
            FrameOutcome::Resolved
        );
        correlator.on_frame(&bytes(&Packet::positive_ack(1)));
        assert_eq!(kept.await.unwrap(), Packet::positive_ack(1));
    }

    #[tokio::test]
    async fn dropped_correlator_reads_as_reset() {
        let (handle, _sent) = transport();
        let mut correlator = RequestCorrelator::new();
        let response = correlator.submit(&Packet::get(1), &handle).unwrap();
        drop(correlator);

        assert!(matches!(response.await, Err(ClientError::ConnectionReset)));
    }
}
