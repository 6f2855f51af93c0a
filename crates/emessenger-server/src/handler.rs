//! Per-connection packet dispatch.
//!
//! Every inbound frame gets exactly one reply, in arrival order. Clients
//! rely on that ordering to pair replies with requests.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, info, warn};

use emessenger_protocol::{
    ClientId, ControlType, DATA_HEADER_LEN, DataType, ManagementType, Packet, check_payload,
};

use crate::config::RelayLimits;
use crate::error::{ServerError, ServerResult};
use crate::relay::{AssociateResult, ConnectionId, PushResult, SharedRelay};
use crate::signals::ShutdownHandle;
use crate::socket::{Connection, Frame};

/// Answers the frames of one connection.
pub struct RequestHandler {
    relay: SharedRelay,
    limits: RelayLimits,
    connection: ConnectionId,
}

enum Step {
    Read(ServerResult<Option<Frame>>),
    Shutdown,
}

impl RequestHandler {
    /// Registers a new connection with the relay.
    pub async fn new(relay: SharedRelay, limits: RelayLimits) -> Self {
        let connection = relay.write().await.register_connection();
        Self {
            relay,
            limits,
            connection,
        }
    }

    /// Connection ID assigned by the relay.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Produces the reply for one raw frame.
    pub async fn handle_frame(&self, frame: &[u8]) -> Packet {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(connection = self.connection, error = %e, "Malformed frame");
                return Packet::unknown_error(client_byte(frame));
            }
        };

        debug!(connection = self.connection, packet = %packet, "Handling packet");

        match packet {
            Packet::Management {
                message: ManagementType::Associate,
                client_id,
            } => self.associate(client_id).await,
            Packet::Control {
                message: ControlType::Get,
                client_id,
            } => self.get(client_id).await,
            Packet::Data {
                message: DataType::Push,
                client_id,
                peer_id,
                payload,
            } => self.push(client_id, peer_id, payload, frame).await,
            other => {
                debug!(
                    connection = self.connection,
                    subtype = other.subtype(),
                    "Subtype is not a request"
                );
                Packet::unknown_error(other.client_id())
            }
        }
    }

    /// Produces the reply for a text message, which never carries a packet.
    pub fn reject_text(&self, text: &str) -> Packet {
        debug!(connection = self.connection, len = text.len(), "Text message refused");
        Packet::unknown_error(client_byte(text.as_bytes()))
    }

    async fn associate(&self, client: ClientId) -> Packet {
        let mut relay = self.relay.write().await;
        match relay.associate(client, self.connection) {
            AssociateResult::Bound => {
                debug!(
                    client,
                    connection = self.connection,
                    sessions = relay.session_count(),
                    "Session bound"
                );
                Packet::association_success(client)
            }
            AssociateResult::InUse => {
                info!(client, connection = self.connection, "Client ID already in use");
                Packet::unknown_error(client)
            }
        }
    }

    async fn get(&self, client: ClientId) -> Packet {
        let mut relay = self.relay.write().await;
        if !relay.is_associated(client, self.connection) {
            return Packet::association_failed(client);
        }
        match relay.pop(client) {
            Some(stored) => Packet::get_response(client, stored.sender, stored.payload),
            None => Packet::buffer_empty(client),
        }
    }

    async fn push(
        &self,
        client: ClientId,
        recipient: ClientId,
        payload: String,
        frame: &[u8],
    ) -> Packet {
        let mut relay = self.relay.write().await;
        if !relay.is_associated(client, self.connection) {
            return Packet::association_failed(client);
        }

        // The declared length must describe the whole remainder of the frame.
        let declared = usize::from(frame[DATA_HEADER_LEN - 1]);
        let actual = frame.len() - DATA_HEADER_LEN;
        if declared >= self.limits.max_payload_len || declared != actual {
            debug!(client, declared, actual, "Push length rejected");
            return Packet::unknown_error(client);
        }
        // Lossy decoding can grow the text past what a reply can carry.
        if check_payload(&payload).is_err() {
            return Packet::unknown_error(client);
        }

        match relay.push(client, recipient, payload) {
            PushResult::Stored => Packet::positive_ack(client),
            PushResult::MailboxFull => Packet::buffer_full(client),
        }
    }

    /// Serves a connection until the peer leaves or shutdown is signalled.
    ///
    /// The connection's session is released on every exit path.
    pub async fn handle_connection(
        &self,
        mut conn: Connection,
        shutdown: ShutdownHandle,
    ) -> ServerResult<()> {
        let result = self.serve(&mut conn, shutdown).await;
        if let Some(client) = self.relay.write().await.release(self.connection) {
            debug!(client, peer = %conn.peer(), "Session ended");
        }
        result
    }

    async fn serve(&self, conn: &mut Connection, shutdown: ShutdownHandle) -> ServerResult<()> {
        let stop = shutdown.wait().wait();
        tokio::pin!(stop);

        loop {
            let step = tokio::select! {
                frame = conn.read_frame() => Step::Read(frame),
                _ = &mut stop => Step::Shutdown,
            };

            match step {
                Step::Read(Ok(Some(Frame::Binary(frame)))) => {
                    let reply = self.handle_frame(&frame).await;
                    conn.write_packet(&reply).await?;
                }
                Step::Read(Ok(Some(Frame::Text(text)))) => {
                    conn.write_packet(&self.reject_text(&text)).await?;
                }
                Step::Read(Ok(None)) => {
                    debug!(peer = %conn.peer(), "Client disconnected");
                    return Ok(());
                }
                Step::Read(Err(e)) => {
                    warn!(peer = %conn.peer(), error = %e, "Error reading frame");
                    return Err(e);
                }
                Step::Shutdown => {
                    conn.close_going_away().await?;
                    return Err(ServerError::Shutdown);
                }
            }
        }
    }
}

/// Client ID position shared by every packet kind, or 0 if the frame is too short.
fn client_byte(frame: &[u8]) -> ClientId {
    frame.get(2).copied().unwrap_or(0)
}

/// Creates a connection handler function for use with `SocketServer::run`.
pub fn make_connection_handler(
    relay: SharedRelay,
    limits: RelayLimits,
    shutdown: ShutdownHandle,
) -> impl Fn(Connection) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static {
    move |conn| {
        let relay = relay.clone();
        let shutdown = shutdown.clone();
        Box::pin(async move {
            let handler = RequestHandler::new(relay, limits).await;
            if let Err(e) = handler.handle_connection(conn, shutdown).await
                && !matches!(e, ServerError::Shutdown)
            {
                warn!(error = %e, "Connection handler error");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::new_shared_relay;

    async fn handler(relay: &SharedRelay) -> RequestHandler {
        RequestHandler::new(relay.clone(), RelayLimits::default()).await
    }

    async fn reply(handler: &RequestHandler, packet: Packet) -> Packet {
        handler.handle_frame(&packet.encode().unwrap()).await
    }

    #[tokio::test]
    async fn associate_then_duplicate() {
        let relay = new_shared_relay(100);
        let first = handler(&relay).await;
        let second = handler(&relay).await;

        assert_eq!(
            reply(&first, Packet::associate(7)).await,
            Packet::association_success(7)
        );
        assert_eq!(
            reply(&second, Packet::associate(7)).await,
            Packet::unknown_error(7)
        );
    }

    #[tokio::test]
    async fn get_requires_association() {
        let relay = new_shared_relay(100);
        let h = handler(&relay).await;

        assert_eq!(
            reply(&h, Packet::get(1)).await,
            Packet::association_failed(1)
        );

        reply(&h, Packet::associate(1)).await;
        assert_eq!(reply(&h, Packet::get(1)).await, Packet::buffer_empty(1));

        // Another connection cannot poll someone else's mailbox.
        let other = handler(&relay).await;
        assert_eq!(
            reply(&other, Packet::get(1)).await,
            Packet::association_failed(1)
        );
    }

    #[tokio::test]
    async fn push_then_get_delivers_in_order() {
        let relay = new_shared_relay(100);
        let alice = handler(&relay).await;
        let bob = handler(&relay).await;
        reply(&alice, Packet::associate(1)).await;
        reply(&bob, Packet::associate(2)).await;

        assert_eq!(
            reply(&alice, Packet::push(1, 2, "hello")).await,
            Packet::positive_ack(1)
        );
        assert_eq!(
            reply(&alice, Packet::push(1, 2, "again")).await,
            Packet::positive_ack(1)
        );

        assert_eq!(
            reply(&bob, Packet::get(2)).await,
            Packet::get_response(2, 1, "hello")
        );
        assert_eq!(
            reply(&bob, Packet::get(2)).await,
            Packet::get_response(2, 1, "again")
        );
        assert_eq!(reply(&bob, Packet::get(2)).await, Packet::buffer_empty(2));
    }

    #[tokio::test]
    async fn push_without_association_fails() {
        let relay = new_shared_relay(100);
        let h = handler(&relay).await;
        assert_eq!(
            reply(&h, Packet::push(1, 2, "hi")).await,
            Packet::association_failed(1)
        );
    }

    #[tokio::test]
    async fn push_to_full_mailbox() {
        let relay = new_shared_relay(1);
        let h = handler(&relay).await;
        reply(&h, Packet::associate(1)).await;

        assert_eq!(
            reply(&h, Packet::push(1, 2, "a")).await,
            Packet::positive_ack(1)
        );
        assert_eq!(
            reply(&h, Packet::push(1, 2, "b")).await,
            Packet::buffer_full(1)
        );
    }

    #[tokio::test]
    async fn push_length_mismatch_is_rejected() {
        let relay = new_shared_relay(100);
        let h = handler(&relay).await;
        reply(&h, Packet::associate(1)).await;

        // Declares 2 bytes, carries 3.
        let frame = [2, 1, 1, 2, 2, b'a', b'b', b'c'];
        assert_eq!(h.handle_frame(&frame).await, Packet::unknown_error(1));
        assert_eq!(relay.read().await.mailbox_len(2), 0);
    }

    #[tokio::test]
    async fn push_at_payload_limit_is_rejected() {
        let relay = new_shared_relay(100);
        let h = handler(&relay).await;
        reply(&h, Packet::associate(1)).await;

        let at_limit = "x".repeat(255);
        assert_eq!(
            reply(&h, Packet::push(1, 2, at_limit)).await,
            Packet::unknown_error(1)
        );

        let below = "x".repeat(254);
        assert_eq!(
            reply(&h, Packet::push(1, 2, below)).await,
            Packet::positive_ack(1)
        );
    }

    #[tokio::test]
    async fn invalid_utf8_is_stored_as_replacement_text() {
        let relay = new_shared_relay(100);
        let h = handler(&relay).await;
        reply(&h, Packet::associate(1)).await;

        let frame = [2, 1, 1, 2, 2, b'h', 0xff];
        assert_eq!(h.handle_frame(&frame).await, Packet::positive_ack(1));

        // The relay keeps the decoded text, not the raw bytes.
        let bob = handler(&relay).await;
        reply(&bob, Packet::associate(2)).await;
        assert_eq!(
            reply(&bob, Packet::get(2)).await,
            Packet::get_response(2, 1, "h\u{FFFD}")
        );
    }

    #[tokio::test]
    async fn malformed_frames_get_unknown_error() {
        let relay = new_shared_relay(100);
        let h = handler(&relay).await;

        assert_eq!(h.handle_frame(&[]).await, Packet::unknown_error(0));
        assert_eq!(h.handle_frame(&[9, 0, 4]).await, Packet::unknown_error(4));
        assert_eq!(h.handle_frame(&[0, 0]).await, Packet::unknown_error(0));
        assert_eq!(h.handle_frame(&[1, 9, 5]).await, Packet::unknown_error(5));
    }

    #[tokio::test]
    async fn text_never_binds_a_session() {
        let relay = new_shared_relay(100);
        let h = handler(&relay).await;

        assert_eq!(h.reject_text("\u{0}\u{0}\u{7}"), Packet::unknown_error(7));
        assert_eq!(h.reject_text("hi"), Packet::unknown_error(0));
        assert_eq!(
            reply(&h, Packet::associate(7)).await,
            Packet::association_success(7)
        );
    }

    #[tokio::test]
    async fn reply_subtypes_from_client_are_refused() {
        let relay = new_shared_relay(100);
        let h = handler(&relay).await;
        reply(&h, Packet::associate(3)).await;

        for packet in [
            Packet::association_success(3),
            Packet::buffer_empty(3),
            Packet::positive_ack(3),
            Packet::get_response(3, 4, "nope"),
        ] {
            assert_eq!(reply(&h, packet).await, Packet::unknown_error(3));
        }
    }

    #[tokio::test]
    async fn release_on_exit_frees_the_id() {
        let relay = new_shared_relay(100);
        let h = handler(&relay).await;
        reply(&h, Packet::associate(9)).await;
        reply(&h, Packet::push(9, 9, "note to self")).await;

        assert_eq!(relay.write().await.release(h.connection()), Some(9));

        let next = handler(&relay).await;
        assert_eq!(
            reply(&next, Packet::associate(9)).await,
            Packet::association_success(9)
        );
        assert_eq!(
            reply(&next, Packet::get(9)).await,
            Packet::get_response(9, 9, "note to self")
        );
    }
}
