//! Send command: push one message and exit.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use emessenger_protocol::{ClientId, check_payload};

use super::open_configured;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::events::PushOutcome;
use crate::transport::{Connector, WebSocketConnector};

/// Pushes `text` to `to` over a fresh session.
pub async fn run(config: &ClientConfig, to: ClientId, text: &str) -> ClientResult<()> {
    // Refuse oversized text before touching the network.
    check_payload(text)?;
    let connector = WebSocketConnector::new(Duration::from_millis(config.session.close_timeout_ms));
    let outcome = send_with(config, Arc::new(connector), to, text).await?;
    report(to, outcome)
}

/// Same as [`run`] over an explicit connector, returning the raw outcome.
pub async fn send_with(
    config: &ClientConfig,
    connector: Arc<dyn Connector>,
    to: ClientId,
    text: &str,
) -> ClientResult<PushOutcome> {
    // Polling would pop mailbox entries this command never prints.
    let session_config = config.session_config().without_polling();
    let session = open_configured(config, session_config, connector).await?;
    let outcome = session.handle.send_text(to, text).await;
    session
        .close(Duration::from_millis(config.session.close_timeout_ms))
        .await?;
    outcome
}

fn report(to: ClientId, outcome: PushOutcome) -> ClientResult<()> {
    match outcome {
        PushOutcome::Ack => {
            info!(to, "Message stored");
            println!("Message queued for #{:03}.", to);
            Ok(())
        }
        PushOutcome::BufferFull => Err(ClientError::PushRejected(format!(
            "mailbox of #{:03} is full",
            to
        ))),
        PushOutcome::Rejected => Err(ClientError::PushRejected(
            "relay rejected the message".into(),
        )),
        PushOutcome::Unexpected(packet) => Err(ClientError::PushRejected(format!(
            "unexpected reply: {}",
            packet
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emessenger_protocol::Packet;

    use crate::transport::Outbound;
    use crate::transport::mock::MockConnector;

    #[test]
    fn outcomes_map_to_errors() {
        assert!(report(2, PushOutcome::Ack).is_ok());
        assert_eq!(
            report(2, PushOutcome::BufferFull).unwrap_err().to_string(),
            "push not accepted: mailbox of #002 is full"
        );
        assert!(matches!(
            report(2, PushOutcome::Rejected),
            Err(ClientError::PushRejected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_associates_pushes_and_closes() {
        let (connector, mut relay) = MockConnector::new();
        let mut config = ClientConfig::default();
        config.server.client_id = 4;

        let send = tokio::spawn({
            let config = config.clone();
            async move { send_with(&config, Arc::new(connector), 9, "ping").await }
        });

        let mut peer = relay.next_peer().await;
        assert_eq!(peer.url.as_str(), "ws://localhost:12345/");
        assert_eq!(peer.recv_packet().await, Packet::associate(4));
        peer.reply(&Packet::association_success(4));
        assert_eq!(peer.recv_packet().await, Packet::push(4, 9, "ping"));
        peer.reply(&Packet::buffer_full(4));

        assert_eq!(peer.recv().await, Some(Outbound::Close));
        peer.close(1000, "");

        assert_eq!(send.await.unwrap().unwrap(), PushOutcome::BufferFull);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_ack_does_not_poll_the_mailbox() {
        let (connector, mut relay) = MockConnector::new();
        let config = ClientConfig::default();
        assert_eq!(config.session.poll_interval_ms, 1000);

        let send = tokio::spawn(async move {
            send_with(&config, Arc::new(connector), 5, "later").await
        });

        let mut peer = relay.next_peer().await;
        assert_eq!(peer.recv_packet().await, Packet::associate(1));
        peer.reply(&Packet::association_success(1));
        assert_eq!(peer.recv_packet().await, Packet::push(1, 5, "later"));

        // Hold the ack across several poll intervals.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        peer.reply(&Packet::positive_ack(1));

        // The next thing on the wire is the close, never a Get.
        assert_eq!(peer.recv().await, Some(Outbound::Close));
        peer.close(1000, "");

        assert_eq!(send.await.unwrap().unwrap(), PushOutcome::Ack);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_association_is_an_error() {
        let (connector, mut relay) = MockConnector::new();
        let config = ClientConfig::default();

        let send = tokio::spawn(async move {
            send_with(&config, Arc::new(connector), 2, "x").await
        });

        let mut peer = relay.next_peer().await;
        assert_eq!(peer.recv_packet().await, Packet::associate(1));
        peer.reply(&Packet::unknown_error(1));

        assert!(matches!(
            send.await.unwrap(),
            Err(ClientError::Association(
                crate::error::AssociationError::ServerError(1)
            ))
        ));
    }
}
