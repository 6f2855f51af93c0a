//! Chat command: stdin lines go to one peer, deliveries are printed.

use std::io::Write;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use emessenger_protocol::ClientId;

use super::{Session, open_session, render_message};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, PushOutcome};

/// Chats with `to` until stdin closes or the connection ends.
pub async fn run(config: &ClientConfig, to: ClientId) -> ClientResult<()> {
    let session = open_session(config).await?;
    eprintln!(
        "Connected as #{:03}, chatting with #{:03}. Ctrl-D to quit.",
        config.server.client_id, to
    );
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    chat_with(
        session,
        to,
        stdin,
        &mut stdout,
        Duration::from_millis(config.session.close_timeout_ms),
    )
    .await
}

/// The chat loop over an associated session and explicit input and output.
pub async fn chat_with<R, W>(
    mut session: Session,
    to: ClientId,
    input: R,
    out: &mut W,
    close_timeout: Duration,
) -> ClientResult<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();

    let result = loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Input closed");
                    break Ok(());
                };
                let text = line.trim_end();
                if text.is_empty() {
                    continue;
                }
                match session.handle.send_text(to, text).await {
                    Ok(PushOutcome::Ack) => {}
                    Ok(PushOutcome::BufferFull) => {
                        writeln!(out, "! mailbox of #{:03} is full, message dropped", to)?;
                    }
                    Ok(PushOutcome::Rejected) => writeln!(out, "! relay rejected the message")?,
                    Ok(PushOutcome::Unexpected(packet)) => {
                        writeln!(out, "! unexpected reply: {}", packet)?;
                    }
                    Err(ClientError::Protocol(e)) => writeln!(out, "! {}", e)?,
                    Err(e) => break Err(e),
                }
                out.flush()?;
            }
            event = session.events.recv() => match event {
                Some(ClientEvent::MessageReceived { peer_id, text }) => {
                    writeln!(out, "{}", render_message(peer_id, &text))?;
                    out.flush()?;
                }
                Some(ClientEvent::ServerShutdown) => {
                    writeln!(out, "! relay shut down")?;
                    break Ok(());
                }
                Some(ClientEvent::ConnectionLost { reason }) => {
                    break Err(ClientError::Transport(reason));
                }
                Some(ClientEvent::ProtocolViolation { packet }) => {
                    warn!(packet = %packet, "Relay answered a poll unexpectedly");
                }
                Some(other) => debug!(event = ?other, "Ignoring event"),
                None => break Err(ClientError::ManagerStopped),
            },
        }
    };

    session.close(close_timeout).await?;
    result
}
