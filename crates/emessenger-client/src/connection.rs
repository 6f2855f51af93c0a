//! Connection lifecycle.
//!
//! A single task owns the transport, the request queue, the poll timer and
//! the connection state. Handles talk to it over a command channel; spawned
//! helpers (connect attempts, the handshake wait, drain cycles) report back
//! over an internal channel tagged with the generation they belong to.
//! Every connect and every teardown bumps the generation, so results from
//! an abandoned attempt are recognised and dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use emessenger_core::Settings;
use emessenger_protocol::{ClientId, Packet, check_payload};

use crate::correlator::{RequestCorrelator, ResponseFuture};
use crate::error::{AssociationError, ClientError, ClientResult};
use crate::events::{ClientEvent, PushOutcome};
use crate::poll::{DrainCycle, DrainSummary, PollRequest};
use crate::transport::{Connector, TransportEvent, TransportLink};

/// Timing knobs for one logical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time between drain cycles. The first cycle starts one interval
    /// after association. `None` never polls.
    pub poll_interval: Option<Duration>,
    /// How long callers of [`ClientHandle::send_text`] wait for a reply.
    /// `None` waits until the reply arrives or the connection resets.
    pub request_timeout: Option<Duration>,
    /// How long a teardown waits for the transport to confirm the close.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Some(Duration::from_millis(1000)),
            request_timeout: None,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Builder: set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval.max(Duration::from_millis(1)));
        self
    }

    /// Builder: never poll the mailbox.
    pub fn without_polling(mut self) -> Self {
        self.poll_interval = None;
        self
    }

    /// Builder: set the caller-side request timeout.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Builder: set the close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

/// Published connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Associating,
    Associated { client_id: ClientId },
    /// The transport is open but the relay refused the handshake.
    AssociationFailed,
    Closing,
}

impl ConnectionState {
    pub fn is_associated(&self) -> bool {
        matches!(self, Self::Associated { .. })
    }
}

/// Commands accepted by the manager.
#[derive(Debug)]
enum Command {
    Connect {
        settings: Settings,
    },
    Disconnect,
    Push {
        peer_id: ClientId,
        text: String,
        reply: oneshot::Sender<ClientResult<ResponseFuture>>,
    },
    Submit {
        packet: Packet,
        reply: oneshot::Sender<ClientResult<ResponseFuture>>,
    },
    Stop,
}

/// Results coming back from spawned helpers.
enum Internal {
    Opened {
        generation: u64,
        result: ClientResult<TransportLink>,
    },
    Handshake {
        generation: u64,
        result: ClientResult<Packet>,
    },
    DrainFinished {
        generation: u64,
        summary: DrainSummary,
    },
}

/// Internal state; [`ConnectionState`] is its public face.
#[derive(Debug)]
enum Phase {
    Disconnected,
    Connecting(Settings),
    Associating(Settings),
    Associated(Settings),
    AssociationFailed(Settings),
    Closing { next: Option<Settings> },
}

impl Phase {
    fn public(&self) -> ConnectionState {
        match self {
            Self::Disconnected => ConnectionState::Disconnected,
            Self::Connecting(_) => ConnectionState::Connecting,
            Self::Associating(_) => ConnectionState::Associating,
            Self::Associated(settings) => ConnectionState::Associated {
                client_id: settings.client_id,
            },
            Self::AssociationFailed(_) => ConnectionState::AssociationFailed,
            Self::Closing { .. } => ConnectionState::Closing,
        }
    }
}

/// Owns one logical connection to a relay.
pub struct ConnectionManager {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<ClientEvent>,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Creates a manager that reports to `events`.
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            connector,
            events,
            command_tx,
            command_rx,
            state_tx,
        }
    }

    /// Creates a manager, spawns it, and returns a handle plus its events.
    pub fn spawn(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self::new(config, connector, events_tx);
        let handle = manager.handle();
        tokio::spawn(manager.run());
        (handle, events_rx)
    }

    /// Returns a handle for driving the manager.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            commands: self.command_tx.clone(),
            state: self.state_tx.subscribe(),
            request_timeout: self.config.request_timeout,
        }
    }

    /// Runs until every handle is dropped or [`ClientHandle::stop`] is called.
    pub async fn run(self) {
        let Self {
            config,
            connector,
            events,
            command_tx,
            command_rx,
            state_tx,
        } = self;
        // Only handles keep the command channel open.
        drop(command_tx);

        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();

        let mut actor = Actor {
            config,
            connector,
            events,
            state_tx,
            phase: Phase::Disconnected,
            generation: 0,
            correlator: RequestCorrelator::new(),
            link: None,
            poll_timer: None,
            drain: None,
            close_deadline: None,
            internal_tx,
            internal_rx,
            poll_tx,
            poll_rx,
        };
        actor.run(command_rx).await;
    }
}

enum Step {
    Command(Command),
    Stop,
    Internal(Internal),
    Poll(PollRequest),
    Transport(TransportEvent),
    Tick,
    CloseTimeout,
}

struct Actor {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state_tx: watch::Sender<ConnectionState>,
    phase: Phase,
    generation: u64,
    correlator: RequestCorrelator,
    link: Option<TransportLink>,
    poll_timer: Option<Interval>,
    drain: Option<JoinHandle<()>>,
    close_deadline: Option<Instant>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    poll_tx: mpsc::UnboundedSender<PollRequest>,
    poll_rx: mpsc::UnboundedReceiver<PollRequest>,
}

impl Actor {
    async fn run(&mut self, mut commands: mpsc::Receiver<Command>) {
        debug!("Connection manager started");

        loop {
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop) | None => Step::Stop,
                    Some(command) => Step::Command(command),
                },
                Some(internal) = self.internal_rx.recv() => Step::Internal(internal),
                Some(request) = self.poll_rx.recv() => Step::Poll(request),
                event = next_transport_event(&mut self.link) => Step::Transport(event),
                _ = next_tick(&mut self.poll_timer) => Step::Tick,
                _ = sleep_until(self.close_deadline) => Step::CloseTimeout,
            };

            match step {
                Step::Command(command) => self.on_command(command),
                Step::Stop => break,
                Step::Internal(internal) => self.on_internal(internal),
                Step::Poll(request) => self.on_poll_request(request),
                Step::Transport(event) => self.on_transport_event(event),
                Step::Tick => self.on_tick(),
                Step::CloseTimeout => {
                    debug!("Transport did not confirm close in time");
                    self.finish_closing();
                }
            }
        }

        self.stop_polling();
        self.correlator.reset_all();
        if let Some(link) = self.link.take() {
            link.handle.close();
        }
        debug!("Connection manager stopped");
    }

    fn set_phase(&mut self, phase: Phase) {
        let state = phase.public();
        trace!(from = ?self.phase, to = ?phase, "Phase change");
        self.phase = phase;
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { settings } => self.connect(settings),
            Command::Disconnect => self.disconnect(),
            Command::Push {
                peer_id,
                text,
                reply,
            } => {
                let client_id = match &self.phase {
                    Phase::Associated(settings) => Some(settings.client_id),
                    _ => None,
                };
                let result = match client_id {
                    Some(client_id) => self.submit(&Packet::push(client_id, peer_id, text)),
                    None => Err(ClientError::NotAssociated),
                };
                let _ = reply.send(result);
            }
            Command::Submit { packet, reply } => {
                let result = match self.phase {
                    Phase::Associated(_) => self.submit(&packet),
                    _ => Err(ClientError::NotAssociated),
                };
                let _ = reply.send(result);
            }
            Command::Stop => {}
        }
    }

    fn submit(&mut self, packet: &Packet) -> ClientResult<ResponseFuture> {
        let link = self.link.as_ref().ok_or(ClientError::NotAssociated)?;
        self.correlator.submit(packet, &link.handle)
    }

    fn connect(&mut self, settings: Settings) {
        info!(settings = %settings, "Connecting");
        if let Phase::Closing { next } = &mut self.phase {
            *next = Some(settings);
            return;
        }
        match self.phase {
            Phase::Disconnected => self.open(settings),
            Phase::Connecting(_) => {
                debug!("Abandoning in-flight connect attempt");
                self.open(settings);
            }
            _ => self.begin_closing(Some(settings)),
        }
    }

    fn disconnect(&mut self) {
        if let Phase::Closing { next } = &mut self.phase {
            *next = None;
            return;
        }
        match self.phase {
            Phase::Disconnected => {}
            Phase::Connecting(_) => {
                self.generation += 1;
                self.set_phase(Phase::Disconnected);
            }
            _ => {
                info!("Disconnecting");
                self.begin_closing(None);
            }
        }
    }

    /// Starts a connect attempt for a fresh generation.
    fn open(&mut self, settings: Settings) {
        self.generation += 1;
        let generation = self.generation;
        let connector = self.connector.clone();
        let internal = self.internal_tx.clone();
        let url = settings.server_url.clone();

        self.set_phase(Phase::Connecting(settings));
        tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = internal.send(Internal::Opened { generation, result });
        });
    }

    /// Stops everything tied to the current transport and asks it to close.
    fn begin_closing(&mut self, next: Option<Settings>) {
        self.generation += 1;
        self.stop_polling();
        self.correlator.reset_all();
        if let Some(link) = &self.link {
            link.handle.close();
        }
        self.close_deadline = Some(Instant::now() + self.config.close_timeout);
        self.set_phase(Phase::Closing { next });
    }

    fn finish_closing(&mut self) {
        self.link = None;
        self.close_deadline = None;
        let next = match &mut self.phase {
            Phase::Closing { next } => next.take(),
            _ => None,
        };
        match next {
            Some(settings) => self.open(settings),
            None => self.set_phase(Phase::Disconnected),
        }
    }

    /// Drops the transport after it failed or closed on its own.
    fn lose_transport(&mut self, event: ClientEvent) {
        self.generation += 1;
        self.stop_polling();
        self.correlator.reset_all();
        self.link = None;
        self.set_phase(Phase::Disconnected);
        self.emit(event);
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Opened { generation, result } => self.on_opened(generation, result),
            Internal::Handshake { generation, result } => self.on_handshake(generation, result),
            Internal::DrainFinished {
                generation,
                summary,
            } => {
                trace!(?summary, "Drain finished");
                if generation == self.generation {
                    self.drain = None;
                }
            }
        }
    }

    fn on_opened(&mut self, generation: u64, result: ClientResult<TransportLink>) {
        if generation != self.generation {
            // Dropping a stale link closes it.
            debug!(generation, "Discarding result of abandoned connect attempt");
            return;
        }
        let Phase::Connecting(settings) = &self.phase else {
            return;
        };
        let settings = settings.clone();

        let link = match result {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                self.set_phase(Phase::Disconnected);
                self.emit(ClientEvent::ConnectFailed {
                    reason: e.to_string(),
                });
                return;
            }
        };

        debug!(client_id = settings.client_id, "Transport open, associating");
        let handshake = self
            .correlator
            .submit(&Packet::associate(settings.client_id), &link.handle);
        self.link = Some(link);
        self.set_phase(Phase::Associating(settings));

        match handshake {
            Ok(response) => {
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = response.await;
                    let _ = internal.send(Internal::Handshake { generation, result });
                });
            }
            Err(e) => self.lose_transport(ClientEvent::ConnectionLost {
                reason: e.to_string(),
            }),
        }
    }

    fn on_handshake(&mut self, generation: u64, result: ClientResult<Packet>) {
        if generation != self.generation {
            return;
        }
        let Phase::Associating(settings) = &self.phase else {
            return;
        };
        let settings = settings.clone();

        let error = match result {
            Ok(reply) => AssociationError::from_reply(&reply),
            Err(ClientError::Protocol(e)) => Some(AssociationError::Malformed(e)),
            // Teardown already reported it.
            Err(_) => return,
        };

        match error {
            None => {
                let client_id = settings.client_id;
                info!(client_id, "Associated");
                self.set_phase(Phase::Associated(settings));
                self.start_polling();
                self.emit(ClientEvent::Associated { client_id });
            }
            Some(error) => {
                warn!(error = %error, "Association failed");
                self.set_phase(Phase::AssociationFailed(settings));
                self.emit(ClientEvent::AssociationFailed { error });
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let closing = matches!(self.phase, Phase::Closing { .. });
        match event {
            TransportEvent::Frame(frame) => {
                self.correlator.on_frame(&frame);
            }
            event if closing => {
                trace!(?event, "Transport closed");
                self.finish_closing();
            }
            event if event.is_going_away() => {
                info!("Relay is shutting down");
                self.lose_transport(ClientEvent::ServerShutdown);
            }
            TransportEvent::Closed { code, reason } => {
                let reason = match code {
                    Some(code) => format!("closed with code {}: {}", code, reason),
                    None if reason.is_empty() => "connection closed".to_string(),
                    None => reason,
                };
                warn!(reason = %reason, "Connection lost");
                self.lose_transport(ClientEvent::ConnectionLost { reason });
            }
            TransportEvent::Error(reason) => {
                warn!(reason = %reason, "Connection lost");
                self.lose_transport(ClientEvent::ConnectionLost { reason });
            }
        }
    }

    fn on_poll_request(&mut self, request: PollRequest) {
        let result = if request.generation == self.generation && self.phase_is_associated() {
            self.submit(&request.packet)
        } else {
            Err(ClientError::NotAssociated)
        };
        let _ = request.reply.send(result);
    }

    fn phase_is_associated(&self) -> bool {
        matches!(self.phase, Phase::Associated(_))
    }

    fn start_polling(&mut self) {
        let Some(period) = self.config.poll_interval else {
            debug!("Polling disabled for this session");
            return;
        };
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.poll_timer = Some(timer);
    }

    fn stop_polling(&mut self) {
        self.poll_timer = None;
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }

    fn on_tick(&mut self) {
        let Phase::Associated(settings) = &self.phase else {
            return;
        };
        let client_id = settings.client_id;
        if self.drain.is_some() {
            trace!("Drain still running, tick coalesced");
            return;
        }

        let generation = self.generation;
        let cycle = DrainCycle {
            client_id,
            generation,
            submit: self.poll_tx.clone(),
            events: self.events.clone(),
        };
        let internal = self.internal_tx.clone();
        self.drain = Some(tokio::spawn(async move {
            let summary = cycle.run().await;
            let _ = internal.send(Internal::DrainFinished {
                generation,
                summary,
            });
        }));
    }
}

async fn next_transport_event(link: &mut Option<TransportLink>) -> TransportEvent {
    match link {
        Some(link) => link.events.recv().await.unwrap_or(TransportEvent::Closed {
            code: None,
            reason: "transport task ended".to_string(),
        }),
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    request_timeout: Option<Duration>,
}

impl ClientHandle {
    /// Connects (or reconnects) using `settings`.
    ///
    /// Returns once the manager has accepted the command. Progress is
    /// reported through events and [`ClientHandle::state_changes`].
    pub async fn connect(&self, settings: Settings) -> ClientResult<()> {
        self.command(Command::Connect { settings }).await
    }

    /// Closes the connection, if any.
    pub async fn disconnect(&self) -> ClientResult<()> {
        self.command(Command::Disconnect).await
    }

    /// Stops the manager.
    pub async fn stop(&self) -> ClientResult<()> {
        self.command(Command::Stop).await
    }

    /// Pushes `text` into `peer_id`'s mailbox.
    ///
    /// Fails with [`ClientError::NotAssociated`] without touching the
    /// transport unless a session is up, and with a protocol error if the
    /// text does not fit one frame.
    pub async fn send_text(&self, peer_id: ClientId, text: &str) -> ClientResult<PushOutcome> {
        check_payload(text)?;
        if !self.state().is_associated() {
            return Err(ClientError::NotAssociated);
        }

        let (reply, rx) = oneshot::channel();
        self.command(Command::Push {
            peer_id,
            text: text.to_string(),
            reply,
        })
        .await?;
        let reply = self.wait(rx).await?;
        Ok(PushOutcome::from_reply(reply))
    }

    /// Sends an arbitrary packet on the current session and waits for the
    /// reply paired with it.
    pub async fn request(&self, packet: Packet) -> ClientResult<Packet> {
        if !self.state().is_associated() {
            return Err(ClientError::NotAssociated);
        }
        let (reply, rx) = oneshot::channel();
        self.command(Command::Submit { packet, reply }).await?;
        self.wait(rx).await
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn command(&self, command: Command) -> ClientResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::ManagerStopped)
    }

    async fn wait(
        &self,
        submitted: oneshot::Receiver<ClientResult<ResponseFuture>>,
    ) -> ClientResult<Packet> {
        let response = submitted.await.map_err(|_| ClientError::ManagerStopped)??;
        match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, response)
                .await
                .map_err(|_| ClientError::Timeout)?,
            None => response.await,
        }
    }
}
