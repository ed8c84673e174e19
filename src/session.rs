//! Session State Machine: the orchestrator for one participant.
//!
//! [`Session`] is a thin handle to a single driver task. The driver owns every
//! piece of mutable session state (lifecycle, role, peer, chat log, the live
//! [`NegotiationEngine`]) and processes, strictly one at a time, four inputs:
//! user commands, Transport Channel events, results of suspended negotiation
//! and media operations, and the shutdown signal.
//!
//! ```text
//!   Idle ──start──▶ Waiting ──matched──▶ Matched ──offer/answer──▶ Negotiating
//!    ▲                 ▲                    │                          │
//!    │ leave           │ skip / remote-left │                remote stream
//!    │                 └────────────────────┴──────────── Connected ◀──┘
//!   Error ◀── connect error (any state), left only by `restart`
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let connector = WebSocketConnector::new("ws://localhost:3000/ws");
//! let config = SessionConfig::new()
//!     .with_preferences(UserPreferences::from_interest_list("music, games"));
//! let (session, mut events) = Session::connect(connector, NullMediaCapability, config);
//!
//! session.start()?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Snapshot(s) => render(&ViewState::from(&s)),
//!         SessionEvent::Closed => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelEvent, SignalingChannel};
use crate::chat::{outgoing_text, ChatLog, ChatOrigin};
use crate::error::{PairChatError, Result};
use crate::event::{Alert, SessionEvent, SessionSnapshot};
use crate::media::{capture_released, CaptureLease, MediaCapability, MediaConstraints};
use crate::negotiation::{EngineOutput, Generation, GenerationCounter, NegotiationEngine, Tagged};
use crate::peer::{PeerConfig, PeerSignal, PeerSignalSink, RemoteStream};
use crate::protocol::{IceCandidate, PeerId, Role, SessionDescription, UserPreferences};
use crate::state::{LifecycleState, SessionRole};
use crate::transport::Connector;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Chat notice shown when the peer is present but no media will flow.
pub const PEER_PRESENT_NOTICE: &str = "Stranger connected! (video unavailable)";

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`Session`].
///
/// # Example
///
/// ```
/// use pairchat_client::session::SessionConfig;
/// use pairchat_client::protocol::UserPreferences;
/// use std::time::Duration;
///
/// let config = SessionConfig::new()
///     .with_preferences(UserPreferences::from_interest_list("music, travel"))
///     .with_event_channel_capacity(64)
///     .with_shutdown_timeout(Duration::from_secs(2));
/// assert_eq!(config.preferences.interests, vec!["music", "travel"]);
/// assert!(!config.auto_start);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sent with every `announce-ready`.
    pub preferences: UserPreferences,
    /// ICE servers for each peer connection.
    pub peer: PeerConfig,
    /// What to capture when a session starts.
    pub media_constraints: MediaConstraints,
    /// Capacity of the bounded event channel.
    ///
    /// Snapshots and presence updates are dropped (with a warning logged)
    /// when the consumer lags. `TransportFailure` alerts and `Closed` are
    /// always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Budget for flushing `leave` and closing the transport on shutdown.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Perform `start` as soon as the transport reports `connected`.
    ///
    /// Defaults to `false`.
    pub auto_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            preferences: UserPreferences::default(),
            peer: PeerConfig::default(),
            media_constraints: MediaConstraints::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            auto_start: false,
        }
    }

    #[must_use]
    pub fn with_preferences(mut self, preferences: UserPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    #[must_use]
    pub fn with_peer_config(mut self, peer: PeerConfig) -> Self {
        self.peer = peer;
        self
    }

    #[must_use]
    pub fn with_media_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.media_constraints = constraints;
        self
    }

    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

// ── Session handle ──────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    Start,
    Skip,
    Leave,
    SendChat(String),
    ToggleLocalAudio,
    ToggleLocalVideo,
    Restart,
}

/// Handle to a running session.
///
/// Created via [`Session::connect`]. Every command is queued to the driver
/// task and returns immediately; the outcome is observed through
/// [`SessionEvent`]s or [`Session::snapshot`].
pub struct Session {
    cmd_tx: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl Session {
    /// Open the rendezvous connection and spawn the driver task.
    ///
    /// `media` is consulted once per match; pass
    /// [`NullMediaCapability`](crate::media::NullMediaCapability) for a
    /// text-only client.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn connect(
        connector: impl Connector,
        media: impl MediaCapability,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let connector: Arc<dyn Connector> = Arc::new(connector);
        let media: Arc<dyn MediaCapability> = Arc::new(media);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (outputs_tx, outputs_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let (channel, channel_rx) =
            SignalingChannel::connect(Arc::clone(&connector), config.shutdown_timeout);
        let shutdown_timeout = config.shutdown_timeout;

        let driver = Driver {
            connector,
            media,
            config,
            channel: Some(channel),
            channel_rx: Some(channel_rx),
            state: LifecycleState::Idle,
            role: SessionRole::Unassigned,
            peer_id: None,
            chat: ChatLog::new(),
            engine: None,
            generations: GenerationCounter::default(),
            outputs_tx,
            last_capture: None,
            event_tx,
            snapshot_tx,
            transport_up: false,
            presence_count: None,
            local_media_available: false,
            remote_media_available: false,
            remote_stream: None,
            audio_muted: false,
            video_muted: false,
            text_only: false,
        };
        let task = tokio::spawn(driver.run(cmd_rx, outputs_rx, shutdown_rx));

        let session = Self {
            cmd_tx,
            snapshot_rx,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        };
        (session, event_rx)
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Enter matchmaking. Only meaningful in `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::SessionClosed`] once the session has shut down.
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    /// Abandon the current peer and re-enter matchmaking.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::SessionClosed`] once the session has shut down.
    pub fn skip(&self) -> Result<()> {
        self.send(Command::Skip)
    }

    /// Abandon the session and the queue, returning to `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::SessionClosed`] once the session has shut down.
    pub fn leave(&self) -> Result<()> {
        self.send(Command::Leave)
    }

    /// Send chat text to the current peer. Ignored unless a peer is present.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::SessionClosed`] once the session has shut down.
    pub fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SendChat(text.into()))
    }

    /// Mute or unmute the local microphone. Never signaled to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::SessionClosed`] once the session has shut down.
    pub fn toggle_local_audio(&self) -> Result<()> {
        self.send(Command::ToggleLocalAudio)
    }

    /// Blank or unblank the local camera. Never signaled to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::SessionClosed`] once the session has shut down.
    pub fn toggle_local_video(&self) -> Result<()> {
        self.send(Command::ToggleLocalVideo)
    }

    /// Leave `Error` with a fresh rendezvous connection.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::SessionClosed`] once the session has shut down.
    pub fn restart(&self) -> Result<()> {
        self.send(Command::Restart)
    }

    // ── State accessors ─────────────────────────────────────────────

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// A receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Tear down the session, flush `leave` and stop the driver task.
    pub async fn shutdown(&mut self) {
        debug!("Session: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // The driver itself waits up to `shutdown_timeout` for the channel.
        let budget = self.shutdown_timeout.saturating_mul(2);
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(budget, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => warn!("session task terminated with join error: {join_err}"),
                Err(_) => {
                    warn!("session task did not exit within timeout; aborting");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session task aborted: {join_err}");
                    }
                }
            }
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.shutdown_tx.is_none() {
            return Err(PairChatError::SessionClosed);
        }
        self.cmd_tx
            .send(command)
            .map_err(|_| PairChatError::SessionClosed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot_rx.borrow();
        f.debug_struct("Session")
            .field("state", &snapshot.lifecycle_state)
            .field("role", &snapshot.role)
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────

/// Owns all session state. Runs on exactly one task.
struct Driver {
    connector: Arc<dyn Connector>,
    media: Arc<dyn MediaCapability>,
    config: SessionConfig,
    channel: Option<SignalingChannel>,
    channel_rx: Option<mpsc::Receiver<ChannelEvent>>,

    state: LifecycleState,
    role: SessionRole,
    peer_id: Option<PeerId>,
    chat: ChatLog,
    engine: Option<NegotiationEngine>,
    generations: GenerationCounter,
    outputs_tx: mpsc::UnboundedSender<Tagged>,
    /// Flips to `true` once the most recent capture has been stopped.
    last_capture: Option<watch::Receiver<bool>>,

    event_tx: mpsc::Sender<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,

    transport_up: bool,
    presence_count: Option<u32>,
    local_media_available: bool,
    remote_media_available: bool,
    remote_stream: Option<RemoteStream>,
    audio_muted: bool,
    video_muted: bool,
    /// The "peer present" notice has been posted for this session.
    text_only: bool,
}

impl Driver {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut outputs_rx: mpsc::UnboundedReceiver<Tagged>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!("session driver started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("session shutdown signal received");
                    break;
                }

                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    // Handle dropped.
                    None => break,
                },

                event = next_channel_event(&mut self.channel_rx) => match event {
                    Some(event) => self.on_channel_event(event).await,
                    None => self.channel_rx = None,
                },

                Some(tagged) = outputs_rx.recv() => self.on_output(tagged),
            }
        }

        self.close().await;
        debug!("session driver exited");
    }

    // ── User commands ───────────────────────────────────────────────

    async fn on_command(&mut self, cmd: Command) {
        debug!(state = %self.state, ?cmd, "command");
        match cmd {
            Command::Start => self.start(),
            Command::Skip => {
                if !self.state.is_in_session() {
                    debug!(state = %self.state, "skip ignored outside a session");
                    return;
                }
                self.abandon_peer();
                self.publish();
            }
            Command::Leave => {
                if !self.state.is_in_session() && self.state != LifecycleState::Waiting {
                    debug!(state = %self.state, "leave ignored");
                    return;
                }
                self.channel_send("leave", SignalingChannel::send_leave);
                self.teardown_session();
                self.state = LifecycleState::Idle;
                info!("left matchmaking");
                self.publish();
            }
            Command::SendChat(text) => self.send_chat(&text),
            Command::ToggleLocalAudio => {
                self.audio_muted = !self.audio_muted;
                if let Some(engine) = &self.engine {
                    engine.set_audio_enabled(!self.audio_muted);
                }
                self.publish();
            }
            Command::ToggleLocalVideo => {
                self.video_muted = !self.video_muted;
                if let Some(engine) = &self.engine {
                    engine.set_video_enabled(!self.video_muted);
                }
                self.publish();
            }
            Command::Restart => self.restart().await,
        }
    }

    fn start(&mut self) {
        match self.state {
            LifecycleState::Idle => {
                self.enter_waiting();
                self.publish();
            }
            LifecycleState::Error => warn!("start ignored in error state; restart first"),
            state => debug!(%state, "start ignored; already matchmaking"),
        }
    }

    async fn restart(&mut self) {
        if self.state != LifecycleState::Error {
            debug!(state = %self.state, "restart ignored outside error state");
            return;
        }
        if let Some(mut old) = self.channel.take() {
            old.shutdown().await;
        }
        info!("reconnecting to rendezvous server");
        let (channel, channel_rx) =
            SignalingChannel::connect(Arc::clone(&self.connector), self.config.shutdown_timeout);
        self.channel = Some(channel);
        self.channel_rx = Some(channel_rx);
        self.state = LifecycleState::Idle;
        self.publish();
    }

    fn send_chat(&mut self, text: &str) {
        if !self.state.is_in_session() || self.peer_id.is_none() {
            debug!(state = %self.state, "chat dropped; no peer");
            return;
        }
        let Some(text) = outgoing_text(text) else {
            return;
        };
        // The local echo is appended even if the channel is down.
        self.channel_send("chat-send", |ch| ch.send_chat(text.clone()));
        self.chat.push(ChatOrigin::Local, text);
        self.publish();
    }

    // ── Transport Channel events ────────────────────────────────────

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                info!("rendezvous connection up");
                self.transport_up = true;
                if self.config.auto_start && self.state == LifecycleState::Idle {
                    self.enter_waiting();
                }
                self.publish();
            }
            ChannelEvent::ConnectError { reason } => {
                error!(%reason, "rendezvous connection failed");
                self.transport_up = false;
                self.channel = None;
                self.channel_rx = None;
                self.teardown_session();
                self.state = LifecycleState::Error;
                self.publish();
                self.emit_blocking(SessionEvent::Alert(Alert::TransportFailure { reason }))
                    .await;
            }
            ChannelEvent::Disconnected => {
                self.transport_up = false;
                self.publish();
            }
            ChannelEvent::PresenceCount(count) => {
                self.presence_count = Some(count);
                self.emit(SessionEvent::PresenceCount(count));
                self.publish();
            }
            ChannelEvent::Matched { peer_id, role } => self.on_matched(peer_id, role),
            ChannelEvent::RemoteDescription(description) => self.on_remote_description(description),
            ChannelEvent::RemoteCandidate(candidate) => self.on_remote_candidate(candidate),
            ChannelEvent::RemoteLeft => self.on_peer_gone(Alert::PeerLeft),
            ChannelEvent::RemoteSkipped => self.on_peer_gone(Alert::PeerSkipped),
            ChannelEvent::ChatReceived(text) => {
                if !self.state.is_in_session() {
                    debug!(state = %self.state, "chat from absent peer dropped");
                    return;
                }
                self.chat.push(ChatOrigin::Remote, text);
                self.publish();
            }
        }
    }

    fn on_matched(&mut self, peer_id: PeerId, role: Role) {
        match self.state {
            LifecycleState::Waiting => {}
            state if state.is_in_session() => {
                if self.peer_id.as_deref() == Some(peer_id.as_str()) {
                    debug!(%peer_id, "duplicate match discarded");
                    return;
                }
                // Implicit remote-left, then the new match. Never merged.
                warn!(%peer_id, previous = ?self.peer_id, "match for a new peer mid-session");
                self.teardown_session();
                self.emit(SessionEvent::Alert(Alert::PeerLeft));
            }
            state => {
                warn!(%state, %peer_id, "match outside matchmaking discarded");
                return;
            }
        }
        self.enter_session(peer_id, role);
        self.publish();
    }

    fn on_remote_description(&mut self, description: SessionDescription) {
        if self.role == SessionRole::Unassigned || !self.state.is_in_session() {
            warn!(state = %self.state, "description before match discarded");
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            debug!("description ignored; session is text-only");
            return;
        };
        match engine.apply_remote_description(description) {
            Ok(true) => {
                if self.state == LifecycleState::Matched {
                    self.state = LifecycleState::Negotiating;
                }
                self.publish();
            }
            Ok(false) => debug!("remote description already applied"),
            Err(PairChatError::ProtocolViolation(detail)) => {
                warn!(%detail, "protocol violation; abandoning session");
                self.abandon_peer();
                self.emit(SessionEvent::Alert(Alert::ProtocolViolation { detail }));
                self.publish();
            }
            Err(e) => warn!("remote description rejected: {e}"),
        }
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.role == SessionRole::Unassigned || !self.state.is_in_session() {
            warn!(state = %self.state, "candidate before match discarded");
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            debug!("candidate ignored; session is text-only");
            return;
        };
        if let Err(e) = engine.apply_remote_candidate(candidate) {
            warn!("remote candidate discarded: {e}");
            return;
        }
        self.publish();
    }

    fn on_peer_gone(&mut self, alert: Alert) {
        if !self.state.is_in_session() {
            debug!(state = %self.state, ?alert, "peer notification outside a session ignored");
            return;
        }
        info!(?alert, "peer gone; re-entering matchmaking");
        self.teardown_session();
        self.emit(SessionEvent::Alert(alert));
        self.enter_waiting();
        self.publish();
    }

    // ── Suspended operation results ─────────────────────────────────

    fn on_output(&mut self, tagged: Tagged) {
        let Tagged { generation, output } = tagged;
        let current = self.engine.as_ref().map(NegotiationEngine::generation);
        if current != Some(generation) {
            debug!(%generation, "stale result discarded");
            if let EngineOutput::MediaAcquired(media) = output {
                media.stop();
            }
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };

        match output {
            EngineOutput::LocalDescriptionReady(description) => {
                engine.local_description_ready(description.clone());
                self.channel_send("description", |ch| ch.send_description(description));
                if self.state == LifecycleState::Matched {
                    self.state = LifecycleState::Negotiating;
                }
            }
            EngineOutput::RemoteDescriptionApplied(description) => {
                if !engine.remote_description_applied(&description) {
                    return;
                }
                if engine.role() == Role::Responder && description.is_offer() {
                    if let Err(e) = engine.create_answer(&description) {
                        warn!("could not answer: {e}");
                    }
                }
            }
            EngineOutput::MediaAcquired(media) => {
                media.set_audio_enabled(!self.audio_muted);
                media.set_video_enabled(!self.video_muted);
                engine.attach_media(media);
                self.local_media_available = true;
            }
            EngineOutput::MediaFailed(e) => {
                warn!("local media unavailable: {e}");
                self.degrade_to_text_only(e.to_string());
            }
            EngineOutput::CandidateRejected { candidate, error } => {
                warn!(candidate = %candidate.candidate, "candidate rejected by peer connection: {error}");
                return;
            }
            EngineOutput::OperationFailed { operation, error } => {
                warn!(operation, "negotiation step failed: {error}");
                engine.operation_failed(operation);
            }
            EngineOutput::Peer(PeerSignal::LocalCandidate(candidate)) => {
                engine.record_local_candidate(candidate.clone());
                self.channel_send("candidate", |ch| ch.send_candidate(candidate));
            }
            EngineOutput::Peer(PeerSignal::RemoteStreamReady(stream)) => {
                if !engine.remote_stream_ready() {
                    return;
                }
                info!(stream = %stream.id, "remote media flowing");
                self.remote_media_available = true;
                self.remote_stream = Some(stream);
                if self.state.is_in_session() {
                    self.state = LifecycleState::Connected;
                }
            }
            EngineOutput::Peer(PeerSignal::NegotiationNeeded) => {
                let context = engine.context();
                let may_offer = engine.role() == Role::Initiator
                    && context.local_description.is_none()
                    && !context.offer_in_flight;
                if !may_offer {
                    return;
                }
                if let Err(e) = engine.create_offer() {
                    warn!("renegotiation offer failed: {e}");
                }
            }
        }
        self.publish();
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Enter `Waiting` and ask the server for a match.
    fn enter_waiting(&mut self) {
        self.state = LifecycleState::Waiting;
        let preferences = self.config.preferences.clone();
        self.channel_send("announce-ready", |ch| ch.announce_ready(preferences));
    }

    /// Enter `Matched` with a fresh negotiation context.
    fn enter_session(&mut self, peer_id: PeerId, role: Role) {
        info!(%peer_id, ?role, "matched");
        self.chat.clear();
        self.peer_id = Some(peer_id);
        self.role = SessionRole::from(role);
        self.state = LifecycleState::Matched;
        self.text_only = false;

        if !self.media.is_available() {
            self.degrade_to_text_only("media capture is not available on this platform".into());
            return;
        }

        let generation = self.generations.advance();
        let sink = PeerSignalSink::new(generation, self.outputs_tx.clone());
        let peer = match self.media.create_peer_connection(&self.config.peer, sink) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("no peer connection: {e}");
                self.degrade_to_text_only(e.to_string());
                return;
            }
        };
        let mut engine = NegotiationEngine::new(role, generation, peer, self.outputs_tx.clone());
        self.spawn_media_acquisition(generation);
        // Offer creation does not wait for local media.
        if role == Role::Initiator {
            if let Err(e) = engine.create_offer() {
                warn!("could not start offer: {e}");
            }
        }
        self.engine = Some(engine);
    }

    /// Acquire local media for `generation` once the previous capture, if any,
    /// has been stopped.
    fn spawn_media_acquisition(&mut self, generation: Generation) {
        let media = Arc::clone(&self.media);
        let constraints = self.config.media_constraints.clone();
        let outputs = self.outputs_tx.clone();
        let (released_tx, released_rx) = watch::channel(false);
        let previous = self.last_capture.replace(released_rx);
        tokio::spawn(async move {
            if let Some(previous) = previous {
                capture_released(previous).await;
            }
            // Dropping `released_tx` on failure releases the next acquisition.
            let output = match media.acquire(&constraints).await {
                Ok(stream) => {
                    EngineOutput::MediaAcquired(Arc::new(CaptureLease::new(stream, released_tx)))
                }
                Err(e) => EngineOutput::MediaFailed(e),
            };
            if let Err(mpsc::error::SendError(unsent)) = outputs.send(Tagged { generation, output }) {
                // Session gone; nobody else will release the devices.
                if let EngineOutput::MediaAcquired(stream) = unsent.output {
                    stream.stop();
                }
            }
        });
    }

    /// Tell the server we skipped, tear down, and re-enter matchmaking.
    fn abandon_peer(&mut self) {
        self.channel_send("skip", SignalingChannel::send_skip);
        self.teardown_session();
        self.enter_waiting();
    }

    /// Post the "peer present" notice once per session and let the session
    /// reach `Connected` without media. Once remote video is playing only the
    /// alert is raised.
    fn degrade_to_text_only(&mut self, reason: String) {
        self.local_media_available = false;
        if self.text_only {
            return;
        }
        if self.remote_media_available {
            self.emit(SessionEvent::Alert(Alert::MediaUnavailable { reason }));
            return;
        }
        self.text_only = true;
        self.chat.push(ChatOrigin::System, PEER_PRESENT_NOTICE);
        if matches!(
            self.state,
            LifecycleState::Matched | LifecycleState::Negotiating
        ) {
            self.state = LifecycleState::Connected;
        }
        self.emit(SessionEvent::Alert(Alert::MediaUnavailable { reason }));
    }

    /// Destroy the negotiation context and every per-peer field. The caller
    /// sets the next lifecycle state.
    fn teardown_session(&mut self) {
        if let Some(engine) = self.engine.take() {
            debug!(generation = %engine.generation(), "tearing down negotiation context");
        }
        self.generations.advance();
        self.chat.clear();
        self.peer_id = None;
        self.role = SessionRole::Unassigned;
        self.local_media_available = false;
        self.remote_media_available = false;
        self.remote_stream = None;
        self.text_only = false;
    }

    async fn close(&mut self) {
        self.teardown_session();
        self.state = LifecycleState::Idle;
        if let Some(mut channel) = self.channel.take() {
            // Flushes a best-effort `leave`.
            channel.shutdown().await;
        }
        self.channel_rx = None;
        self.transport_up = false;
        self.publish();
        self.emit_blocking(SessionEvent::Closed).await;
    }

    // ── Output helpers ──────────────────────────────────────────────

    fn channel_send<F>(&self, what: &'static str, op: F)
    where
        F: FnOnce(&SignalingChannel) -> Result<()>,
    {
        match &self.channel {
            Some(channel) => {
                if let Err(e) = op(channel) {
                    debug!(message = what, "not sent: {e}");
                }
            }
            None => debug!(message = what, "not sent: no rendezvous connection"),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            lifecycle_state: self.state,
            role: self.role,
            peer_id: self.peer_id.clone(),
            peer_present: self.state.is_in_session() && self.peer_id.is_some(),
            chat_log: self.chat.entries().to_vec(),
            local_media_available: self.local_media_available,
            remote_media_available: self.remote_media_available,
            text_only: self.text_only,
            audio_muted: self.audio_muted,
            video_muted: self.video_muted,
            transport_up: self.transport_up,
            presence_count: self.presence_count,
            generation: self.generations.current(),
            negotiation: self.engine.as_ref().map(|e| e.context().clone()),
            remote_stream: self.remote_stream.clone(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        self.emit(SessionEvent::Snapshot(snapshot));
    }

    /// Deliver an event, dropping it if the consumer lags.
    fn emit(&self, event: SessionEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    "event channel full, dropping event: {:?}",
                    std::mem::discriminant(&dropped)
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
        }
    }

    /// Deliver an event that must never be dropped.
    async fn emit_blocking(&self, event: SessionEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("event channel closed, receiver dropped");
        }
    }
}

async fn next_channel_event(rx: &mut Option<mpsc::Receiver<ChannelEvent>>) -> Option<ChannelEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::media::NullMediaCapability;
    use crate::transport::Transport;
    use async_trait::async_trait;

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            Err(PairChatError::TransportClosed)
        }
    }

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert!(!config.auto_start);
        assert!(config.preferences.interests.is_empty());
        assert_eq!(config.peer.ice_servers.len(), 3);
        assert!(config.media_constraints.audio);
    }

    #[test]
    fn event_channel_capacity_is_clamped_to_one() {
        let config = SessionConfig::new().with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[test]
    fn builder_methods() {
        let config = SessionConfig::new()
            .with_auto_start(true)
            .with_peer_config(PeerConfig::default().with_ice_servers(["stun:example.org:3478"]))
            .with_media_constraints(MediaConstraints {
                audio: true,
                video: None,
            });
        assert!(config.auto_start);
        assert_eq!(config.peer.ice_servers, vec!["stun:example.org:3478"]);
        assert!(config.media_constraints.video.is_none());
    }

    #[tokio::test]
    async fn refused_connection_enters_error_with_alert() {
        let (mut session, mut events) =
            Session::connect(Refusing, NullMediaCapability, SessionConfig::new());

        let mut saw_alert = false;
        while let Some(event) = events.recv().await {
            if let SessionEvent::Alert(Alert::TransportFailure { .. }) = event {
                saw_alert = true;
                break;
            }
        }
        assert!(saw_alert);
        assert_eq!(session.snapshot().lifecycle_state, LifecycleState::Error);

        session.start().unwrap();
        session.shutdown().await;
        assert!(matches!(session.start(), Err(PairChatError::SessionClosed)));
    }

    #[tokio::test]
    async fn shutdown_emits_closed_last() {
        let (mut session, mut events) =
            Session::connect(Refusing, NullMediaCapability, SessionConfig::new());
        session.shutdown().await;

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(SessionEvent::Closed));
    }

    #[tokio::test]
    async fn debug_impl_reports_state() {
        let (session, _events) =
            Session::connect(Refusing, NullMediaCapability, SessionConfig::new());
        let debug = format!("{session:?}");
        assert!(debug.contains("Session"));
        assert!(debug.contains("has_task: true"));
    }
}
