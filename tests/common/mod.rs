#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for PairChat Client integration tests.
//!
//! Provides a loopback rendezvous server reachable through a scripted
//! [`Connector`], a scripted [`MediaCapability`] whose peer connections record
//! every call, and an [`EventLog`] for waiting on session snapshots.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use pairchat_client::event::{Alert, SessionEvent, SessionSnapshot};
use pairchat_client::media::{LocalMedia, MediaCapability, MediaConstraints};
use pairchat_client::peer::{PeerConfig, PeerConnection, PeerSignal, PeerSignalSink};
use pairchat_client::protocol::{ClientMessage, IceCandidate, ServerMessage, SessionDescription};
use pairchat_client::{Connector, PairChatError, Session, Transport};

/// How long any single wait may take before the test fails.
pub const WAIT: Duration = Duration::from_secs(2);

/// A well-formed host candidate line.
pub const CANDIDATE: &str = "candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx";

// ── Loopback transport ──────────────────────────────────────────────

/// Client side of an in-memory connection.
pub struct LoopbackTransport {
    /// `None` makes `recv` report a server-side close.
    incoming: mpsc::UnboundedReceiver<Option<String>>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), PairChatError> {
        self.outgoing
            .send(message)
            .map_err(|e| PairChatError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, PairChatError>> {
        match self.incoming.recv().await {
            Some(Some(text)) => Some(Ok(text)),
            Some(None) => None,
            // Server handle dropped: stay connected until shutdown.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), PairChatError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Server side of an in-memory connection.
pub struct ServerHandle {
    to_client: mpsc::UnboundedSender<Option<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Deliver a message to the client.
    pub fn push(&self, msg: ServerMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.to_client.send(Some(json)).unwrap();
    }

    /// Deliver a raw frame to the client.
    pub fn push_raw(&self, frame: &str) {
        self.to_client.send(Some(frame.to_string())).unwrap();
    }

    /// Close the connection from the server side.
    pub fn disconnect(&self) {
        self.to_client.send(None).unwrap();
    }

    /// The next message the client sent.
    pub async fn next_message(&mut self) -> ClientMessage {
        let json = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("client message in time")
            .expect("client connection open");
        serde_json::from_str(&json).unwrap()
    }

    /// Assert that the client sends nothing for a short while.
    pub async fn assert_silent(&mut self) {
        let waited = tokio::time::timeout(Duration::from_millis(100), self.from_client.recv()).await;
        if let Ok(Some(json)) = waited {
            panic!("unexpected client message: {json}");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Create a connected transport/server pair.
pub fn loopback() -> (LoopbackTransport, ServerHandle) {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_client) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let transport = LoopbackTransport {
        incoming,
        outgoing,
        closed: Arc::clone(&closed),
    };
    let server = ServerHandle {
        to_client,
        from_client,
        closed,
    };
    (transport, server)
}

// ── Scripted connector ──────────────────────────────────────────────

/// Outcome of one connection attempt.
pub enum Attempt {
    Accept(LoopbackTransport),
    Refuse(&'static str),
}

/// Plays back connection attempts in order; refuses once exhausted.
pub struct ScriptedConnector {
    attempts: StdMutex<VecDeque<Attempt>>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(attempts: Vec<Attempt>) -> Self {
        Self {
            attempts: StdMutex::new(VecDeque::from(attempts)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, PairChatError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let next = self.attempts.lock().unwrap().pop_front();
        match next {
            Some(Attempt::Accept(transport)) => Ok(Box::new(transport)),
            Some(Attempt::Refuse(reason)) => Err(PairChatError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                reason,
            ))),
            None => Err(PairChatError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no more scripted connections",
            ))),
        }
    }
}

/// A connector whose first attempt reaches the returned server.
pub fn single_server() -> (ScriptedConnector, ServerHandle) {
    let (transport, server) = loopback();
    (ScriptedConnector::new(vec![Attempt::Accept(transport)]), server)
}

// ── Mock media ──────────────────────────────────────────────────────

/// A capture stream that records its track state.
#[derive(Debug)]
pub struct MockStream {
    pub id: String,
    pub stopped: AtomicBool,
    pub audio_enabled: AtomicBool,
    pub video_enabled: AtomicBool,
}

impl MockStream {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

impl LocalMedia for MockStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

/// Calls recorded by [`MockPeer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(String),
    AddLocalMedia(String),
    Close,
}

/// A peer connection that records calls and lets tests raise callbacks.
pub struct MockPeer {
    calls: StdMutex<Vec<PeerCall>>,
    sink: PeerSignalSink,
}

impl MockPeer {
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &PeerCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// Raise a callback as the platform would.
    pub fn emit(&self, signal: PeerSignal) {
        assert!(self.sink.emit(signal), "session is gone");
    }

    pub fn offer(&self) -> SessionDescription {
        SessionDescription::offer(format!("offer-{}", self.sink.generation()))
    }

    pub fn answer(&self) -> SessionDescription {
        SessionDescription::answer(format!("answer-{}", self.sink.generation()))
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PairChatError> {
        self.record(PeerCall::CreateOffer);
        Ok(self.offer())
    }

    async fn create_answer(&self) -> Result<SessionDescription, PairChatError> {
        self.record(PeerCall::CreateAnswer);
        Ok(self.answer())
    }

    async fn set_local_description(&self, d: SessionDescription) -> Result<(), PairChatError> {
        self.record(PeerCall::SetLocal(d));
        Ok(())
    }

    async fn set_remote_description(&self, d: SessionDescription) -> Result<(), PairChatError> {
        self.record(PeerCall::SetRemote(d));
        Ok(())
    }

    async fn add_ice_candidate(&self, c: IceCandidate) -> Result<(), PairChatError> {
        self.record(PeerCall::AddCandidate(c.candidate));
        Ok(())
    }

    async fn add_local_media(&self, media: Arc<dyn LocalMedia>) -> Result<(), PairChatError> {
        self.record(PeerCall::AddLocalMedia(media.id().to_string()));
        Ok(())
    }

    async fn close(&self) {
        self.record(PeerCall::Close);
    }
}

#[derive(Default)]
struct MediaState {
    peers: StdMutex<Vec<Arc<MockPeer>>>,
    streams: StdMutex<Vec<Arc<MockStream>>>,
    gates: StdMutex<Vec<Option<oneshot::Sender<()>>>>,
    fail_acquire: AtomicBool,
    hold_acquire: AtomicBool,
    /// Acquisitions that started while an earlier stream was still live.
    overlapping: AtomicUsize,
}

/// Scripted media capability. Clones share state, so keep one in the test
/// and hand another to the session.
#[derive(Clone, Default)]
pub struct MockMedia {
    state: Arc<MediaState>,
}

impl MockMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every acquisition fail as if permission were denied.
    pub fn failing() -> Self {
        let media = Self::default();
        media.state.fail_acquire.store(true, Ordering::Relaxed);
        media
    }

    /// Make every acquisition wait for [`MockMedia::release`].
    pub fn held() -> Self {
        let media = Self::default();
        media.state.hold_acquire.store(true, Ordering::Relaxed);
        media
    }

    /// Hold every acquisition, then fail it once released.
    pub fn held_failing() -> Self {
        let media = Self::held();
        media.state.fail_acquire.store(true, Ordering::Relaxed);
        media
    }

    pub fn stream_count(&self) -> usize {
        self.state.streams.lock().unwrap().len()
    }

    /// How many acquisitions began before every earlier stream was stopped.
    pub fn overlapping_acquisitions(&self) -> usize {
        self.state.overlapping.load(Ordering::Relaxed)
    }

    pub fn peer_count(&self) -> usize {
        self.state.peers.lock().unwrap().len()
    }

    /// The `index`-th peer connection created, waiting for it if necessary.
    pub async fn peer(&self, index: usize) -> Arc<MockPeer> {
        poll(|| self.state.peers.lock().unwrap().get(index).cloned()).await
    }

    /// The `index`-th capture stream, waiting for it if necessary.
    pub async fn stream(&self, index: usize) -> Arc<MockStream> {
        poll(|| self.state.streams.lock().unwrap().get(index).cloned()).await
    }

    /// Let the `index`-th held acquisition complete.
    pub async fn release(&self, index: usize) {
        let gate = poll(|| {
            let mut gates = self.state.gates.lock().unwrap();
            gates.get_mut(index).and_then(Option::take)
        })
        .await;
        let _ = gate.send(());
    }

    /// Block a held acquisition until its gate is released.
    async fn hold(&self) {
        if self.state.hold_acquire.load(Ordering::Relaxed) {
            let (tx, rx) = oneshot::channel();
            self.state.gates.lock().unwrap().push(Some(tx));
            let _ = rx.await;
        }
    }
}

#[async_trait]
impl MediaCapability for MockMedia {
    async fn acquire(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, PairChatError> {
        if self.state.fail_acquire.load(Ordering::Relaxed) {
            self.hold().await;
            return Err(PairChatError::MediaAcquisition("permission denied".into()));
        }
        let stream = {
            let mut streams = self.state.streams.lock().unwrap();
            if streams.iter().any(|s| !s.is_stopped()) {
                self.state.overlapping.fetch_add(1, Ordering::Relaxed);
            }
            let stream = Arc::new(MockStream {
                id: format!("local-{}", streams.len()),
                stopped: AtomicBool::new(false),
                audio_enabled: AtomicBool::new(true),
                video_enabled: AtomicBool::new(true),
            });
            streams.push(Arc::clone(&stream));
            stream
        };
        self.hold().await;
        Ok(stream)
    }

    fn create_peer_connection(
        &self,
        _config: &PeerConfig,
        signals: PeerSignalSink,
    ) -> Result<Arc<dyn PeerConnection>, PairChatError> {
        let peer = Arc::new(MockPeer {
            calls: StdMutex::new(Vec::new()),
            sink: signals,
        });
        self.state.peers.lock().unwrap().push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Retry `check` until it yields a value.
pub async fn poll<T>(mut check: impl FnMut() -> Option<T>) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(value) = check() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition met in time")
}

/// Wait until the session's latest snapshot satisfies `pred`.
pub async fn wait_state(
    session: &Session,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    poll(|| {
        let snapshot = session.snapshot();
        pred(&snapshot).then_some(snapshot)
    })
    .await
}

// ── Event log ───────────────────────────────────────────────────────

/// Records every [`SessionEvent`] while waiting for a particular snapshot.
pub struct EventLog {
    rx: mpsc::Receiver<SessionEvent>,
    pub seen: Vec<SessionEvent>,
}

impl EventLog {
    pub fn new(rx: mpsc::Receiver<SessionEvent>) -> Self {
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Consume events until a snapshot satisfies `pred` and return it.
    pub async fn until(&mut self, pred: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
        loop {
            let event = tokio::time::timeout(WAIT, self.rx.recv())
                .await
                .expect("session event in time")
                .expect("session still running");
            self.seen.push(event.clone());
            if let SessionEvent::Snapshot(snapshot) = event {
                if pred(&snapshot) {
                    return snapshot;
                }
            }
        }
    }

    /// Consume events until an alert satisfies `pred` and return it.
    pub async fn until_alert(&mut self, pred: impl Fn(&Alert) -> bool) -> Alert {
        loop {
            let event = tokio::time::timeout(WAIT, self.rx.recv())
                .await
                .expect("session event in time")
                .expect("session still running");
            self.seen.push(event.clone());
            if let SessionEvent::Alert(alert) = event {
                if pred(&alert) {
                    return alert;
                }
            }
        }
    }

    /// Consume events until the session closes.
    pub async fn until_closed(&mut self) {
        loop {
            let event = tokio::time::timeout(WAIT, self.rx.recv())
                .await
                .expect("session event in time");
            match event {
                Some(SessionEvent::Closed) => {
                    self.seen.push(SessionEvent::Closed);
                }
                Some(other) => self.seen.push(other),
                None => return,
            }
        }
    }

    /// Alerts seen so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.seen
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Alert(alert) => Some(alert.clone()),
                _ => None,
            })
            .collect()
    }
}
