//! Transport Channel: one logical connection to the rendezvous server.
//!
//! [`SignalingChannel`] is a thin handle to a background task that owns the
//! [`Transport`]. On construction the task immediately calls the
//! [`Connector`]; outbound operations are queued on an unbounded channel and
//! written in order once the connection is up. Inbound frames are decoded into
//! [`ChannelEvent`]s and delivered on a bounded channel, awaiting capacity
//! rather than dropping, since every signaling event matters to the session.
//!
//! The channel never reconnects by itself. A failed connection, a receive or
//! send error, or a server-side close all end the task with
//! [`ChannelEvent::ConnectError`]; the session decides what happens next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{PairChatError, Result};
use crate::protocol::{
    ClientMessage, IceCandidate, PeerId, Role, ServerMessage, SessionDescription, UserPreferences,
};
use crate::transport::{Connector, Transport};

/// Capacity of the inbound event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ── Events ──────────────────────────────────────────────────────────

/// Events delivered by the Transport Channel to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The connection is up.
    Connected,
    /// The connection could not be established or was lost.
    ConnectError { reason: String },
    PresenceCount(u32),
    Matched { peer_id: PeerId, role: Role },
    RemoteDescription(SessionDescription),
    RemoteCandidate(IceCandidate),
    RemoteLeft,
    RemoteSkipped,
    ChatReceived(String),
    /// The channel was shut down locally. Always the last event.
    Disconnected,
}

impl From<ServerMessage> for ChannelEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::PresenceCount(n) => Self::PresenceCount(n),
            ServerMessage::Matched { peer_id, role } => Self::Matched { peer_id, role },
            ServerMessage::Description { sdp } => Self::RemoteDescription(sdp),
            ServerMessage::Candidate { candidate } => Self::RemoteCandidate(candidate),
            ServerMessage::RemoteLeft => Self::RemoteLeft,
            ServerMessage::Skipped => Self::RemoteSkipped,
            ServerMessage::ChatReceive { text } => Self::ChatReceived(text),
        }
    }
}

// ── Channel handle ──────────────────────────────────────────────────

/// Handle to the rendezvous connection task.
///
/// Every outbound operation is fire-and-forget: it returns once the message
/// is queued. Nothing is retried across a reconnect.
pub struct SignalingChannel {
    cmd_tx: mpsc::UnboundedSender<ClientMessage>,
    /// Set once the task has exited.
    closed: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl SignalingChannel {
    /// Spawn the channel task and start connecting.
    ///
    /// The first event is either [`ChannelEvent::Connected`] or
    /// [`ChannelEvent::ConnectError`].
    #[must_use = "the event receiver must be used to receive events"]
    pub fn connect(
        connector: Arc<dyn Connector>,
        shutdown_timeout: Duration,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(channel_loop(
            connector,
            cmd_rx,
            event_tx,
            Arc::clone(&closed),
            shutdown_rx,
        ));

        let channel = Self {
            cmd_tx,
            closed,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        };
        (channel, event_rx)
    }

    // ── Outbound operations ─────────────────────────────────────────

    /// Ask the server for a match.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::NotConnected`] if the channel has stopped.
    pub fn announce_ready(&self, preferences: UserPreferences) -> Result<()> {
        self.send(ClientMessage::AnnounceReady { preferences })
    }

    /// Forward a local offer or answer.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::NotConnected`] if the channel has stopped.
    pub fn send_description(&self, sdp: SessionDescription) -> Result<()> {
        self.send(ClientMessage::Description { sdp })
    }

    /// Forward a local ICE candidate.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::NotConnected`] if the channel has stopped.
    pub fn send_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.send(ClientMessage::Candidate { candidate })
    }

    /// Forward chat text.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::NotConnected`] if the channel has stopped.
    pub fn send_chat(&self, text: String) -> Result<()> {
        self.send(ClientMessage::ChatSend { text })
    }

    /// Abandon the session and the queue.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::NotConnected`] if the channel has stopped.
    pub fn send_leave(&self) -> Result<()> {
        self.send(ClientMessage::Leave)
    }

    /// Abandon the current peer.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::NotConnected`] if the channel has stopped.
    pub fn send_skip(&self) -> Result<()> {
        self.send(ClientMessage::Skip)
    }

    /// Returns `true` until the channel task exits.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Flush a best-effort `leave`, close the transport and stop the task.
    ///
    /// Waits up to the shutdown timeout, then aborts the task.
    pub async fn shutdown(&mut self) {
        debug!("SignalingChannel: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => warn!("channel task terminated with join error: {join_err}"),
                Err(_) => {
                    warn!("channel task did not exit within timeout; aborting");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("channel task aborted: {join_err}");
                    }
                }
            }
        }

        self.closed.store(true, Ordering::Release);
    }

    fn send(&self, msg: ClientMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PairChatError::NotConnected);
        }
        self.cmd_tx
            .send(msg)
            .map_err(|_| PairChatError::NotConnected)
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("open", &self.is_open())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        // No executor to drive a graceful close from here.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Channel loop ────────────────────────────────────────────────────

/// Connect, then multiplex outbound commands, shutdown and inbound frames.
async fn channel_loop(
    connector: Arc<dyn Connector>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientMessage>,
    event_tx: mpsc::Sender<ChannelEvent>,
    closed: Arc<AtomicBool>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("channel task started");

    let mut transport = tokio::select! {
        result = connector.connect() => match result {
            Ok(transport) => transport,
            Err(e) => {
                error!("failed to connect to rendezvous server: {e}");
                closed.store(true, Ordering::Release);
                emit(&event_tx, ChannelEvent::ConnectError { reason: e.to_string() }).await;
                return;
            }
        },
        _ = &mut shutdown_rx => {
            debug!("shutdown requested before connection completed");
            closed.store(true, Ordering::Release);
            emit(&event_tx, ChannelEvent::Disconnected).await;
            return;
        }
    };

    info!("rendezvous channel connected");
    emit(&event_tx, ChannelEvent::Connected).await;

    let failure = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(msg) => {
                        if let Err(e) = write(&mut transport, &msg).await {
                            error!("transport send error: {e}");
                            break Some(format!("transport send error: {e}"));
                        }
                    }
                    // Handle dropped.
                    None => {
                        debug!("command channel closed, shutting down channel task");
                        close_gracefully(&mut transport).await;
                        break None;
                    }
                }
            }

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                // Deliver anything already queued before saying goodbye.
                while let Ok(msg) = cmd_rx.try_recv() {
                    if write(&mut transport, &msg).await.is_err() {
                        break;
                    }
                }
                close_gracefully(&mut transport).await;
                break None;
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => emit(&event_tx, ChannelEvent::from(msg)).await,
                        Err(e) => warn!("failed to decode server message: {e}; raw: {text}"),
                    },
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        break Some(format!("transport receive error: {e}"));
                    }
                    None => {
                        debug!("transport closed by server");
                        break Some("connection closed by server".to_string());
                    }
                }
            }
        }
    };

    closed.store(true, Ordering::Release);
    let last = match failure {
        Some(reason) => ChannelEvent::ConnectError { reason },
        None => ChannelEvent::Disconnected,
    };
    emit(&event_tx, last).await;
    debug!("channel task exited");
}

async fn write(transport: &mut impl Transport, msg: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    debug!(len = json.len(), "sending client message");
    transport.send(json).await
}

/// Best-effort `leave`, then close.
async fn close_gracefully(transport: &mut impl Transport) {
    if let Err(e) = write(transport, &ClientMessage::Leave).await {
        debug!("leave notification not delivered: {e}");
    }
    if let Err(e) = transport.close().await {
        debug!("transport close failed: {e}");
    }
}

async fn emit(event_tx: &mpsc::Sender<ChannelEvent>, event: ChannelEvent) {
    if event_tx.send(event).await.is_err() {
        debug!("channel event receiver dropped");
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
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    // ── Mock transport ──────────────────────────────────────────────

    /// Replays scripted frames and records everything sent.
    struct MockTransport {
        incoming: VecDeque<Option<std::result::Result<String, PairChatError>>>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, message: String) -> std::result::Result<(), PairChatError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, PairChatError>> {
            match self.incoming.pop_front() {
                Some(item) => item,
                // Script exhausted: stay connected until shutdown.
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> std::result::Result<(), PairChatError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Hands out one scripted transport, then refuses.
    struct MockConnector {
        transport: StdMutex<Option<MockTransport>>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> std::result::Result<Box<dyn Transport>, PairChatError> {
            match self.transport.lock().unwrap().take() {
                Some(t) => Ok(Box::new(t)),
                None => Err(PairChatError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                ))),
            }
        }
    }

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self) -> std::result::Result<Box<dyn Transport>, PairChatError> {
            Err(PairChatError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))
        }
    }

    fn start(
        incoming: Vec<Option<std::result::Result<String, PairChatError>>>,
    ) -> (
        SignalingChannel,
        mpsc::Receiver<ChannelEvent>,
        Arc<StdMutex<Vec<String>>>,
        Arc<AtomicBool>,
    ) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = MockTransport {
            incoming: VecDeque::from(incoming),
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        let connector = Arc::new(MockConnector {
            transport: StdMutex::new(Some(transport)),
        });
        let (channel, events) = SignalingChannel::connect(connector, Duration::from_secs(1));
        (channel, events, sent, closed)
    }

    fn frame(msg: &ServerMessage) -> Option<std::result::Result<String, PairChatError>> {
        Some(Ok(serde_json::to_string(msg).unwrap()))
    }

    fn sent_messages(sent: &StdMutex<Vec<String>>) -> Vec<ClientMessage> {
        sent.lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn connected_is_first_event_then_server_messages_in_order() {
        let (mut channel, mut events, _sent, _closed) = start(vec![
            frame(&ServerMessage::PresenceCount(12)),
            frame(&ServerMessage::Matched {
                peer_id: "p2".into(),
                role: Role::Initiator,
            }),
            frame(&ServerMessage::ChatReceive { text: "hi".into() }),
        ]);

        assert_eq!(events.recv().await.unwrap(), ChannelEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), ChannelEvent::PresenceCount(12));
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::Matched {
                peer_id: "p2".into(),
                role: Role::Initiator
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::ChatReceived("hi".into())
        );

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn refused_connection_emits_connect_error() {
        let (channel, mut events) =
            SignalingChannel::connect(Arc::new(Refusing), Duration::from_secs(1));

        let event = events.recv().await.unwrap();
        let ChannelEvent::ConnectError { reason } = event else {
            panic!("expected ConnectError");
        };
        assert!(reason.contains("refused"));
        assert!(events.recv().await.is_none());
        assert!(!channel.is_open());
        assert!(matches!(
            channel.send_skip(),
            Err(PairChatError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn commands_issued_before_connect_are_delivered_in_order() {
        let (mut channel, mut events, sent, _closed) = start(vec![]);

        channel
            .announce_ready(UserPreferences::from_interest_list("music"))
            .unwrap();
        channel.send_chat("hello".into()).unwrap();
        channel.send_skip().unwrap();

        assert_eq!(events.recv().await.unwrap(), ChannelEvent::Connected);
        channel.shutdown().await;

        let messages = sent_messages(&sent);
        assert!(matches!(messages[0], ClientMessage::AnnounceReady { .. }));
        assert_eq!(
            messages[1],
            ClientMessage::ChatSend {
                text: "hello".into()
            }
        );
        assert_eq!(messages[2], ClientMessage::Skip);
    }

    #[tokio::test]
    async fn shutdown_flushes_leave_and_closes() {
        let (mut channel, mut events, sent, closed) = start(vec![]);
        assert_eq!(events.recv().await.unwrap(), ChannelEvent::Connected);

        channel.shutdown().await;

        assert_eq!(sent_messages(&sent).last(), Some(&ClientMessage::Leave));
        assert!(closed.load(Ordering::Relaxed));
        assert_eq!(events.recv().await.unwrap(), ChannelEvent::Disconnected);
        assert!(matches!(
            channel.send_leave(),
            Err(PairChatError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn server_close_emits_connect_error() {
        let (_channel, mut events, _sent, _closed) = start(vec![None]);

        assert_eq!(events.recv().await.unwrap(), ChannelEvent::Connected);
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::ConnectError { .. }
        ));
    }

    #[tokio::test]
    async fn receive_error_emits_connect_error_with_reason() {
        let (_channel, mut events, _sent, _closed) = start(vec![Some(Err(
            PairChatError::TransportReceive("reset by peer".into()),
        ))]);

        assert_eq!(events.recv().await.unwrap(), ChannelEvent::Connected);
        let ChannelEvent::ConnectError { reason } = events.recv().await.unwrap() else {
            panic!("expected ConnectError");
        };
        assert!(reason.contains("reset by peer"));
    }

    #[tokio::test]
    async fn undecodable_frames_are_skipped() {
        let (mut channel, mut events, _sent, _closed) = start(vec![
            Some(Ok("{not json".into())),
            Some(Ok(r#"{"type":"unknown-thing"}"#.into())),
            frame(&ServerMessage::RemoteLeft),
        ]);

        assert_eq!(events.recv().await.unwrap(), ChannelEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), ChannelEvent::RemoteLeft);

        channel.shutdown().await;
    }

    #[test]
    fn server_messages_map_to_channel_events() {
        assert_eq!(
            ChannelEvent::from(ServerMessage::Skipped),
            ChannelEvent::RemoteSkipped
        );
        assert_eq!(
            ChannelEvent::from(ServerMessage::Description {
                sdp: SessionDescription::answer("a")
            }),
            ChannelEvent::RemoteDescription(SessionDescription::answer("a"))
        );
    }
}
