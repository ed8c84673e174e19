//! What a running session reports to its owner.

use crate::chat::ChatEntry;
use crate::negotiation::{Generation, NegotiationContext};
use crate::peer::RemoteStream;
use crate::protocol::PeerId;
use crate::state::{LifecycleState, SessionRole};

/// Read-only view of the session, published after every observable change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub lifecycle_state: LifecycleState,
    pub role: SessionRole,
    /// Set iff the state is in-session.
    pub peer_id: Option<PeerId>,
    pub peer_present: bool,
    pub chat_log: Vec<ChatEntry>,
    pub local_media_available: bool,
    pub remote_media_available: bool,
    /// The peer is present but no media will flow this session.
    pub text_only: bool,
    pub audio_muted: bool,
    pub video_muted: bool,
    /// Whether the rendezvous connection is currently up.
    pub transport_up: bool,
    /// Last online count reported by the server.
    pub presence_count: Option<u32>,
    /// Current value of the generation counter.
    pub generation: Generation,
    /// The live negotiation context, if a peer connection exists.
    pub negotiation: Option<NegotiationContext>,
    pub remote_stream: Option<RemoteStream>,
}

/// Conditions the UI should tell the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// The rendezvous connection failed. Blocking; recover with `restart`.
    TransportFailure { reason: String },
    /// Camera/microphone unavailable; the session continues text-only.
    MediaUnavailable { reason: String },
    /// The peer disconnected. Matchmaking resumes automatically.
    PeerLeft,
    /// The peer skipped. Matchmaking resumes automatically.
    PeerSkipped,
    /// The peer sent signaling that does not fit its role; the session was
    /// abandoned.
    ProtocolViolation { detail: String },
}

/// Events delivered on the receiver returned by
/// [`Session::connect`](crate::Session::connect).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Snapshot(SessionSnapshot),
    /// Global online count.
    PresenceCount(u32),
    Alert(Alert),
    /// The session task exited. Always the last event.
    Closed,
}
