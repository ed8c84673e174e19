//! The seam between the Negotiation Engine and the platform's peer media
//! connection.
//!
//! A [`PeerConnection`] is created per session by a
//! [`MediaCapability`](crate::media::MediaCapability) and shared (via `Arc`)
//! with the short-lived tasks that run its asynchronous operations. Its
//! callbacks flow back through a [`PeerSignalSink`], which stamps every signal
//! with the [`Generation`] of the session that created the connection, so a
//! connection that outlives its session can never touch the next one.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::LocalMedia;
use crate::negotiation::{EngineOutput, Generation, Tagged};
use crate::protocol::{IceCandidate, SessionDescription};

/// Public STUN servers used when no other ICE servers are configured.
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Parameters for constructing a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// STUN/TURN server URLs.
    pub ice_servers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PeerConfig {
    /// Replace the ICE server list.
    #[must_use]
    pub fn with_ice_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ice_servers = servers.into_iter().map(Into::into).collect();
        self
    }
}

/// Opaque handle to the remote participant's media, handed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
}

/// A single underlying peer-to-peer media connection.
///
/// All methods take `&self`; implementations use interior mutability the way
/// native WebRTC bindings do.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// # Errors
    ///
    /// Implementations return
    /// [`PairChatError::MalformedCandidate`](crate::PairChatError::MalformedCandidate)
    /// when the media transport rejects the candidate.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach the local capture tracks.
    async fn add_local_media(&self, media: Arc<dyn LocalMedia>) -> Result<()>;

    /// Stop all transceivers and release the connection.
    async fn close(&self);
}

/// Callbacks raised by a [`PeerConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSignal {
    /// A local ICE candidate was gathered.
    LocalCandidate(IceCandidate),
    /// The first remote media track arrived.
    RemoteStreamReady(RemoteStream),
    /// The connection wants a (re)negotiation.
    NegotiationNeeded,
}

/// Delivers [`PeerSignal`]s from a peer connection onto the session queue.
///
/// Cheap to clone. Signals emitted after the session owning this sink has been
/// torn down are discarded by the session.
#[derive(Debug, Clone)]
pub struct PeerSignalSink {
    generation: Generation,
    tx: mpsc::UnboundedSender<Tagged>,
}

impl PeerSignalSink {
    pub(crate) fn new(generation: Generation, tx: mpsc::UnboundedSender<Tagged>) -> Self {
        Self { generation, tx }
    }

    /// The generation of the session this sink belongs to.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Post a signal. Returns `false` once the session has shut down.
    pub fn emit(&self, signal: PeerSignal) -> bool {
        self.tx
            .send(Tagged {
                generation: self.generation,
                output: EngineOutput::Peer(signal),
            })
            .is_ok()
    }
}
