//! # PairChat Client
//!
//! Client-side session engine for anonymous one-to-one video/text chat
//! ("talk to a stranger").
//!
//! A [`Session`] connects to a rendezvous server, queues for a match, drives
//! the offer/answer/ICE exchange for the peer media connection, relays chat,
//! and recovers from skips, departures and transport failures.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any backend
//! - **Media-agnostic**: plug a platform WebRTC stack in through [`MediaCapability`],
//!   or run text-only with [`NullMediaCapability`]
//! - **WebSocket built-in**: the default `transport-websocket` feature provides
//!   [`WebSocketConnector`]
//! - **Event-driven**: receive [`SessionEvent`]s via a channel
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pairchat_client::{NullMediaCapability, Session, SessionConfig, SessionEvent, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("ws://localhost:3000/ws");
//! let (session, mut events) =
//!     Session::connect(connector, NullMediaCapability, SessionConfig::new());
//! session.start()?;
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Closed = event {
//!         break;
//!     }
//! }
//! ```

pub mod channel;
pub mod chat;
pub mod error;
pub mod event;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod presentation;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use chat::{ChatEntry, ChatOrigin};
pub use error::{ErrorClass, PairChatError};
pub use event::{Alert, SessionEvent, SessionSnapshot};
pub use media::{LocalMedia, MediaCapability, MediaConstraints, NullMediaCapability};
pub use negotiation::{Generation, NegotiationContext};
pub use peer::{PeerConfig, PeerConnection, PeerSignal, PeerSignalSink, RemoteStream};
pub use presentation::ViewState;
pub use protocol::{ClientMessage, IceCandidate, Role, ServerMessage, SessionDescription, UserPreferences};
pub use session::{Session, SessionConfig};
pub use state::{LifecycleState, SessionRole};
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
