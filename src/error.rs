//! Error types for the pairchat client.

use thiserror::Error;

use crate::state::SessionRole;

/// Errors that can occur while running a chat session.
#[derive(Debug, Error)]
pub enum PairChatError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The signaling channel has stopped and no longer accepts messages.
    #[error("not connected to server")]
    NotConnected,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An offer or answer was requested by a participant whose role does not
    /// allow it, or at a point in the negotiation where it is not valid.
    #[error("{operation} is not valid for role {role}: {reason}")]
    InvalidRole {
        /// The rejected negotiation operation.
        operation: &'static str,
        /// The role held when the operation was attempted.
        role: SessionRole,
        /// Why the operation was rejected.
        reason: &'static str,
    },

    /// An out-of-order or role-mismatched signaling message.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Local capture devices are unavailable or access was denied.
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// An ICE candidate could not be parsed or was rejected by the media transport.
    #[error("malformed ICE candidate: {0}")]
    MalformedCandidate(String),

    /// The underlying peer connection rejected an operation.
    #[error("peer connection error: {0}")]
    PeerConnection(String),

    /// The session task has exited and no longer accepts commands.
    #[error("session closed")]
    SessionClosed,
}

impl PairChatError {
    /// Returns the propagation class this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransportSend(_)
            | Self::TransportReceive(_)
            | Self::TransportClosed
            | Self::NotConnected
            | Self::Timeout
            | Self::Io(_) => ErrorClass::Transport,
            Self::Serialization(_) | Self::ProtocolViolation(_) => ErrorClass::ProtocolViolation,
            Self::MediaAcquisition(_) => ErrorClass::MediaAcquisition,
            Self::MalformedCandidate(_) => ErrorClass::MalformedCandidate,
            Self::InvalidRole { .. } | Self::PeerConnection(_) => ErrorClass::Negotiation,
            Self::SessionClosed => ErrorClass::Usage,
        }
    }
}

/// Coarse grouping of [`PairChatError`] used to decide how far an error
/// propagates.
///
/// Only [`ErrorClass::Transport`] surfaces to the user. Every other class is
/// absorbed by the subsystem that produced it and degrades the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection refused or dropped. Recoverable only by an explicit restart.
    Transport,
    /// Out-of-order or role-mismatched signaling. Discarded and logged.
    ProtocolViolation,
    /// Capture device unavailable. The session continues text-only.
    MediaAcquisition,
    /// A single bad candidate. Discarded and logged.
    MalformedCandidate,
    /// Offer/answer creation or description application failed.
    Negotiation,
    /// The caller used a handle that has already shut down.
    Usage,
}

impl ErrorClass {
    /// Returns a human-readable description of this class.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Transport => "Unable to reach the matchmaking server.",
            Self::ProtocolViolation => "The server sent a message that does not fit the session.",
            Self::MediaAcquisition => "Camera or microphone is unavailable; continuing with text.",
            Self::MalformedCandidate => "A network path offered by the peer was rejected.",
            Self::Negotiation => "The media connection could not be negotiated.",
            Self::Usage => "The session has already been shut down.",
        }
    }

    /// Returns `true` if errors of this class must be shown to the user.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Transport)
    }
}

/// A specialized [`Result`] type for pairchat operations.
pub type Result<T> = std::result::Result<T, PairChatError>;

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

    #[test]
    fn only_transport_errors_are_user_visible() {
        assert!(PairChatError::TransportClosed.class().is_user_visible());
        assert!(PairChatError::NotConnected.class().is_user_visible());
        assert!(!PairChatError::MediaAcquisition("denied".into())
            .class()
            .is_user_visible());
        assert!(!PairChatError::MalformedCandidate("x".into())
            .class()
            .is_user_visible());
        assert!(!PairChatError::ProtocolViolation("x".into())
            .class()
            .is_user_visible());
    }

    #[test]
    fn invalid_role_message_names_operation_and_role() {
        let err = PairChatError::InvalidRole {
            operation: "create_offer",
            role: SessionRole::Responder,
            reason: "only the initiator may originate an offer",
        };
        let text = err.to_string();
        assert!(text.contains("create_offer"));
        assert!(text.contains("responder"));
        assert_eq!(err.class(), ErrorClass::Negotiation);
    }
}
