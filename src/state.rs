//! Lifecycle and role enums shared by the session state machine and its
//! observers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::Role;

/// Where a session currently sits in its lifecycle.
///
/// `Matched`, `Negotiating` and `Connected` are collectively "in-session".
/// `Error` is terminal until an explicit restart re-enters `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Connected (or connecting) to the server but not queued for a match.
    #[default]
    Idle,
    /// Readiness announced; waiting for the server to pair us.
    Waiting,
    /// Paired with a peer; negotiation has not produced a description yet.
    Matched,
    /// Offer/answer exchange in progress.
    Negotiating,
    /// Remote media observed, or a text-only session is up.
    Connected,
    /// Unrecoverable transport failure.
    Error,
}

impl LifecycleState {
    /// Returns `true` for `Matched`, `Negotiating` and `Connected`.
    pub fn is_in_session(self) -> bool {
        matches!(self, Self::Matched | Self::Negotiating | Self::Connected)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Matched => "matched",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// The role held in the current session.
///
/// Assigned once per session by the server at match time. Unassigned outside
/// of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    #[default]
    Unassigned,
    /// Originates the media offer.
    Initiator,
    /// Answers the initiator's offer.
    Responder,
}

impl From<Role> for SessionRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Initiator => Self::Initiator,
            Role::Responder => Self::Responder,
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unassigned => "unassigned",
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        };
        f.write_str(name)
    }
}
