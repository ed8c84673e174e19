//! Wire types for the rendezvous server protocol.
//!
//! Every frame is a JSON text message tagged as
//! `{"type": "<kebab-case-name>", "data": ...}`. Session descriptions and ICE
//! candidates use the same field names as the browser
//! `RTCSessionDescriptionInit` / `RTCIceCandidateInit` dictionaries so they can
//! be relayed between native and web clients unchanged.

use serde::{Deserialize, Serialize};

use crate::error::PairChatError;

// ── Type aliases ────────────────────────────────────────────────────

/// Opaque identifier of the matched counterpart, assigned by the server.
pub type PeerId = String;

// ── Enums ───────────────────────────────────────────────────────────

/// Role assigned by the server when two participants are paired.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Originates the media offer.
    Initiator,
    /// Answers the initiator's offer.
    Responder,
}

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

// ── Structs ─────────────────────────────────────────────────────────

/// An opaque session description blob together with its offer/answer kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpType::Offer
    }
}

/// A discovered network path usable to establish the direct media connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The `candidate:` attribute line. Empty marks end-of-candidates.
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Build a candidate for the first media section.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    /// Returns `true` for the empty end-of-candidates marker.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }

    /// Check that the candidate line has the shape
    /// `candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type>`.
    ///
    /// The end-of-candidates marker is valid.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::MalformedCandidate`] describing the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PairChatError> {
        if self.is_end_of_candidates() {
            return Ok(());
        }
        let line = self.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let rest = line
            .strip_prefix("candidate:")
            .ok_or_else(|| malformed(line, "missing `candidate:` prefix"))?;

        let mut fields = rest.split_whitespace();
        let _foundation = fields
            .next()
            .ok_or_else(|| malformed(line, "missing foundation"))?;
        fields
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| malformed(line, "invalid component"))?;
        fields
            .next()
            .ok_or_else(|| malformed(line, "missing transport"))?;
        fields
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| malformed(line, "invalid priority"))?;
        fields
            .next()
            .ok_or_else(|| malformed(line, "missing address"))?;
        fields
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| malformed(line, "invalid port"))?;
        if fields.next() != Some("typ") {
            return Err(malformed(line, "missing `typ` keyword"));
        }
        fields
            .next()
            .ok_or_else(|| malformed(line, "missing candidate type"))?;
        Ok(())
    }
}

fn malformed(line: &str, what: &str) -> PairChatError {
    PairChatError::MalformedCandidate(format!("{what} in {line:?}"))
}

/// Matchmaking preferences sent with `announce-ready`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserPreferences {
    #[serde(default)]
    pub interests: Vec<String>,
}

impl UserPreferences {
    /// Parse a free-text, comma-separated interest list such as
    /// `"music, sports,  coding"`.
    ///
    /// Entries are trimmed, empty entries are dropped and duplicates
    /// (case-insensitive) keep their first occurrence.
    pub fn from_interest_list(list: &str) -> Self {
        let mut interests: Vec<String> = Vec::new();
        for raw in list.split(',') {
            let interest = raw.trim();
            if interest.is_empty() {
                continue;
            }
            if interests.iter().any(|i| i.eq_ignore_ascii_case(interest)) {
                continue;
            }
            interests.push(interest.to_string());
        }
        Self { interests }
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Ask to be matched with a stranger.
    AnnounceReady { preferences: UserPreferences },
    /// Abandon the current session and the queue entirely.
    Leave,
    /// Abandon the current peer and re-queue.
    Skip,
    /// Forward a local offer or answer to the peer.
    Description { sdp: SessionDescription },
    /// Forward a local ICE candidate to the peer.
    Candidate { candidate: IceCandidate },
    /// Forward chat text to the peer.
    ChatSend { text: String },
}

/// Message types sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Global online count, for display only.
    PresenceCount(u32),
    /// Pairing established.
    Matched {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        role: Role,
    },
    /// The counterpart's offer or answer.
    Description { sdp: SessionDescription },
    /// The counterpart's ICE candidate.
    Candidate { candidate: IceCandidate },
    /// The counterpart disconnected or left.
    RemoteLeft,
    /// The counterpart skipped.
    Skipped,
    /// The counterpart's chat text.
    ChatReceive { text: String },
}

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

    const HOST_CANDIDATE: &str =
        "candidate:842163049 1 udp 1677729535 192.0.2.10 46154 typ srflx raddr 10.0.0.2 rport 46154";

    #[test]
    fn valid_candidate_passes() {
        IceCandidate::new(HOST_CANDIDATE).validate().unwrap();
        IceCandidate::new(format!("a={HOST_CANDIDATE}"))
            .validate()
            .unwrap();
    }

    #[test]
    fn end_of_candidates_is_valid() {
        let c = IceCandidate::new("");
        assert!(c.is_end_of_candidates());
        c.validate().unwrap();
    }

    #[test]
    fn malformed_candidates_are_rejected() {
        for bad in [
            "hello",
            "candidate:",
            "candidate:1 x udp 1 1.2.3.4 5 typ host",
            "candidate:1 1 udp notanumber 1.2.3.4 5 typ host",
            "candidate:1 1 udp 1 1.2.3.4 70000 typ host",
            "candidate:1 1 udp 1 1.2.3.4 5 type host",
            "candidate:1 1 udp 1 1.2.3.4 5 typ",
        ] {
            let err = IceCandidate::new(bad).validate().unwrap_err();
            assert!(
                matches!(err, PairChatError::MalformedCandidate(_)),
                "{bad:?} should be malformed, got {err:?}"
            );
        }
    }

    #[test]
    fn interest_list_is_trimmed_and_deduplicated() {
        let prefs = UserPreferences::from_interest_list(" music, Sports,,music , MUSIC ,coding ");
        assert_eq!(prefs.interests, vec!["music", "Sports", "coding"]);
        assert!(UserPreferences::from_interest_list(" , ,").interests.is_empty());
    }

    #[test]
    fn description_uses_browser_field_names() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "offer", "sdp": "v=0" }));
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let json = serde_json::to_value(IceCandidate::new("candidate:1")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0 })
        );
    }
}
