//! Presentation adapter: turns a [`SessionSnapshot`] into what a chat screen
//! renders. Contains no state of its own.

use crate::chat::{ChatEntry, ChatOrigin};
use crate::event::SessionSnapshot;
use crate::peer::RemoteStream;
use crate::state::LifecycleState;

/// One video tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSlot {
    /// Render the stream. `stream` is `None` for the local preview, which the
    /// platform renders from its own capture handle.
    Live {
        label: &'static str,
        stream: Option<RemoteStream>,
    },
    Placeholder {
        label: &'static str,
        detail: Option<&'static str>,
    },
}

impl VideoSlot {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }
}

/// Which side of the conversation a bubble sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Own,
    Stranger,
    Notice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBubble {
    pub text: String,
    pub alignment: Alignment,
}

impl From<&ChatEntry> for MessageBubble {
    fn from(entry: &ChatEntry) -> Self {
        let alignment = match entry.origin {
            ChatOrigin::Local => Alignment::Own,
            ChatOrigin::Remote => Alignment::Stranger,
            ChatOrigin::System => Alignment::Notice,
        };
        Self {
            text: entry.text.clone(),
            alignment,
        }
    }
}

/// The single action offered while the connection is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Call [`Session::restart`](crate::Session::restart).
    ReturnToMatchmaking,
}

/// Modal shown on transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingNotice {
    pub message: &'static str,
    pub action: RecoveryAction,
    pub action_label: &'static str,
}

/// Everything the chat screen needs for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewState {
    pub status: &'static str,
    /// Show the "looking for someone" spinner.
    pub searching: bool,
    pub remote_video: VideoSlot,
    pub local_video: VideoSlot,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub messages: Vec<MessageBubble>,
    /// Whether the message input accepts text.
    pub chat_enabled: bool,
    pub online_count: Option<u32>,
    pub blocking_notice: Option<BlockingNotice>,
}

impl From<&SessionSnapshot> for ViewState {
    fn from(snapshot: &SessionSnapshot) -> Self {
        let state = snapshot.lifecycle_state;
        let unavailable = snapshot.text_only.then_some("WebRTC not available");

        let remote_video = if snapshot.remote_media_available {
            VideoSlot::Live {
                label: "Stranger",
                stream: snapshot.remote_stream.clone(),
            }
        } else {
            VideoSlot::Placeholder {
                label: "Stranger's Video",
                detail: unavailable,
            }
        };

        let local_video = if snapshot.local_media_available {
            VideoSlot::Live {
                label: "You",
                stream: None,
            }
        } else {
            VideoSlot::Placeholder {
                label: "Your Video",
                detail: None,
            }
        };

        let blocking_notice = (state == LifecycleState::Error).then_some(BlockingNotice {
            message: "Lost connection to the chat server.",
            action: RecoveryAction::ReturnToMatchmaking,
            action_label: "Back to matchmaking",
        });

        Self {
            status: status_line(state),
            searching: state == LifecycleState::Waiting,
            remote_video,
            local_video,
            audio_muted: snapshot.audio_muted,
            video_muted: snapshot.video_muted,
            messages: snapshot.chat_log.iter().map(MessageBubble::from).collect(),
            chat_enabled: snapshot.peer_present,
            online_count: snapshot.presence_count,
            blocking_notice,
        }
    }
}

fn status_line(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Idle => "Ready to meet someone new",
        LifecycleState::Waiting => "Looking for a stranger...",
        LifecycleState::Matched | LifecycleState::Negotiating => "Connecting...",
        LifecycleState::Connected => "Connected",
        LifecycleState::Error => "Disconnected",
    }
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

    fn snapshot(state: LifecycleState) -> SessionSnapshot {
        SessionSnapshot {
            lifecycle_state: state,
            ..SessionSnapshot::default()
        }
    }

    #[test]
    fn waiting_shows_spinner_and_placeholders() {
        let view = ViewState::from(&snapshot(LifecycleState::Waiting));
        assert!(view.searching);
        assert!(!view.chat_enabled);
        assert!(!view.remote_video.is_live());
        assert!(!view.local_video.is_live());
        assert!(view.blocking_notice.is_none());
    }

    #[test]
    fn connected_with_media_renders_live_tiles() {
        let mut s = snapshot(LifecycleState::Connected);
        s.peer_present = true;
        s.local_media_available = true;
        s.remote_media_available = true;
        s.remote_stream = Some(RemoteStream { id: "r1".into() });
        s.video_muted = true;

        let view = ViewState::from(&s);
        assert!(!view.searching);
        assert!(view.chat_enabled);
        assert!(view.video_muted);
        assert_eq!(
            view.remote_video,
            VideoSlot::Live {
                label: "Stranger",
                stream: Some(RemoteStream { id: "r1".into() })
            }
        );
        assert!(view.local_video.is_live());
    }

    #[test]
    fn text_only_session_explains_missing_video() {
        let mut s = snapshot(LifecycleState::Connected);
        s.peer_present = true;
        s.text_only = true;
        s.chat_log = vec![
            ChatEntry {
                text: "Stranger connected! (video unavailable)".into(),
                origin: ChatOrigin::System,
            },
            ChatEntry {
                text: "hey".into(),
                origin: ChatOrigin::Remote,
            },
            ChatEntry {
                text: "hi!".into(),
                origin: ChatOrigin::Local,
            },
        ];

        let view = ViewState::from(&s);
        assert_eq!(
            view.remote_video,
            VideoSlot::Placeholder {
                label: "Stranger's Video",
                detail: Some("WebRTC not available")
            }
        );
        let alignments: Vec<Alignment> = view.messages.iter().map(|m| m.alignment).collect();
        assert_eq!(
            alignments,
            vec![Alignment::Notice, Alignment::Stranger, Alignment::Own]
        );
    }

    #[test]
    fn error_state_blocks_with_single_recovery_action() {
        let mut s = snapshot(LifecycleState::Error);
        s.presence_count = Some(42);
        let view = ViewState::from(&s);
        let notice = view.blocking_notice.unwrap();
        assert_eq!(notice.action, RecoveryAction::ReturnToMatchmaking);
        assert_eq!(view.status, "Disconnected");
        assert_eq!(view.online_count, Some(42));
    }
}
