//! Chat Relay log: the text exchanged with the current peer.
//!
//! The log is scoped to one session. It is cleared whenever the session ends
//! (skip, leave, remote disconnect), so nothing said to one stranger is ever
//! shown alongside the next.

use serde::{Deserialize, Serialize};

/// Who produced a chat entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatOrigin {
    /// Typed by the local user (optimistically echoed).
    Local,
    /// Received from the peer.
    Remote,
    /// Generated by the client, e.g. the text-only "peer present" notice.
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub text: String,
    pub origin: ChatOrigin,
}

/// Ordered, append-only log of one session's messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
    epoch: u64,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, origin: ChatOrigin, text: impl Into<String>) {
        self.entries.push(ChatEntry {
            text: text.into(),
            origin,
        });
    }

    /// Drop every entry and start a new epoch.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Number of times the log has been restarted.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in the order they were appended.
    pub fn iter(&self) -> impl Iterator<Item = &ChatEntry> + '_ {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }
}

impl<'a> IntoIterator for &'a ChatLog {
    type Item = &'a ChatEntry;
    type IntoIter = std::slice::Iter<'a, ChatEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Normalise outgoing chat text. Returns `None` for blank input.
pub(crate) fn outgoing_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
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

    #[test]
    fn entries_keep_append_order() {
        let mut log = ChatLog::new();
        log.push(ChatOrigin::Local, "hi");
        log.push(ChatOrigin::Remote, "hello");
        log.push(ChatOrigin::Local, "how are you");

        let texts: Vec<&str> = log.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["hi", "hello", "how are you"]);
        assert_eq!(log.entries()[1].origin, ChatOrigin::Remote);
    }

    #[test]
    fn clear_restarts_the_log() {
        let mut log = ChatLog::new();
        log.push(ChatOrigin::Remote, "bye");
        assert_eq!(log.epoch(), 0);

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.epoch(), 1);
        assert_eq!((&log).into_iter().count(), 0);
    }

    #[test]
    fn blank_outgoing_text_is_dropped() {
        assert_eq!(outgoing_text("   "), None);
        assert_eq!(outgoing_text(" hey "), Some("hey".to_string()));
    }
}
