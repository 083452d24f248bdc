// ABOUTME: Context types handed to agent handlers for each invocation.
// ABOUTME: Read-only projection of the inbound invocation plus chat metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of the user who triggered an invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    /// Stable platform identifier
    pub id: String,
    /// Login handle
    pub username: String,
    /// Preferred display name, if the user set one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl UserInfo {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            display_name: None,
        }
    }

    /// Best name to address the user by
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

/// Metadata about the chat an invocation came from
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatInfo {
    /// Unique chat identifier
    pub id: String,
    /// Human-readable chat name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Usernames of current participants
    #[serde(default)]
    pub participants: Vec<String>,
}

/// One prior message from the conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    /// Username of whoever sent the message
    pub sender: String,
    /// Message text
    pub text: String,
    /// When the message was sent, if the gateway provided it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

/// Read-only context for one handler call.
///
/// Built by the dispatcher from an inbound invocation envelope and immutable
/// for the life of the call. Handlers that keep their own memory should key
/// it on `chat.id`.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Correlation id of the invocation this context belongs to
    pub invocation_id: String,
    /// The message text the handler is being asked to respond to
    pub prompt: String,
    /// Who sent the message
    pub user: UserInfo,
    /// Which chat it arrived in
    pub chat: ChatInfo,
    /// Recent conversation history, oldest first
    pub history: Vec<HistoryEntry>,
    /// When the invocation was created
    pub created_at: DateTime<Utc>,
}

impl AgentContext {
    /// Format the most recent `max_messages` history entries as prompt text.
    ///
    /// Returns an empty string when there is no history, so the result can
    /// be prepended to an LLM prompt unconditionally.
    pub fn format_history(&self, max_messages: usize) -> String {
        if self.history.is_empty() || max_messages == 0 {
            return String::new();
        }

        let skip = self.history.len().saturating_sub(max_messages);
        let mut out = String::from("Recent conversation:\n");
        for entry in self.history.iter().skip(skip) {
            out.push_str(&format!("{}: {}\n", entry.sender, entry.text));
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================
