//! Conversation turn types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::language::estimate_tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn in a session's ordered history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub ts: DateTime<Utc>,
    pub token_count: usize,
    /// Set when barge-in cut the assistant off; `content` then holds only
    /// the words that were actually spoken.
    pub truncated: bool,
}

impl ConversationTurn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            role,
            token_count: estimate_tokens(&content),
            content,
            ts: Utc::now(),
            truncated: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    /// Replace the content with the spoken prefix and mark the turn cut.
    pub fn truncate_to_spoken(&mut self, spoken: impl Into<String>) {
        self.content = spoken.into();
        self.token_count = estimate_tokens(&self.content);
        self.truncated = true;
    }
}
