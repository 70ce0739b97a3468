//! Conversation records and the backup document format

use serde::{Deserialize, Serialize};

/// Store-assigned conversation key
pub type ConversationId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    #[cfg(test)]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A persisted conversation.
///
/// `created_at` is milliseconds since the Unix epoch and only drives ordering.
/// `revision` is the optimistic concurrency counter checked by the store on
/// every overwrite; it never leaves the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,

    #[serde(alias = "timestamp")]
    pub created_at: i64,

    #[serde(default)]
    pub messages: Vec<Message>,

    #[serde(skip)]
    pub revision: i64,
}

impl Conversation {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Sidebar text: the first user message, cut to `max_chars` characters.
    pub fn preview(&self, max_chars: usize) -> String {
        let Some(first) = self.messages.iter().find(|m| m.role == Role::User) else {
            return EMPTY_PREVIEW.to_string();
        };

        let mut chars = first.content.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{}...", head)
        } else {
            head
        }
    }
}

/// Shown for conversations that hold messages but none from the user
pub const EMPTY_PREVIEW: &str = "Empty conversation";

/// Full backup document, as written by export and read by restore
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub conversations: Vec<Conversation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Backup {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[cfg(test)]
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
