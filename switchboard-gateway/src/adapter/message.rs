//! Provider-neutral request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Model, Tier};

/// Role of a chat message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message sent to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

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
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A parsed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// Emitted after every successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    pub provider_id: String,
    pub model_id: String,
    pub tier: Tier,
    pub usage: Usage,
    pub at: DateTime<Utc>,
}

/// One page of a provider's model listing.
#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub models: Vec<Model>,
    /// Cursor for the next page, `None` on the last one.
    pub next_cursor: Option<String>,
}
