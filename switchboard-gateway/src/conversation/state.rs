//! Conversation records and the binding state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::{ChatMessage, Usage};
use crate::types::ModelTarget;
use crate::{Error, Result};

/// Lifecycle of a conversation.
///
/// `Unbound -> Bound -> Closed`, or `Unbound -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Unbound,
    Bound,
    Closed,
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationState::Unbound => write!(f, "unbound"),
            ConversationState::Bound => write!(f, "bound"),
            ConversationState::Closed => write!(f, "closed"),
        }
    }
}

/// Who a transcript entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    /// A failed exchange; content is the error text.
    Error,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Model that answered, for assistant entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Requested model when a fallback answered instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substituted_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Error, content)
    }

    pub fn assistant(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::new(MessageRole::Assistant, content)
        }
    }

    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            model: None,
            substituted_from: None,
            usage: None,
        }
    }

    /// The wire form, or `None` for entries the provider never sees.
    fn to_chat(&self) -> Option<ChatMessage> {
        match self.role {
            MessageRole::User => Some(ChatMessage::user(&self.content)),
            MessageRole::Assistant => Some(ChatMessage::assistant(&self.content)),
            MessageRole::Error => None,
        }
    }
}

/// A conversation and its transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Model picked at creation, used when a send names none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ModelTarget>,
    /// Set once, by the first committed exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound: Option<ModelTarget>,
    pub state: ConversationState,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, target: Option<ModelTarget>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            target,
            bound: None,
            state: ConversationState::Unbound,
            messages: Vec::new(),
        }
    }

    pub fn bound_provider_id(&self) -> Option<&str> {
        self.bound.as_ref().map(|t| t.provider_id.as_str())
    }

    pub fn bound_model_id(&self) -> Option<&str> {
        self.bound.as_ref().map(|t| t.model_id.as_str())
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConversationState::Closed
    }

    /// Whether this conversation is bound to, or was started for, `provider_id`.
    pub fn involves_provider(&self, provider_id: &str) -> bool {
        self.bound
            .as_ref()
            .or(self.target.as_ref())
            .is_some_and(|t| t.provider_id == provider_id)
    }

    /// Pick the model for the next send and check it against the binding.
    ///
    /// # Errors
    ///
    /// `ConversationClosed`, `ConversationBindingViolation`, or
    /// `MissingTarget` when nothing names a model.
    pub fn resolve_target(&self, requested: Option<&ModelTarget>) -> Result<ModelTarget> {
        if self.is_closed() {
            return Err(Error::ConversationClosed(self.id.clone()));
        }
        match (&self.bound, requested) {
            (Some(bound), Some(requested)) if bound != requested => {
                Err(Error::ConversationBindingViolation {
                    conversation_id: self.id.clone(),
                    bound: bound.clone(),
                    requested: requested.clone(),
                })
            }
            (Some(bound), _) => Ok(bound.clone()),
            (None, Some(requested)) => Ok(requested.clone()),
            (None, None) => self
                .target
                .clone()
                .ok_or_else(|| Error::MissingTarget(self.id.clone())),
        }
    }

    /// Provider-facing history plus a new user turn.
    pub fn history_with(&self, content: &str) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .filter_map(Message::to_chat)
            .chain(std::iter::once(ChatMessage::user(content)))
            .collect()
    }

    /// Append one whole exchange and bind if this is the first.
    pub(crate) fn commit(&mut self, target: &ModelTarget, user: Message, reply: Message) {
        if self.bound.is_none() {
            self.bound = Some(target.clone());
            self.state = ConversationState::Bound;
        }
        self.messages.push(user);
        self.messages.push(reply);
    }

    pub(crate) fn close(&mut self) {
        self.state = ConversationState::Closed;
    }
}
