//! Error types for the provider gateway.
//!
//! Every variant carries the provider or conversation it concerns so the CLI
//! can render a precise message. No variant ever carries a credential value.

use std::fmt;

use thiserror::Error;

use crate::adapter::TransportError;
use crate::catalog::PartialCatalog;
use crate::registry::ResponseShape;
use crate::types::{ModelTarget, Tier};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Where a quota limit was enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaSource {
    /// Counted by the local quota tracker.
    Local,
    /// The provider answered HTTP 429.
    Remote,
}

impl fmt::Display for QuotaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaSource::Local => write!(f, "local"),
            QuotaSource::Remote => write!(f, "remote"),
        }
    }
}

/// Errors that can occur inside the gateway.
#[derive(Debug, Error)]
pub enum Error {
    /// A provider configuration record failed validation.
    #[error("invalid provider config{}: {field}: {reason}", provider_suffix(.provider_id))]
    InvalidConfig {
        provider_id: Option<String>,
        field: &'static str,
        reason: String,
    },

    /// Provider not found in registry.
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// No secret stored for a provider that requires one.
    #[error("credentials not found for provider: {provider_id}")]
    CredentialNotFound { provider_id: String },

    /// The provider rejected the credential (HTTP 401/403).
    #[error("authentication failed for provider {provider_id} (HTTP {status})")]
    Authentication { provider_id: String, status: u16 },

    /// The provider could not be reached.
    #[error("cannot reach provider {provider_id}: {source}")]
    Connectivity {
        provider_id: String,
        #[source]
        source: TransportError,
    },

    /// The provider answered with a body that does not match its declared shape.
    #[error("unexpected {shape} response from provider {provider_id}: {reason}")]
    ResponseShape {
        provider_id: String,
        shape: ResponseShape,
        reason: String,
    },

    /// A catalog refresh only partially succeeded; stale data is being served.
    #[error("{0}")]
    PartialCatalog(PartialCatalog),

    /// A usage limit was hit and no fallback model applies.
    #[error("{origin} quota exceeded for provider {provider_id}{}{}", tier_suffix(.tier), retry_suffix(.retry_after_secs))]
    QuotaExceeded {
        provider_id: String,
        tier: Option<Tier>,
        origin: QuotaSource,
        retry_after_secs: Option<u64>,
    },

    /// A bound conversation was asked to talk to a different model.
    #[error("conversation {conversation_id} is bound to {bound}, refusing to send to {requested}")]
    ConversationBindingViolation {
        conversation_id: String,
        bound: ModelTarget,
        requested: ModelTarget,
    },

    /// The conversation has been closed.
    #[error("conversation is closed: {0}")]
    ConversationClosed(String),

    /// A send named no model and the conversation has none to fall back on.
    #[error("conversation {0} has no model selected")]
    MissingTarget(String),

    /// No conversation with this id exists.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// The model is not in the provider's catalog.
    #[error("model not found: {provider_id}/{model_id}")]
    ModelNotFound {
        provider_id: String,
        model_id: String,
    },

    /// The provider returned a non-success status with no more specific meaning.
    #[error("provider {provider_id} returned HTTP {status}")]
    ProviderApi { provider_id: String, status: u16 },

    /// The operation was cancelled before it could commit.
    #[error("operation cancelled")]
    Cancelled,

    /// Failed to access the secret backend.
    #[error("keyring error: {0}")]
    Keyring(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Provider records could not be parsed.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Provider records could not be written.
    #[error("toml error: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn provider_suffix(provider_id: &Option<String>) -> String {
    provider_id
        .as_deref()
        .map(|id| format!(" for {id}"))
        .unwrap_or_default()
}

fn tier_suffix(tier: &Option<Tier>) -> String {
    tier.map(|t| format!(" ({t} tier)")).unwrap_or_default()
}

fn retry_suffix(retry_after: &Option<u64>) -> String {
    retry_after
        .map(|secs| format!(", retry after {secs}s"))
        .unwrap_or_default()
}

impl Error {
    /// Shorthand for a validation failure on one field.
    pub fn invalid_config(
        provider_id: Option<&str>,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidConfig {
            provider_id: provider_id.map(str::to_string),
            field,
            reason: reason.into(),
        }
    }

    /// Process exit code for the CLI surface.
    ///
    /// `1` validation, `2` authentication, `3` connectivity, `4` quota.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Authentication { .. } | Error::CredentialNotFound { .. } => 2,
            Error::Connectivity { .. }
            | Error::ResponseShape { .. }
            | Error::PartialCatalog(_)
            | Error::ProviderApi { .. } => 3,
            Error::QuotaExceeded { .. } => 4,
            _ => 1,
        }
    }

    /// Whether retrying the same call could succeed.
    ///
    /// Only used for catalog refresh; live sends are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connectivity { .. })
    }
}
