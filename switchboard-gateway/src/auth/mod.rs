//! Credential management for provider secrets.
//!
//! Secrets live in a [`SecretBackend`] (the system keyring in normal use)
//! with an optional environment variable fallback for CI/deployment
//! scenarios. Only timestamps are kept alongside; the secret itself never
//! leaves the backend except as an [`ApiKey`] handed to the adapter at
//! call time.
//!
//! # Example
//!
//! ```ignore
//! use switchboard_gateway::auth::{ApiKey, CredentialStore, KeyringBackend};
//!
//! let store = CredentialStore::new(Arc::new(KeyringBackend::new("switchboard")))
//!     .with_env_fallback();
//!
//! store.set("acme", ApiKey::new("sk-...")).await?;
//! let key = store.get("acme").await?;
//! ```

mod backend;

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use backend::{KeyringBackend, MemoryBackend, SecretBackend};

use crate::registry::ProviderRemovalHook;
use crate::sync::KeyedLocks;
use crate::{Error, Result};

/// A secure API key that prevents accidental logging.
///
/// The key is wrapped in `SecretString` which:
/// - Implements `Debug` as `"[REDACTED]"`
/// - Zeroizes memory on drop
/// - Requires explicit `.expose_secret()` to access the value
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Create a new API key from a string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    /// Expose the secret key value.
    ///
    /// Use sparingly - only when actually sending to an API.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiKey([REDACTED])")
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Source of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Stored in system keyring.
    Keyring,
    /// Held in process memory only.
    Memory,
    /// From environment variable.
    Environment,
}

/// Non-secret bookkeeping for a stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialMeta {
    pub provider_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Environment variable consulted for a provider when fallback is enabled.
///
/// `my-provider` → `MY_PROVIDER_API_KEY`.
pub fn env_var_for_provider(provider_id: &str) -> String {
    let mut name: String = provider_id
        .chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    name.push_str("_API_KEY");
    name
}

/// Secure credential storage keyed by provider id.
///
/// # Storage Priority
///
/// When retrieving credentials:
/// 1. The secret backend
/// 2. Environment variables (if `env_fallback` is enabled)
///
/// Operations on one provider are serialized, so a [`rotate`](Self::rotate)
/// never interleaves with a [`get`](Self::get). A request that already holds
/// the old key keeps its own copy and finishes with it.
pub struct CredentialStore {
    backend: Arc<dyn SecretBackend>,
    env_fallback: bool,
    meta: RwLock<HashMap<String, CredentialMeta>>,
    locks: KeyedLocks,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            backend,
            env_fallback: false,
            meta: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    /// Store backed by process memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Enable environment variable fallback.
    pub fn with_env_fallback(mut self) -> Self {
        self.env_fallback = true;
        self
    }

    /// Get the secret for a provider and mark it used.
    ///
    /// # Errors
    ///
    /// Returns `Error::CredentialNotFound` if no credentials are found.
    pub async fn get(&self, provider_id: &str) -> Result<ApiKey> {
        let _guard = self.locks.lock(provider_id).await;

        if let Some(key) = self.backend.read(provider_id).await? {
            self.touch(provider_id);
            debug!(provider_id, "retrieved credential from backend");
            return Ok(key);
        }

        if self.env_fallback
            && let Some(key) = self.get_from_env(provider_id)
        {
            debug!(provider_id, "retrieved credential from environment");
            return Ok(key);
        }

        Err(Error::CredentialNotFound {
            provider_id: provider_id.to_string(),
        })
    }

    /// Store a secret for a provider, replacing any existing one.
    pub async fn set(&self, provider_id: &str, key: ApiKey) -> Result<()> {
        let _guard = self.locks.lock(provider_id).await;
        self.backend.write(provider_id, &key).await?;
        self.record_created(provider_id);
        debug!(provider_id, "stored credential");
        Ok(())
    }

    /// Atomically replace an existing secret.
    ///
    /// # Errors
    ///
    /// Returns `Error::CredentialNotFound` if nothing is stored to rotate.
    pub async fn rotate(&self, provider_id: &str, new_key: ApiKey) -> Result<()> {
        let _guard = self.locks.lock(provider_id).await;
        if self.backend.read(provider_id).await?.is_none() {
            return Err(Error::CredentialNotFound {
                provider_id: provider_id.to_string(),
            });
        }
        self.backend.write(provider_id, &new_key).await?;
        self.record_created(provider_id);
        debug!(provider_id, "rotated credential");
        Ok(())
    }

    /// Delete the stored secret for a provider.
    ///
    /// # Errors
    ///
    /// Returns `Error::CredentialNotFound` if no credentials exist.
    pub async fn delete(&self, provider_id: &str) -> Result<()> {
        let existed = {
            let _guard = self.locks.lock(provider_id).await;
            let existed = self.backend.erase(provider_id).await?;
            self.meta
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(provider_id);
            existed
        };
        self.locks.forget(provider_id);

        if !existed {
            return Err(Error::CredentialNotFound {
                provider_id: provider_id.to_string(),
            });
        }
        debug!(provider_id, "deleted credential");
        Ok(())
    }

    /// Check if credentials exist for a provider (backend or environment).
    pub async fn has(&self, provider_id: &str) -> bool {
        self.source(provider_id).await.is_some()
    }

    /// Where the credential for a provider would be read from.
    pub async fn source(&self, provider_id: &str) -> Option<CredentialSource> {
        let _guard = self.locks.lock(provider_id).await;
        if matches!(self.backend.read(provider_id).await, Ok(Some(_))) {
            Some(self.backend.source())
        } else if self.env_fallback && self.get_from_env(provider_id).is_some() {
            Some(CredentialSource::Environment)
        } else {
            None
        }
    }

    /// Timestamps for a stored credential.
    pub fn metadata(&self, provider_id: &str) -> Option<CredentialMeta> {
        self.meta
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider_id)
            .cloned()
    }

    /// All credential metadata, for persistence.
    pub fn export_metadata(&self) -> Vec<CredentialMeta> {
        let mut all: Vec<_> = self
            .meta
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        all
    }

    /// Restore metadata loaded from disk.
    pub fn restore_metadata(&self, entries: Vec<CredentialMeta>) {
        let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
        for entry in entries {
            meta.insert(entry.provider_id.clone(), entry);
        }
    }

    fn record_created(&self, provider_id: &str) {
        self.meta.write().unwrap_or_else(|e| e.into_inner()).insert(
            provider_id.to_string(),
            CredentialMeta {
                provider_id: provider_id.to_string(),
                created_at: Utc::now(),
                last_used_at: None,
            },
        );
    }

    fn touch(&self, provider_id: &str) {
        let now = Utc::now();
        self.meta
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(provider_id.to_string())
            .and_modify(|m| m.last_used_at = Some(now))
            .or_insert_with(|| CredentialMeta {
                provider_id: provider_id.to_string(),
                created_at: now,
                last_used_at: Some(now),
            });
    }

    fn get_from_env(&self, provider_id: &str) -> Option<ApiKey> {
        env::var(env_var_for_provider(provider_id))
            .ok()
            .filter(|v| !v.is_empty())
            .map(ApiKey::new)
    }
}

#[async_trait]
impl ProviderRemovalHook for CredentialStore {
    fn name(&self) -> &str {
        "credentials"
    }

    async fn on_provider_removed(&self, provider_id: &str) -> Result<()> {
        match self.delete(provider_id).await {
            Ok(()) | Err(Error::CredentialNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
