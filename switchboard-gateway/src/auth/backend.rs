//! Secret backends behind the credential store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ApiKey, CredentialSource};
use crate::{Error, Result};

/// Where secrets physically live.
///
/// Implementations must never write a secret to plaintext storage.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Which source credentials read from this backend report.
    fn source(&self) -> CredentialSource;

    /// Read the secret for a provider, `None` if absent.
    async fn read(&self, provider_id: &str) -> Result<Option<ApiKey>>;

    /// Store or replace the secret for a provider.
    async fn write(&self, provider_id: &str, key: &ApiKey) -> Result<()>;

    /// Erase the secret. Returns whether one existed.
    async fn erase(&self, provider_id: &str) -> Result<bool>;
}

/// System keyring backend.
///
/// Keyring calls block, so every call is moved onto the blocking pool.
pub struct KeyringBackend {
    service_name: String,
}

impl KeyringBackend {
    /// # Arguments
    ///
    /// * `service_name` - Service identifier for keyring (e.g., "switchboard")
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    async fn with_entry<T, F>(&self, provider_id: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(keyring::Entry) -> Result<T> + Send + 'static,
    {
        let service = self.service_name.clone();
        let user = provider_id.to_string();
        tokio::task::spawn_blocking(move || {
            let entry =
                keyring::Entry::new(&service, &user).map_err(|e| Error::Keyring(e.to_string()))?;
            f(entry)
        })
        .await
        .map_err(|e| Error::Keyring(format!("keyring task failed: {e}")))?
    }
}

#[async_trait]
impl SecretBackend for KeyringBackend {
    fn source(&self) -> CredentialSource {
        CredentialSource::Keyring
    }

    async fn read(&self, provider_id: &str) -> Result<Option<ApiKey>> {
        self.with_entry(provider_id, |entry| match entry.get_password() {
            Ok(secret) => Ok(Some(ApiKey::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::Keyring(e.to_string())),
        })
        .await
    }

    async fn write(&self, provider_id: &str, key: &ApiKey) -> Result<()> {
        let key = key.clone();
        self.with_entry(provider_id, move |entry| {
            entry
                .set_password(key.expose_secret())
                .map_err(|e| Error::Keyring(e.to_string()))
        })
        .await
    }

    async fn erase(&self, provider_id: &str) -> Result<bool> {
        self.with_entry(provider_id, |entry| match entry.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(Error::Keyring(e.to_string())),
        })
        .await
    }
}

/// Process-local backend. Secrets vanish with the process.
#[derive(Default)]
pub struct MemoryBackend {
    secrets: Mutex<HashMap<String, ApiKey>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretBackend for MemoryBackend {
    fn source(&self) -> CredentialSource {
        CredentialSource::Memory
    }

    async fn read(&self, provider_id: &str) -> Result<Option<ApiKey>> {
        let secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        Ok(secrets.get(provider_id).cloned())
    }

    async fn write(&self, provider_id: &str, key: &ApiKey) -> Result<()> {
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        secrets.insert(provider_id.to_string(), key.clone());
        Ok(())
    }

    async fn erase(&self, provider_id: &str) -> Result<bool> {
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        Ok(secrets.remove(provider_id).is_some())
    }
}
