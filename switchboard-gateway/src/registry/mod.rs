//! Provider registry.
//!
//! Holds every configured [`Provider`]. Reads hand out an immutable snapshot;
//! writes clone the map, modify it and swap it in, serialized per provider id.
//! Removing a provider runs every registered [`ProviderRemovalHook`] so the
//! credential, catalog, favorites, quota counters and conversations that
//! belong to it go away with it.

mod config;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

pub use config::{
    AuthScheme, FallbackPolicy, Provider, ProviderConfig, ProviderStatus, ResetPolicy,
    ResponseShape, TierLimit,
};

use crate::sync::KeyedLocks;
use crate::{Error, Result};

/// Something that owns per-provider state and must drop it when the
/// provider is removed.
#[async_trait]
pub trait ProviderRemovalHook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Drop everything held for `provider_id`.
    async fn on_provider_removed(&self, provider_id: &str) -> Result<()>;
}

type Snapshot = Arc<BTreeMap<String, Provider>>;

/// CRUD over provider configuration records.
pub struct ProviderRegistry {
    providers: RwLock<Snapshot>,
    locks: KeyedLocks,
    hooks: RwLock<Vec<Arc<dyn ProviderRemovalHook>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::from_providers(Vec::new())
    }

    /// Seed the registry from persisted records.
    pub fn from_providers(providers: Vec<Provider>) -> Self {
        let map = providers
            .into_iter()
            .map(|p| (p.id().to_string(), p))
            .collect();
        Self {
            providers: RwLock::new(Arc::new(map)),
            locks: KeyedLocks::new(),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a hook that runs on every [`remove`](Self::remove).
    pub fn add_removal_hook(&self, hook: Arc<dyn ProviderRemovalHook>) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Validate and insert a new provider.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if validation fails or the id is taken.
    pub async fn add(&self, config: ProviderConfig) -> Result<String> {
        config.validate()?;
        let id = config.id.clone();
        let _guard = self.locks.lock(&id).await;

        self.modify(|map| {
            if map.contains_key(&id) {
                return Err(Error::invalid_config(
                    Some(&id),
                    "id",
                    "a provider with this id already exists",
                ));
            }
            map.insert(id.clone(), Provider::new(config));
            Ok(())
        })?;

        info!(provider_id = %id, "provider added");
        Ok(id)
    }

    /// Replace the record of an existing provider. Status resets to unverified.
    pub async fn update(&self, id: &str, mut config: ProviderConfig) -> Result<Provider> {
        if config.id.is_empty() {
            config.id = id.to_string();
        }
        if config.id != id {
            return Err(Error::invalid_config(
                Some(id),
                "id",
                "provider ids cannot be changed; remove and add instead",
            ));
        }
        config.validate()?;
        let _guard = self.locks.lock(id).await;

        let updated = self.modify(|map| {
            let slot = map
                .get_mut(id)
                .ok_or_else(|| Error::ProviderNotFound(id.to_string()))?;
            *slot = Provider::new(config);
            Ok(slot.clone())
        })?;

        info!(provider_id = %id, "provider updated");
        Ok(updated)
    }

    /// Remove a provider and cascade to every removal hook.
    ///
    /// All hooks run even if one fails; the first failure is returned.
    pub async fn remove(&self, id: &str) -> Result<Provider> {
        let removed = {
            let _guard = self.locks.lock(id).await;
            self.modify(|map| {
                map.remove(id)
                    .ok_or_else(|| Error::ProviderNotFound(id.to_string()))
            })?
        };
        self.locks.forget(id);

        let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut first_error = None;
        for hook in hooks {
            match hook.on_provider_removed(id).await {
                Ok(()) => debug!(provider_id = %id, hook = hook.name(), "cascade complete"),
                Err(e) => {
                    warn!(provider_id = %id, hook = hook.name(), error = %e, "cascade failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(provider_id = %id, "provider removed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Record the outcome of a health check.
    pub async fn set_status(&self, id: &str, status: ProviderStatus) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        self.modify(|map| {
            let slot = map
                .get_mut(id)
                .ok_or_else(|| Error::ProviderNotFound(id.to_string()))?;
            slot.status = status;
            slot.status_checked_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Get a provider by id.
    pub fn get(&self, id: &str) -> Result<Provider> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(id.to_string()))
    }

    /// All providers, ordered by id.
    pub fn list(&self) -> Vec<Provider> {
        self.snapshot().values().cloned().collect()
    }

    /// Ids of all providers.
    pub fn ids(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshot().contains_key(id)
    }

    /// Immutable view of the registry at this instant.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.providers.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn modify<T>(&self, f: impl FnOnce(&mut BTreeMap<String, Provider>) -> Result<T>) -> Result<T> {
        let mut current = self.providers.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**current).clone();
        let out = f(&mut next)?;
        *current = Arc::new(next);
        Ok(out)
    }
}
