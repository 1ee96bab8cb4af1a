//! User-ranked favorite models.
//!
//! Ranks are 1-based and always contiguous: removing or moving an entry
//! re-compacts the list.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::ModelCatalogService;
use crate::registry::ProviderRemovalHook;
use crate::types::ModelTarget;
use crate::{Error, Result};

/// A favorite model and its position in the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteEntry {
    pub provider_id: String,
    pub model_id: String,
    pub rank: u32,
}

impl FavoriteEntry {
    pub fn target(&self) -> ModelTarget {
        ModelTarget::new(&self.provider_id, &self.model_id)
    }

    fn is(&self, provider_id: &str, model_id: &str) -> bool {
        self.provider_id == provider_id && self.model_id == model_id
    }
}

type Snapshot = Arc<Vec<FavoriteEntry>>;

pub struct FavoritesStore {
    catalog: Arc<ModelCatalogService>,
    entries: RwLock<Snapshot>,
}

impl FavoritesStore {
    pub fn new(catalog: Arc<ModelCatalogService>) -> Self {
        Self {
            catalog,
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Append a model to the end of the list. Re-adding is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelNotFound` if the catalog does not know the model.
    pub fn add(&self, provider_id: &str, model_id: &str) -> Result<FavoriteEntry> {
        self.catalog.get(provider_id, model_id)?;
        let entry = self.modify(|list| {
            if let Some(existing) = list.iter().find(|e| e.is(provider_id, model_id)) {
                return existing.clone();
            }
            let entry = FavoriteEntry {
                provider_id: provider_id.to_string(),
                model_id: model_id.to_string(),
                rank: list.len() as u32 + 1,
            };
            list.push(entry.clone());
            entry
        });
        info!(provider_id, model = model_id, rank = entry.rank, "favorite added");
        Ok(entry)
    }

    /// Remove a favorite. Returns whether it was present.
    pub fn remove(&self, provider_id: &str, model_id: &str) -> bool {
        let removed = self.retain(|e| !e.is(provider_id, model_id)) > 0;
        if removed {
            info!(provider_id, model = model_id, "favorite removed");
        }
        removed
    }

    /// Move a favorite to `rank`, clamped to the list bounds.
    pub fn move_to(&self, provider_id: &str, model_id: &str, rank: u32) -> Result<FavoriteEntry> {
        self.modify(|list| {
            let index = list
                .iter()
                .position(|e| e.is(provider_id, model_id))
                .ok_or_else(|| Error::ModelNotFound {
                    provider_id: provider_id.to_string(),
                    model_id: model_id.to_string(),
                })?;
            let entry = list.remove(index);
            let target = (rank.max(1) as usize - 1).min(list.len());
            list.insert(target, entry);
            compact(list);
            Ok(list[target].clone())
        })
    }

    /// All favorites in rank order.
    pub fn list(&self) -> Vec<FavoriteEntry> {
        self.snapshot().as_ref().clone()
    }

    pub fn contains(&self, provider_id: &str, model_id: &str) -> bool {
        self.snapshot().iter().any(|e| e.is(provider_id, model_id))
    }

    /// Drop every favorite of a provider.
    pub fn remove_provider(&self, provider_id: &str) -> usize {
        self.retain(|e| e.provider_id != provider_id)
    }

    /// Drop favorites for models that no longer exist.
    pub fn prune_models(&self, provider_id: &str, model_ids: &[String]) -> usize {
        let pruned = self.retain(|e| e.provider_id != provider_id || !model_ids.contains(&e.model_id));
        if pruned > 0 {
            debug!(provider_id, pruned, "pruned favorites for removed models");
        }
        pruned
    }

    /// Replace the list with persisted entries, ordered by their ranks.
    pub fn restore(&self, mut entries: Vec<FavoriteEntry>) {
        entries.sort_by_key(|e| e.rank);
        entries.dedup_by(|a, b| a.is(&b.provider_id, &b.model_id));
        compact(&mut entries);
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(entries);
    }

    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.entries.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn retain(&self, keep: impl Fn(&FavoriteEntry) -> bool) -> usize {
        self.modify(|list| {
            let before = list.len();
            list.retain(|e| keep(e));
            compact(list);
            before - list.len()
        })
    }

    fn modify<T>(&self, f: impl FnOnce(&mut Vec<FavoriteEntry>) -> T) -> T {
        let mut current = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**current).clone();
        let out = f(&mut next);
        *current = Arc::new(next);
        out
    }
}

fn compact(list: &mut [FavoriteEntry]) {
    for (i, entry) in list.iter_mut().enumerate() {
        entry.rank = i as u32 + 1;
    }
}

#[async_trait]
impl ProviderRemovalHook for FavoritesStore {
    fn name(&self) -> &str {
        "favorites"
    }

    async fn on_provider_removed(&self, provider_id: &str) -> Result<()> {
        self.remove_provider(provider_id);
        Ok(())
    }
}
