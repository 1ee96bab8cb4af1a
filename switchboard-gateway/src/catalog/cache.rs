//! Last-known-good catalog files, one per provider.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::store;
use crate::types::Model;

/// Contents of `<cache>/catalog/<provider>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCatalog {
    pub provider_id: String,
    pub fetched_at: DateTime<Utc>,
    pub models: Vec<Model>,
}

#[derive(Debug, Clone)]
pub struct CatalogCache {
    dir: PathBuf,
}

impl CatalogCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, provider_id: &str) -> PathBuf {
        self.dir.join(format!("{provider_id}.json"))
    }

    pub async fn load(&self, provider_id: &str) -> Result<Option<CachedCatalog>> {
        store::read_json(&self.path(provider_id)).await
    }

    pub async fn save(&self, catalog: &CachedCatalog) -> Result<()> {
        store::write_json(&self.path(&catalog.provider_id), catalog).await
    }

    pub async fn remove(&self, provider_id: &str) -> Result<bool> {
        store::remove_file(&self.path(provider_id)).await
    }
}
