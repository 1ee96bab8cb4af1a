//! Model catalog: per-provider model lists, refreshed on demand.
//!
//! A refresh is one logical fetch that follows pagination, bounded by a
//! single timeout. Connectivity failures are retried with exponential
//! backoff inside that bound; nothing else is retried.
//!
//! A failed or timed-out refresh never empties a catalog that had data:
//! the previous models stay, marked [`Availability::Stale`], and the outcome
//! carries a [`PartialCatalog`] warning. Pages that did arrive before the
//! timeout are merged in as listed.

mod cache;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

pub use cache::{CachedCatalog, CatalogCache};

use crate::adapter::{AdapterLayer, CatalogPage};
use crate::auth::{ApiKey, CredentialStore};
use crate::registry::{ProviderConfig, ProviderRegistry, ProviderRemovalHook};
use crate::sync::KeyedLocks;
use crate::types::{Availability, Model};
use crate::{Error, Result};

/// Default bound on one provider's refresh.
pub const DEFAULT_CATALOG_TIMEOUT: Duration = Duration::from_secs(10);

/// A refresh that could not complete. Stale data is being served instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialCatalog {
    pub provider_id: String,
    pub reason: String,
    /// Models fetched during this refresh.
    pub fetched: usize,
    /// Models kept from earlier refreshes and marked stale.
    pub stale: usize,
}

impl fmt::Display for PartialCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "catalog for {} is incomplete ({}); {} fresh, {} stale",
            self.provider_id, self.reason, self.fetched, self.stale
        )
    }
}

/// Refresh tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogSettings {
    pub timeout: Duration,
    /// Total attempts per page, including the first.
    pub retry_attempts: u32,
    pub retry_base: Duration,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CATALOG_TIMEOUT,
            retry_attempts: 3,
            retry_base: Duration::from_millis(250),
        }
    }
}

/// What a provider's catalog currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCatalog {
    /// Sorted by model id.
    pub models: Vec<Model>,
    /// `Listed` after a full refresh, `Stale` when serving old data,
    /// `Unavailable` when nothing could ever be fetched.
    pub availability: Availability,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Result of one provider refresh.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub provider_id: String,
    pub models: Vec<Model>,
    pub warning: Option<PartialCatalog>,
    /// Model ids that were in the catalog before and are gone now.
    pub removed: Vec<String>,
}

type Snapshot = Arc<BTreeMap<String, Arc<ProviderCatalog>>>;

/// Fetches, caches and serves model lists.
pub struct ModelCatalogService {
    adapter: Arc<AdapterLayer>,
    registry: Arc<ProviderRegistry>,
    credentials: Arc<CredentialStore>,
    settings: CatalogSettings,
    catalogs: RwLock<Snapshot>,
    cache: Option<CatalogCache>,
    locks: KeyedLocks,
}

impl ModelCatalogService {
    pub fn new(
        adapter: Arc<AdapterLayer>,
        registry: Arc<ProviderRegistry>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            adapter,
            registry,
            credentials,
            settings: CatalogSettings::default(),
            catalogs: RwLock::new(Arc::new(BTreeMap::new())),
            cache: None,
            locks: KeyedLocks::new(),
        }
    }

    pub fn with_settings(mut self, settings: CatalogSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Persist successful refreshes and seed from disk via [`load_cache`](Self::load_cache).
    pub fn with_cache(mut self, cache: CatalogCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn settings(&self) -> CatalogSettings {
        self.settings
    }

    /// Seed catalogs from cache files for every registered provider.
    ///
    /// Loaded models are marked stale until the next successful refresh.
    pub async fn load_cache(&self) -> Result<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        let mut loaded = 0;
        for provider_id in self.registry.ids() {
            let Some(cached) = cache.load(&provider_id).await? else {
                continue;
            };
            let models: Vec<Model> = cached
                .models
                .into_iter()
                .map(|mut m| {
                    m.availability = Availability::Stale;
                    m
                })
                .collect();
            loaded += models.len();
            self.modify(|map| {
                map.entry(provider_id.clone()).or_insert_with(|| {
                    Arc::new(ProviderCatalog {
                        models,
                        availability: Availability::Stale,
                        refreshed_at: Some(cached.fetched_at),
                    })
                });
            });
        }
        debug!(models = loaded, "loaded catalog cache");
        Ok(loaded)
    }

    /// Refresh one provider's catalog.
    ///
    /// Fetch failures do not fail the call: they come back as
    /// [`RefreshOutcome::warning`] with stale data in place.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProviderNotFound` for an unknown provider.
    pub async fn refresh(&self, provider_id: &str) -> Result<RefreshOutcome> {
        let provider = self.registry.get(provider_id)?;
        let _guard = self.locks.lock(provider_id).await;

        let mut fetched = Vec::new();
        let result = match self.credentials.get(provider_id).await {
            Ok(key) => {
                let fetch = self.fetch_all(&provider.config, &key, &mut fetched);
                match tokio::time::timeout(self.settings.timeout, fetch).await {
                    Ok(result) => result,
                    Err(_) => Err(format!(
                        "timed out after {}s",
                        self.settings.timeout.as_secs_f64()
                    )),
                }
            }
            Err(e) => Err(e.to_string()),
        };

        let outcome = match result {
            Ok(()) => self.commit_full(provider_id, fetched).await,
            Err(reason) => self.commit_partial(provider_id, fetched, reason),
        };
        Ok(outcome)
    }

    /// Refresh every registered provider concurrently, each under its own timeout.
    pub async fn refresh_all(&self) -> Vec<RefreshOutcome> {
        let ids = self.registry.ids();
        let results = join_all(ids.iter().map(|id| self.refresh(id))).await;
        results
            .into_iter()
            .zip(ids)
            .filter_map(|(result, id)| match result {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    // Removed while the refresh was queued.
                    debug!(provider_id = %id, error = %e, "skipping refresh");
                    None
                }
            })
            .collect()
    }

    /// Models for one provider, or every provider ordered by provider then id.
    pub fn list(&self, provider_id: Option<&str>) -> Vec<Model> {
        let snapshot = self.snapshot();
        match provider_id {
            Some(id) => snapshot
                .get(id)
                .map(|c| c.models.clone())
                .unwrap_or_default(),
            None => snapshot
                .values()
                .flat_map(|c| c.models.iter().cloned())
                .collect(),
        }
    }

    /// The catalog entry for a provider, if it was ever loaded or refreshed.
    pub fn catalog(&self, provider_id: &str) -> Option<Arc<ProviderCatalog>> {
        self.snapshot().get(provider_id).cloned()
    }

    pub fn get(&self, provider_id: &str, model_id: &str) -> Result<Model> {
        self.snapshot()
            .get(provider_id)
            .and_then(|c| c.models.iter().find(|m| m.id == model_id).cloned())
            .ok_or_else(|| Error::ModelNotFound {
                provider_id: provider_id.to_string(),
                model_id: model_id.to_string(),
            })
    }

    pub fn contains(&self, provider_id: &str, model_id: &str) -> bool {
        self.get(provider_id, model_id).is_ok()
    }

    /// Drop a provider's catalog and its cache file.
    pub async fn remove_provider(&self, provider_id: &str) -> Result<()> {
        {
            let _guard = self.locks.lock(provider_id).await;
            self.modify(|map| {
                map.remove(provider_id);
            });
            if let Some(cache) = &self.cache {
                cache.remove(provider_id).await?;
            }
        }
        self.locks.forget(provider_id);
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.catalogs.read().unwrap_or_else(|e| e.into_inner()))
    }

    async fn fetch_all(
        &self,
        config: &ProviderConfig,
        key: &ApiKey,
        fetched: &mut Vec<Model>,
    ) -> std::result::Result<(), String> {
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();
        loop {
            let page = self
                .fetch_page(config, cursor.as_deref(), key)
                .await
                .map_err(|e| e.to_string())?;
            fetched.extend(page.models);
            match page.next_cursor {
                Some(next) if !seen.insert(next.clone()) => {
                    return Err(format!("pagination cursor '{next}' repeated"));
                }
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    async fn fetch_page(
        &self,
        config: &ProviderConfig,
        cursor: Option<&str>,
        key: &ApiKey,
    ) -> Result<CatalogPage> {
        let mut attempt = 0;
        loop {
            match self.adapter.fetch_catalog_page(config, cursor, key).await {
                Err(e) if e.is_retryable() && attempt + 1 < self.settings.retry_attempts => {
                    let delay = self.settings.retry_base * 2u32.saturating_pow(attempt);
                    debug!(
                        provider_id = %config.id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying catalog page"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn commit_full(&self, provider_id: &str, fetched: Vec<Model>) -> RefreshOutcome {
        let models: Vec<Model> = fetched
            .into_iter()
            .map(|mut m| {
                m.availability = Availability::Listed;
                (m.id.clone(), m)
            })
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect();

        let now = Utc::now();
        let new_ids: BTreeSet<&str> = models.iter().map(|m| m.id.as_str()).collect();
        let removed = self
            .catalog(provider_id)
            .map(|prev| {
                prev.models
                    .iter()
                    .filter(|m| !new_ids.contains(m.id.as_str()))
                    .map(|m| m.id.clone())
                    .collect()
            })
            .unwrap_or_default();

        self.modify(|map| {
            map.insert(
                provider_id.to_string(),
                Arc::new(ProviderCatalog {
                    models: models.clone(),
                    availability: Availability::Listed,
                    refreshed_at: Some(now),
                }),
            );
        });

        if let Some(cache) = &self.cache {
            let cached = CachedCatalog {
                provider_id: provider_id.to_string(),
                fetched_at: now,
                models: models.clone(),
            };
            if let Err(e) = cache.save(&cached).await {
                warn!(provider_id, error = %e, "failed to write catalog cache");
            }
        }

        info!(provider_id, models = models.len(), "catalog refreshed");
        RefreshOutcome {
            provider_id: provider_id.to_string(),
            models,
            warning: None,
            removed,
        }
    }

    fn commit_partial(
        &self,
        provider_id: &str,
        fetched: Vec<Model>,
        reason: String,
    ) -> RefreshOutcome {
        let previous = self.catalog(provider_id);

        let mut merged: BTreeMap<String, Model> = BTreeMap::new();
        if let Some(prev) = &previous {
            for model in &prev.models {
                let mut model = model.clone();
                model.availability = Availability::Stale;
                merged.insert(model.id.clone(), model);
            }
        }
        for mut model in fetched {
            model.availability = Availability::Listed;
            merged.insert(model.id.clone(), model);
        }
        let models: Vec<Model> = merged.into_values().collect();
        let stale = models
            .iter()
            .filter(|m| m.availability == Availability::Stale)
            .count();
        let fresh = models.len() - stale;

        let availability = if models.is_empty() {
            Availability::Unavailable
        } else {
            Availability::Stale
        };
        let refreshed_at = previous.as_ref().and_then(|p| p.refreshed_at);

        self.modify(|map| {
            map.insert(
                provider_id.to_string(),
                Arc::new(ProviderCatalog {
                    models: models.clone(),
                    availability,
                    refreshed_at,
                }),
            );
        });

        let warning = PartialCatalog {
            provider_id: provider_id.to_string(),
            reason,
            fetched: fresh,
            stale,
        };
        warn!(provider_id, %warning, "catalog refresh incomplete");

        RefreshOutcome {
            provider_id: provider_id.to_string(),
            models,
            warning: Some(warning),
            removed: Vec::new(),
        }
    }

    fn modify(&self, f: impl FnOnce(&mut BTreeMap<String, Arc<ProviderCatalog>>)) {
        let mut current = self.catalogs.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**current).clone();
        f(&mut next);
        *current = Arc::new(next);
    }
}

#[async_trait]
impl ProviderRemovalHook for ModelCatalogService {
    fn name(&self) -> &str {
        "catalog"
    }

    async fn on_provider_removed(&self, provider_id: &str) -> Result<()> {
        self.remove_provider(provider_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ConnectivityKind, MockTransport, WireResponse};
    use crate::registry::{AuthScheme, ProviderConfig};
    use serde_json::json;
    use tempfile::TempDir;

    const MODELS_URL: &str = "https://acme.test/v1/models";

    struct Fixture {
        mock: Arc<MockTransport>,
        registry: Arc<ProviderRegistry>,
        credentials: Arc<CredentialStore>,
        catalog: ModelCatalogService,
    }

    async fn fixture() -> Fixture {
        let mock = Arc::new(MockTransport::new());
        let registry = Arc::new(ProviderRegistry::new());
        let credentials = Arc::new(CredentialStore::in_memory());
        registry
            .add(ProviderConfig::new(
                "acme",
                "https://acme.test/v1",
                AuthScheme::BearerHeader,
                "Authorization",
            ))
            .await
            .unwrap();
        credentials.set("acme", ApiKey::new("sk")).await.unwrap();

        let adapter = Arc::new(AdapterLayer::new(mock.clone()));
        let catalog = ModelCatalogService::new(adapter, registry.clone(), credentials.clone());
        Fixture {
            mock,
            registry,
            credentials,
            catalog,
        }
    }

    fn page(ids: &[&str], last: Option<&str>) -> serde_json::Value {
        let data: Vec<_> = ids.iter().map(|id| json!({ "id": id })).collect();
        match last {
            Some(last) => json!({ "data": data, "has_more": true, "last_id": last }),
            None => json!({ "data": data }),
        }
    }

    // ==================== Refresh Tests ====================

    #[tokio::test]
    async fn refresh_sorts_and_lists_models() {
        let f = fixture().await;
        f.mock.respond_json(MODELS_URL, 200, page(&["zeta", "alpha", "mid"], None));

        let outcome = f.catalog.refresh("acme").await.unwrap();

        assert!(outcome.warning.is_none());
        let ids: Vec<_> = f.catalog.list(Some("acme")).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
        assert!(
            f.catalog
                .list(None)
                .iter()
                .all(|m| m.availability == Availability::Listed)
        );
    }

    #[tokio::test]
    async fn repeated_refreshes_are_byte_identical() {
        let f = fixture().await;
        f.mock.respond_json(MODELS_URL, 200, page(&["b", "a", "c"], None));

        f.catalog.refresh("acme").await.unwrap();
        let first = serde_json::to_vec(&f.catalog.list(Some("acme"))).unwrap();
        f.catalog.refresh("acme").await.unwrap();
        let second = serde_json::to_vec(&f.catalog.list(Some("acme"))).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn refresh_follows_pagination() {
        let f = fixture().await;
        f.mock
            .respond_json(MODELS_URL, 200, page(&["a", "b"], Some("b")))
            .respond_json(MODELS_URL, 200, page(&["c"], None));

        let outcome = f.catalog.refresh("acme").await.unwrap();

        assert_eq!(outcome.models.len(), 3);
        let requests = f.mock.requests();
        assert_eq!(requests[1].query_param("after").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn refresh_reports_disappeared_models() {
        let f = fixture().await;
        f.mock
            .respond_json(MODELS_URL, 200, page(&["a", "b"], None))
            .respond_json(MODELS_URL, 200, page(&["a"], None));

        f.catalog.refresh("acme").await.unwrap();
        let outcome = f.catalog.refresh("acme").await.unwrap();

        assert_eq!(outcome.removed, vec!["b".to_string()]);
        assert!(!f.catalog.contains("acme", "b"));
    }

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let f = fixture().await;
        assert!(matches!(
            f.catalog.refresh("ghost").await,
            Err(Error::ProviderNotFound(_))
        ));
    }

    // ==================== Failure Tests ====================

    #[tokio::test]
    async fn failure_keeps_previous_models_as_stale() {
        let f = fixture().await;
        f.mock
            .respond_json(MODELS_URL, 200, page(&["a", "b"], None))
            .respond(MODELS_URL, WireResponse::new(500, ""));

        f.catalog.refresh("acme").await.unwrap();
        let outcome = f.catalog.refresh("acme").await.unwrap();

        let warning = outcome.warning.unwrap();
        assert_eq!(warning.stale, 2);
        assert_eq!(outcome.models.len(), 2);
        assert!(
            outcome
                .models
                .iter()
                .all(|m| m.availability == Availability::Stale)
        );
        assert!(outcome.removed.is_empty());
    }

    #[tokio::test]
    async fn failure_without_prior_data_is_unavailable() {
        let f = fixture().await;
        f.mock.respond(MODELS_URL, WireResponse::new(401, ""));

        let outcome = f.catalog.refresh("acme").await.unwrap();

        assert!(outcome.models.is_empty());
        assert!(outcome.warning.is_some());
        assert_eq!(
            f.catalog.catalog("acme").unwrap().availability,
            Availability::Unavailable
        );
    }

    #[tokio::test]
    async fn missing_credential_is_reported_as_warning() {
        let f = fixture().await;
        f.credentials.delete("acme").await.unwrap();

        let outcome = f.catalog.refresh("acme").await.unwrap();

        assert!(outcome.warning.unwrap().reason.contains("credentials not found"));
        assert_eq!(f.mock.requests().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_failures_are_retried_with_backoff() {
        let f = fixture().await;
        f.mock
            .fail(MODELS_URL, ConnectivityKind::Connect)
            .fail(MODELS_URL, ConnectivityKind::Connect)
            .respond_json(MODELS_URL, 200, page(&["a"], None));

        let outcome = f.catalog.refresh("acme").await.unwrap();

        assert!(outcome.warning.is_none());
        assert_eq!(f.mock.request_count(MODELS_URL), 3);
    }

    #[tokio::test]
    async fn auth_failures_are_not_retried() {
        let f = fixture().await;
        f.mock.respond(MODELS_URL, WireResponse::new(403, ""));

        f.catalog.refresh("acme").await.unwrap();

        assert_eq!(f.mock.request_count(MODELS_URL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_mid_pagination_merges_fetched_pages() {
        let f = fixture().await;
        f.mock
            .respond_json(MODELS_URL, 200, page(&["a", "b"], None))
            .respond_json(MODELS_URL, 200, page(&["a", "c"], Some("c")))
            .hang(MODELS_URL);
        f.catalog.refresh("acme").await.unwrap();

        let outcome = f.catalog.refresh("acme").await.unwrap();

        let by_id: BTreeMap<_, _> = outcome
            .models
            .iter()
            .map(|m| (m.id.as_str(), m.availability))
            .collect();
        assert_eq!(by_id["a"], Availability::Listed);
        assert_eq!(by_id["c"], Availability::Listed);
        assert_eq!(by_id["b"], Availability::Stale);
        assert!(outcome.warning.unwrap().reason.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_all_isolates_slow_providers() {
        let f = fixture().await;
        f.registry
            .add(ProviderConfig::new(
                "slow",
                "https://slow.test",
                AuthScheme::BearerHeader,
                "Authorization",
            ))
            .await
            .unwrap();
        f.credentials.set("slow", ApiKey::new("sk")).await.unwrap();
        f.mock.respond_json(MODELS_URL, 200, page(&["a"], None));
        f.mock.hang("https://slow.test/models");

        let started = tokio::time::Instant::now();
        let outcomes = f.catalog.refresh_all().await;

        assert_eq!(outcomes.len(), 2);
        assert!(started.elapsed() <= DEFAULT_CATALOG_TIMEOUT + Duration::from_millis(100));
        let acme = outcomes.iter().find(|o| o.provider_id == "acme").unwrap();
        assert!(acme.warning.is_none());
        let slow = outcomes.iter().find(|o| o.provider_id == "slow").unwrap();
        assert!(slow.warning.is_some());
    }

    // ==================== Cache Tests ====================

    #[tokio::test]
    async fn cache_round_trip_seeds_stale_models() {
        let dir = TempDir::new().unwrap();
        let f = fixture().await;
        let catalog = ModelCatalogService::new(
            Arc::new(AdapterLayer::new(f.mock.clone())),
            f.registry.clone(),
            f.credentials.clone(),
        )
        .with_cache(CatalogCache::new(dir.path()));
        f.mock.respond_json(MODELS_URL, 200, page(&["a"], None));
        catalog.refresh("acme").await.unwrap();

        let reloaded = ModelCatalogService::new(
            Arc::new(AdapterLayer::new(f.mock.clone())),
            f.registry.clone(),
            f.credentials.clone(),
        )
        .with_cache(CatalogCache::new(dir.path()));
        assert_eq!(reloaded.load_cache().await.unwrap(), 1);
        assert_eq!(
            reloaded.get("acme", "a").unwrap().availability,
            Availability::Stale
        );

        reloaded.remove_provider("acme").await.unwrap();
        assert!(!dir.path().join("acme.json").exists());
        assert!(reloaded.list(Some("acme")).is_empty());
    }
}
