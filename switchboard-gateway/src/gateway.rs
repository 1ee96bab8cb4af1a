//! The gateway facade.
//!
//! [`Gateway`] wires every component together, registers the removal
//! cascade and, when opened on a [`StateDir`], keeps providers, favorites,
//! quota counters and credential metadata on disk.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{
    AdapterLayer, DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_REQUEST_TIMEOUT, HttpTransport,
};
use crate::auth::{ApiKey, CredentialMeta, CredentialStore};
use crate::catalog::{CatalogCache, CatalogSettings, ModelCatalogService, RefreshOutcome};
use crate::conversation::{Conversation, ConversationManager, Message};
use crate::favorites::{FavoriteEntry, FavoritesStore};
use crate::health::{HealthChecker, HealthResult};
use crate::quota::{QuotaCounter, QuotaTracker, spawn_usage_listener};
use crate::registry::{Provider, ProviderConfig, ProviderRegistry};
use crate::store::{self, StateDir};
use crate::types::{Model, ModelTarget};
use crate::Result;

/// Tunables for a [`Gateway`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub catalog: CatalogSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            catalog: CatalogSettings::default(),
        }
    }
}

/// On-disk shape of `providers.toml`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: Vec<Provider>,
}

/// One entry point over providers, models, favorites and conversations.
pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    credentials: Arc<CredentialStore>,
    adapter: Arc<AdapterLayer>,
    catalog: Arc<ModelCatalogService>,
    health: HealthChecker,
    quota: Arc<QuotaTracker>,
    favorites: Arc<FavoritesStore>,
    conversations: Arc<ConversationManager>,
    state: Option<StateDir>,
    shutdown: CancellationToken,
    usage_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Build a gateway over an existing registry and credential store.
    ///
    /// Nothing is persisted. Must be called inside a tokio runtime.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        credentials: Arc<CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        settings: GatewaySettings,
    ) -> Self {
        Self::assemble(registry, credentials, transport, settings, None)
    }

    /// Open a gateway whose state lives under `state`.
    ///
    /// Loads providers, favorites, quota counters, credential metadata,
    /// cached catalogs and conversations written by earlier runs.
    pub async fn open(
        state: StateDir,
        credentials: Arc<CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        settings: GatewaySettings,
    ) -> Result<Self> {
        let providers = store::read_toml::<ProvidersFile>(&state.providers_file())
            .await?
            .unwrap_or_default()
            .providers;
        let registry = Arc::new(ProviderRegistry::from_providers(providers));
        let gateway = Self::assemble(registry, credentials, transport, settings, Some(state.clone()));

        if let Some(meta) = store::read_json::<Vec<CredentialMeta>>(&state.credentials_file()).await? {
            gateway.credentials.restore_metadata(meta);
        }
        if let Some(counters) = store::read_json::<Vec<QuotaCounter>>(&state.quota_file()).await? {
            gateway.quota.restore(counters);
        }
        let models = gateway.catalog.load_cache().await?;
        if let Some(favorites) = store::read_json::<Vec<FavoriteEntry>>(&state.favorites_file()).await? {
            gateway.favorites.restore(favorites);
        }
        let conversations = gateway.conversations.load().await?;

        info!(
            providers = gateway.registry.ids().len(),
            models,
            conversations,
            "gateway opened"
        );
        Ok(gateway)
    }

    fn assemble(
        registry: Arc<ProviderRegistry>,
        credentials: Arc<CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        settings: GatewaySettings,
        state: Option<StateDir>,
    ) -> Self {
        let adapter = Arc::new(
            AdapterLayer::new(transport)
                .with_max_concurrency(settings.max_concurrent_requests)
                .with_request_timeout(settings.request_timeout),
        );

        let mut catalog = ModelCatalogService::new(
            Arc::clone(&adapter),
            Arc::clone(&registry),
            Arc::clone(&credentials),
        )
        .with_settings(settings.catalog);
        if let Some(state) = &state {
            catalog = catalog.with_cache(CatalogCache::new(state.catalog_dir()));
        }
        let catalog = Arc::new(catalog);

        let health = HealthChecker::new(
            Arc::clone(&adapter),
            Arc::clone(&registry),
            Arc::clone(&credentials),
        )
        .with_timeout(settings.catalog.timeout);

        let quota = Arc::new(QuotaTracker::new());
        for provider in registry.list() {
            quota.configure(&provider.config);
        }

        let favorites = Arc::new(FavoritesStore::new(Arc::clone(&catalog)));

        let mut conversations = ConversationManager::new(
            Arc::clone(&registry),
            Arc::clone(&credentials),
            Arc::clone(&quota),
            Arc::clone(&adapter),
        );
        if let Some(state) = &state {
            conversations = conversations.with_store_dir(state.conversations_dir());
        }
        let conversations = Arc::new(conversations);

        registry.add_removal_hook(credentials.clone());
        registry.add_removal_hook(catalog.clone());
        registry.add_removal_hook(favorites.clone());
        registry.add_removal_hook(quota.clone());
        registry.add_removal_hook(conversations.clone());

        let shutdown = CancellationToken::new();
        let usage_listener = spawn_usage_listener(
            Arc::clone(&quota),
            adapter.subscribe_usage(),
            shutdown.clone(),
        );

        Self {
            registry,
            credentials,
            adapter,
            catalog,
            health,
            quota,
            favorites,
            conversations,
            state,
            shutdown,
            usage_listener: Mutex::new(Some(usage_listener)),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn adapter(&self) -> &Arc<AdapterLayer> {
        &self.adapter
    }

    pub fn catalog(&self) -> &Arc<ModelCatalogService> {
        &self.catalog
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    pub fn favorites(&self) -> &Arc<FavoritesStore> {
        &self.favorites
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    // ---- providers ----

    /// Register a provider, store its secret and verify it.
    ///
    /// The provider stays registered whatever the verification says; the
    /// returned [`HealthResult`] carries the outcome.
    pub async fn add_provider(
        &self,
        config: ProviderConfig,
        secret: Option<ApiKey>,
    ) -> Result<HealthResult> {
        let id = self.registry.add(config).await?;
        let provider = self.registry.get(&id)?;
        self.quota.configure(&provider.config);

        if let Some(secret) = secret
            && let Err(e) = self.credentials.set(&id, secret).await
        {
            // Keep registry and keyring consistent.
            self.registry.remove(&id).await.ok();
            return Err(e);
        }

        let result = self.health.verify(&id).await?;
        self.persist_providers().await?;
        self.persist_credentials().await?;
        Ok(result)
    }

    /// Replace a provider's record, optionally rotating its secret, and re-verify.
    pub async fn edit_provider(
        &self,
        id: &str,
        config: ProviderConfig,
        secret: Option<ApiKey>,
    ) -> Result<HealthResult> {
        let provider = self.registry.update(id, config).await?;
        self.quota.configure(&provider.config);

        if let Some(secret) = secret {
            if self.credentials.has(id).await {
                self.credentials.rotate(id, secret).await?;
            } else {
                self.credentials.set(id, secret).await?;
            }
        }

        let result = self.health.verify(id).await?;
        self.persist_providers().await?;
        self.persist_credentials().await?;
        Ok(result)
    }

    /// Remove a provider and everything that belongs to it.
    pub async fn remove_provider(&self, id: &str) -> Result<Provider> {
        let outcome = self.registry.remove(id).await;
        // The registry entry is gone even if a cascade step failed.
        self.persist_all().await?;
        outcome
    }

    pub fn get_provider(&self, id: &str) -> Result<Provider> {
        self.registry.get(id)
    }

    pub fn list_providers(&self) -> Vec<Provider> {
        self.registry.list()
    }

    pub async fn verify_provider(&self, id: &str) -> Result<HealthResult> {
        let result = self.health.verify(id).await?;
        self.persist_providers().await?;
        Ok(result)
    }

    pub async fn verify_all(&self) -> Result<Vec<HealthResult>> {
        let results = self.health.verify_all().await;
        self.persist_providers().await?;
        Ok(results)
    }

    // ---- models ----

    pub fn list_models(&self, provider_id: Option<&str>) -> Result<Vec<Model>> {
        if let Some(id) = provider_id {
            self.registry.get(id)?;
        }
        Ok(self.catalog.list(provider_id))
    }

    /// Refresh one provider's catalog and prune favorites for vanished models.
    pub async fn refresh_models(&self, provider_id: &str) -> Result<RefreshOutcome> {
        let outcome = self.catalog.refresh(provider_id).await?;
        self.prune_favorites(std::slice::from_ref(&outcome)).await?;
        self.persist_credentials().await?;
        Ok(outcome)
    }

    pub async fn refresh_all(&self) -> Result<Vec<RefreshOutcome>> {
        let outcomes = self.catalog.refresh_all().await;
        self.prune_favorites(&outcomes).await?;
        self.persist_credentials().await?;
        Ok(outcomes)
    }

    async fn prune_favorites(&self, outcomes: &[RefreshOutcome]) -> Result<()> {
        let pruned: usize = outcomes
            .iter()
            .filter(|o| !o.removed.is_empty())
            .map(|o| self.favorites.prune_models(&o.provider_id, &o.removed))
            .sum();
        if pruned > 0 {
            self.persist_favorites().await?;
        }
        Ok(())
    }

    // ---- favorites ----

    pub async fn add_favorite(&self, provider_id: &str, model_id: &str) -> Result<FavoriteEntry> {
        let entry = self.favorites.add(provider_id, model_id)?;
        self.persist_favorites().await?;
        Ok(entry)
    }

    pub async fn remove_favorite(&self, provider_id: &str, model_id: &str) -> Result<bool> {
        let removed = self.favorites.remove(provider_id, model_id);
        if removed {
            self.persist_favorites().await?;
        }
        Ok(removed)
    }

    pub async fn move_favorite(
        &self,
        provider_id: &str,
        model_id: &str,
        rank: u32,
    ) -> Result<FavoriteEntry> {
        let entry = self.favorites.move_to(provider_id, model_id, rank)?;
        self.persist_favorites().await?;
        Ok(entry)
    }

    pub fn list_favorites(&self) -> Vec<FavoriteEntry> {
        self.favorites.list()
    }

    // ---- conversations ----

    pub async fn start_conversation(&self, target: Option<ModelTarget>) -> Result<Conversation> {
        self.conversations.create(target).await
    }

    pub async fn send_message(
        &self,
        conversation_id: &str,
        target: Option<ModelTarget>,
        content: &str,
    ) -> Result<Message> {
        let result = self
            .conversations
            .send_message(conversation_id, target, content)
            .await;
        self.persist_usage().await;
        result
    }

    pub async fn send_message_with_timeout(
        &self,
        conversation_id: &str,
        target: Option<ModelTarget>,
        content: &str,
        timeout: Duration,
    ) -> Result<Message> {
        let result = self
            .conversations
            .send_message_with_timeout(conversation_id, target, content, timeout)
            .await;
        self.persist_usage().await;
        result
    }

    pub async fn close_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.conversations.close(conversation_id).await
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.conversations.get(conversation_id).await
    }

    pub async fn list_conversations(&self) -> Vec<Conversation> {
        self.conversations.list().await
    }

    // ---- quota ----

    pub fn usage(&self, provider_id: &str) -> Result<Vec<QuotaCounter>> {
        self.registry.get(provider_id)?;
        Ok(self.quota.usage(provider_id))
    }

    /// Stop the usage listener after it drains, then flush state to disk.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let listener = self
            .usage_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(listener) = listener
            && let Err(e) = listener.await
        {
            warn!(error = %e, "usage listener ended abnormally");
        }
        self.persist_all().await?;
        debug!("gateway shut down");
        Ok(())
    }

    // ---- persistence ----

    async fn persist_all(&self) -> Result<()> {
        self.persist_providers().await?;
        self.persist_favorites().await?;
        self.persist_credentials().await?;
        self.persist_quota().await
    }

    async fn persist_providers(&self) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let file = ProvidersFile {
            providers: self.registry.list(),
        };
        store::write_toml(&state.providers_file(), &file).await
    }

    async fn persist_favorites(&self) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        store::write_json(&state.favorites_file(), &self.favorites.list()).await
    }

    async fn persist_credentials(&self) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        store::write_json(&state.credentials_file(), &self.credentials.export_metadata()).await
    }

    async fn persist_quota(&self) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        store::write_json(&state.quota_file(), &self.quota.counters()).await
    }

    /// Counters and `last_used_at` change on every send; losing them is not
    /// worth failing the send over.
    async fn persist_usage(&self) {
        if let Err(e) = self.persist_quota().await {
            warn!(error = %e, "failed to persist quota counters");
        }
        if let Err(e) = self.persist_credentials().await {
            warn!(error = %e, "failed to persist credential metadata");
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::adapter::MockTransport;
    use crate::registry::{AuthScheme, ProviderStatus};
    use serde_json::json;
    use tempfile::TempDir;

    const MODELS_URL: &str = "https://acme.test/models";
    const CHAT_URL: &str = "https://acme.test/chat/completions";

    fn acme() -> ProviderConfig {
        ProviderConfig::new("acme", "https://acme.test", AuthScheme::BearerHeader, "Authorization")
    }

    fn mock() -> Arc<MockTransport> {
        let mock = Arc::new(MockTransport::new());
        mock.respond_json(MODELS_URL, 200, json!({ "data": [{ "id": "large" }, { "id": "small" }] }))
            .respond_json(
                CHAT_URL,
                200,
                json!({
                    "choices": [{ "message": { "role": "assistant", "content": "hi" } }],
                    "usage": { "prompt_tokens": 3, "completion_tokens": 4 }
                }),
            );
        mock
    }

    async fn open(dir: &TempDir, mock: Arc<MockTransport>) -> Gateway {
        Gateway::open(
            StateDir::under(dir.path()),
            Arc::new(CredentialStore::in_memory()),
            mock,
            GatewaySettings::default(),
        )
        .await
        .unwrap()
    }

    // ==================== Provider Tests ====================

    #[tokio::test]
    async fn add_provider_verifies_and_persists() {
        let dir = TempDir::new().unwrap();
        let gateway = open(&dir, mock()).await;

        let result = gateway
            .add_provider(acme(), Some(ApiKey::new("sk-test")))
            .await
            .unwrap();

        assert!(result.is_healthy());
        let text = std::fs::read_to_string(dir.path().join("config/providers.toml")).unwrap();
        assert!(text.contains("[[providers]]"));
        assert!(text.contains("healthy"));
        assert!(!text.contains("sk-test"));
    }

    #[tokio::test]
    async fn add_provider_without_secret_is_unauthorized() {
        let dir = TempDir::new().unwrap();
        let gateway = open(&dir, mock()).await;

        let result = gateway.add_provider(acme(), None).await.unwrap();

        assert_eq!(result.status, ProviderStatus::Unauthorized);
        assert!(gateway.get_provider("acme").is_ok());
    }

    #[tokio::test]
    async fn invalid_provider_is_rejected_before_anything_is_stored() {
        let dir = TempDir::new().unwrap();
        let gateway = open(&dir, mock()).await;
        let bad = ProviderConfig::new("acme", "not a url", AuthScheme::BearerHeader, "Authorization");

        let err = gateway
            .add_provider(bad, Some(ApiKey::new("sk")))
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 1);
        assert!(gateway.list_providers().is_empty());
        assert!(!gateway.credentials().has("acme").await);
    }

    #[tokio::test]
    async fn edit_provider_rotates_secret() {
        let dir = TempDir::new().unwrap();
        let mock = mock();
        let gateway = open(&dir, mock.clone()).await;
        gateway
            .add_provider(acme(), Some(ApiKey::new("sk-old")))
            .await
            .unwrap();

        gateway
            .edit_provider("acme", acme().display_name("Acme"), Some(ApiKey::new("sk-new")))
            .await
            .unwrap();

        let last = mock.requests().pop().unwrap();
        assert_eq!(last.header("Authorization"), Some("Bearer sk-new"));
        assert_eq!(gateway.get_provider("acme").unwrap().config.display_name, "Acme");
    }

    // ==================== State Tests ====================

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let gateway = open(&dir, mock()).await;
            gateway
                .add_provider(acme(), Some(ApiKey::new("sk")))
                .await
                .unwrap();
            gateway.refresh_models("acme").await.unwrap();
            gateway.add_favorite("acme", "small").await.unwrap();
            let conv = gateway
                .start_conversation(Some(ModelTarget::new("acme", "large")))
                .await
                .unwrap();
            gateway.send_message(&conv.id, None, "hello").await.unwrap();
            gateway.shutdown().await.unwrap();
        }

        let gateway = open(&dir, mock()).await;

        assert_eq!(gateway.list_providers().len(), 1);
        assert_eq!(gateway.list_favorites()[0].model_id, "small");
        assert_eq!(gateway.list_models(Some("acme")).unwrap().len(), 2);
        assert_eq!(gateway.list_conversations().await.len(), 1);
        let usage = gateway.usage("acme").unwrap();
        assert_eq!(usage[0].count, 1);
        assert_eq!(usage[0].tokens_used, 7);
    }

    #[tokio::test]
    async fn refresh_prunes_favorites_of_vanished_models() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockTransport::new());
        let both = json!({ "data": [{ "id": "large" }, { "id": "small" }] });
        // verify, first refresh, second refresh
        mock.respond_json(MODELS_URL, 200, both.clone())
            .respond_json(MODELS_URL, 200, both)
            .respond_json(MODELS_URL, 200, json!({ "data": [{ "id": "large" }] }));
        let gateway = open(&dir, mock).await;
        gateway
            .add_provider(acme(), Some(ApiKey::new("sk")))
            .await
            .unwrap();
        gateway.refresh_models("acme").await.unwrap();
        gateway.add_favorite("acme", "small").await.unwrap();

        let outcome = gateway.refresh_models("acme").await.unwrap();

        assert_eq!(outcome.removed, vec!["small".to_string()]);
        assert!(gateway.list_favorites().is_empty());
    }

    #[tokio::test]
    async fn list_models_for_unknown_provider_fails() {
        let dir = TempDir::new().unwrap();
        let gateway = open(&dir, mock()).await;
        assert!(matches!(
            gateway.list_models(Some("ghost")),
            Err(Error::ProviderNotFound(_))
        ));
    }
}
