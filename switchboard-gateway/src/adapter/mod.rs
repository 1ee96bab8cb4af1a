//! Translation between the gateway's generic requests and each provider's wire format.
//!
//! The adapter is stateless apart from a concurrency limit and the usage
//! broadcast. For every call it:
//!
//! 1. builds the endpoint URL from the provider's base URL and [`ResponseShape`]
//! 2. attaches exactly one auth artifact according to [`AuthScheme`]
//! 3. executes through the injected [`HttpTransport`]
//! 4. maps the status and parses the body for the declared shape
//!
//! ```text
//!  send(provider, model, messages, key)
//!        │
//!        ▼
//!  ┌──────────────┐   WireRequest    ┌───────────────┐
//!  │ AdapterLayer │ ───────────────▶ │ HttpTransport │ ──▶ provider
//!  │  (semaphore) │ ◀─────────────── │ reqwest/mock  │
//!  └──────────────┘   WireResponse   └───────────────┘
//!        │
//!        ├──▶ Completion
//!        └──▶ UsageEvent (broadcast)
//! ```

mod message;
mod mock;
mod transport;
mod wire;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, warn};
use url::Url;

pub use message::{CatalogPage, ChatMessage, Completion, Role, Usage, UsageEvent};
pub use mock::MockTransport;
pub use transport::{
    ConnectivityKind, HttpTransport, Method, ReqwestTransport, TransportError, WireRequest,
    WireResponse, redacted_url,
};

use crate::auth::ApiKey;
use crate::error::QuotaSource;
use crate::registry::{AuthScheme, ProviderConfig};
use crate::types::Tier;
use crate::{Error, Result};

/// Default cap on concurrent outbound calls.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;

/// Default per-request timeout for chat calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const USAGE_CHANNEL_CAPACITY: usize = 256;

/// Builds, sends and parses provider requests.
pub struct AdapterLayer {
    transport: Arc<dyn HttpTransport>,
    permits: Arc<Semaphore>,
    request_timeout: Duration,
    usage_tx: broadcast::Sender<UsageEvent>,
}

impl AdapterLayer {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        let (usage_tx, _) = broadcast::channel(USAGE_CHANNEL_CAPACITY);
        Self {
            transport,
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_REQUESTS)),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            usage_tx,
        }
    }

    /// Cap concurrent outbound calls across all providers.
    pub fn with_max_concurrency(mut self, permits: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Receive a [`UsageEvent`] for every successful send.
    pub fn subscribe_usage(&self) -> broadcast::Receiver<UsageEvent> {
        self.usage_tx.subscribe()
    }

    /// Build the chat request for a model, auth attached.
    pub fn build_chat_request(
        &self,
        provider: &ProviderConfig,
        model_id: &str,
        messages: &[ChatMessage],
        key: &ApiKey,
    ) -> Result<WireRequest> {
        let url = endpoint(provider, wire::chat_path(provider.response_shape))?;
        let mut request = WireRequest::new(Method::Post, url);
        request.body = Some(wire::chat_body(
            provider.response_shape,
            model_id,
            messages,
        ));
        request.timeout = Some(self.request_timeout);
        apply_auth(provider, &mut request, key);
        Ok(request)
    }

    /// Build the request for one catalog page, auth attached.
    pub fn build_catalog_request(
        &self,
        provider: &ProviderConfig,
        cursor: Option<&str>,
        key: &ApiKey,
    ) -> Result<WireRequest> {
        let mut url = endpoint(provider, wire::catalog_path(provider.response_shape))?;
        if let (Some(cursor), Some(param)) = (cursor, wire::cursor_param(provider.response_shape))
        {
            url.query_pairs_mut().append_pair(param, cursor);
        }
        let mut request = WireRequest::new(Method::Get, url);
        apply_auth(provider, &mut request, key);
        Ok(request)
    }

    /// Send a chat request and parse the completion.
    ///
    /// Never retried: a failed send is reported to the caller as-is.
    pub async fn send(
        &self,
        provider: &ProviderConfig,
        model_id: &str,
        messages: &[ChatMessage],
        key: &ApiKey,
    ) -> Result<Completion> {
        let tier = provider.tier_for(model_id);
        let request = self.build_chat_request(provider, model_id, messages, key)?;
        debug!(provider_id = %provider.id, model = model_id, "sending chat request");

        let response = self.execute(provider, request, Some(tier)).await?;
        let completion = wire::parse_chat(provider.response_shape, &response.body)
            .map_err(|reason| shape_error(provider, reason))?;

        // No subscribers is fine.
        let _ = self.usage_tx.send(UsageEvent {
            provider_id: provider.id.clone(),
            model_id: model_id.to_string(),
            tier,
            usage: completion.usage,
            at: Utc::now(),
        });
        Ok(completion)
    }

    /// Fetch one page of the provider's model listing.
    pub async fn fetch_catalog_page(
        &self,
        provider: &ProviderConfig,
        cursor: Option<&str>,
        key: &ApiKey,
    ) -> Result<CatalogPage> {
        let request = self.build_catalog_request(provider, cursor, key)?;
        debug!(provider_id = %provider.id, cursor, "fetching catalog page");

        let response = self.execute(provider, request, None).await?;
        wire::parse_catalog(provider, &response.body).map_err(|reason| shape_error(provider, reason))
    }

    async fn execute(
        &self,
        provider: &ProviderConfig,
        request: WireRequest,
        tier: Option<Tier>,
    ) -> Result<WireResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;

        let response = self.transport.execute(request).await.map_err(|source| {
            warn!(provider_id = %provider.id, error = %source, "request failed");
            Error::Connectivity {
                provider_id: provider.id.clone(),
                source,
            }
        })?;

        if response.is_success() {
            return Ok(response);
        }
        match response.status {
            401 | 403 => Err(Error::Authentication {
                provider_id: provider.id.clone(),
                status: response.status,
            }),
            429 => Err(Error::QuotaExceeded {
                provider_id: provider.id.clone(),
                tier,
                origin: QuotaSource::Remote,
                retry_after_secs: response.retry_after_secs(),
            }),
            status => {
                warn!(provider_id = %provider.id, status, "provider returned error status");
                Err(Error::ProviderApi {
                    provider_id: provider.id.clone(),
                    status,
                })
            }
        }
    }
}

/// `base_url` joined with `path`, treating the base as a directory.
fn endpoint(provider: &ProviderConfig, path: &str) -> Result<Url> {
    let mut base = provider.url()?;
    if !base.path().ends_with('/') {
        let dir = format!("{}/", base.path());
        base.set_path(&dir);
    }
    base.join(path)
        .map_err(|e| Error::invalid_config(Some(&provider.id), "base_url", e.to_string()))
}

/// Attach the one auth artifact the provider's scheme calls for.
fn apply_auth(provider: &ProviderConfig, request: &mut WireRequest, key: &ApiKey) {
    match provider.auth_scheme {
        AuthScheme::BearerHeader => request.headers.push((
            "Authorization".to_string(),
            format!("Bearer {}", key.expose_secret()),
        )),
        AuthScheme::NamedHeader => request.headers.push((
            provider.auth_header_name.clone(),
            key.expose_secret().to_string(),
        )),
        AuthScheme::QueryParam => {
            request
                .url
                .query_pairs_mut()
                .append_pair(&provider.auth_header_name, key.expose_secret());
        }
    }
}

fn shape_error(provider: &ProviderConfig, reason: String) -> Error {
    warn!(provider_id = %provider.id, shape = %provider.response_shape, %reason, "unexpected response body");
    Error::ResponseShape {
        provider_id: provider.id.clone(),
        shape: provider.response_shape,
        reason,
    }
}
