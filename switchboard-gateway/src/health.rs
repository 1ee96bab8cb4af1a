//! Provider health verification.
//!
//! A health check is the cheapest authenticated call a provider offers: the
//! first page of its model listing. The result is written back to the
//! registry as the provider's status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::adapter::{AdapterLayer, ConnectivityKind, TransportError};
use crate::auth::CredentialStore;
use crate::catalog::DEFAULT_CATALOG_TIMEOUT;
use crate::registry::{ProviderRegistry, ProviderStatus};
use crate::{Error, Result};

/// Outcome of verifying one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthResult {
    pub provider_id: String,
    pub status: ProviderStatus,
    pub checked_at: DateTime<Utc>,
    pub latency: Duration,
    /// Why the provider is not healthy, or a note about a healthy one.
    pub detail: Option<String>,
}

impl HealthResult {
    pub fn is_healthy(&self) -> bool {
        self.status == ProviderStatus::Healthy
    }
}

/// Runs verification calls and records their outcome.
pub struct HealthChecker {
    adapter: Arc<AdapterLayer>,
    registry: Arc<ProviderRegistry>,
    credentials: Arc<CredentialStore>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        adapter: Arc<AdapterLayer>,
        registry: Arc<ProviderRegistry>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            adapter,
            registry,
            credentials,
            timeout: DEFAULT_CATALOG_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Verify one provider and store the resulting status.
    ///
    /// # Errors
    ///
    /// Only `Error::ProviderNotFound`; every failure of the call itself is
    /// reported through the returned status.
    pub async fn verify(&self, provider_id: &str) -> Result<HealthResult> {
        let provider = self.registry.get(provider_id)?;
        let started = Instant::now();

        let outcome = match self.credentials.get(provider_id).await {
            Ok(key) => {
                let probe = self.adapter.fetch_catalog_page(&provider.config, None, &key);
                match tokio::time::timeout(self.timeout, probe).await {
                    Ok(result) => result.map(|_| ()),
                    Err(_) => Err(Error::Connectivity {
                        provider_id: provider_id.to_string(),
                        source: TransportError::new(
                            ConnectivityKind::Timeout,
                            format!("no answer within {}s", self.timeout.as_secs()),
                        ),
                    }),
                }
            }
            Err(e) => Err(e),
        };
        let latency = started.elapsed();

        let (status, detail) = classify(outcome);
        self.registry.set_status(provider_id, status).await?;

        match status {
            ProviderStatus::Healthy => {
                info!(provider_id, latency_ms = latency.as_millis() as u64, "provider healthy")
            }
            _ => warn!(provider_id, %status, detail = detail.as_deref(), "provider unhealthy"),
        }

        Ok(HealthResult {
            provider_id: provider_id.to_string(),
            status,
            checked_at: Utc::now(),
            latency,
            detail,
        })
    }

    /// Verify every registered provider concurrently.
    pub async fn verify_all(&self) -> Vec<HealthResult> {
        let ids = self.registry.ids();
        join_all(ids.iter().map(|id| self.verify(id)))
            .await
            .into_iter()
            .filter_map(|result| result.ok())
            .collect()
    }
}

/// Map a probe outcome to a provider status.
fn classify(outcome: Result<()>) -> (ProviderStatus, Option<String>) {
    match outcome {
        Ok(()) => (ProviderStatus::Healthy, None),
        // Rate limited means the key was accepted.
        Err(e @ Error::QuotaExceeded { .. }) => (ProviderStatus::Healthy, Some(e.to_string())),
        Err(e @ (Error::Authentication { .. } | Error::CredentialNotFound { .. })) => {
            (ProviderStatus::Unauthorized, Some(e.to_string()))
        }
        Err(e) => (ProviderStatus::Unreachable, Some(e.to_string())),
    }
}
