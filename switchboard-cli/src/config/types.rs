use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchboard_gateway::GatewaySettings;
use switchboard_gateway::catalog::CatalogSettings;

/// Default per-request timeout for chat calls, in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default bound on one provider's catalog refresh, in seconds
pub const DEFAULT_CATALOG_TIMEOUT_SECS: u64 = 10;

/// Default cap on concurrent outbound calls
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;

/// Default attempts per catalog page, including the first
pub const DEFAULT_CATALOG_RETRY_ATTEMPTS: u32 = 3;

/// Default base delay of the catalog retry backoff, in milliseconds
pub const DEFAULT_CATALOG_RETRY_BASE_MS: u64 = 250;

/// Keyring service name credentials are stored under
pub const KEYRING_SERVICE: &str = "switchboard";

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawSwitchboardConfig {
    #[serde(default)]
    pub gateway: RawGatewayConfig,

    #[serde(default)]
    pub credentials: RawCredentialsConfig,
}

/// Gateway config as stored in TOML (optional fields for proper merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawGatewayConfig {
    pub request_timeout_secs: Option<u64>,
    pub catalog_timeout_secs: Option<u64>,
    pub max_concurrent_requests: Option<usize>,
    pub catalog_retry_attempts: Option<u32>,
    pub catalog_retry_base_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawCredentialsConfig {
    pub backend: Option<CredentialBackend>,
    pub env_fallback: Option<bool>,
}

/// Final configuration with defaults applied
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Per-request timeout for chat calls
    pub request_timeout_secs: u64,

    /// Bound on one provider's catalog refresh or health check
    pub catalog_timeout_secs: u64,

    /// Cap on concurrent outbound calls
    pub max_concurrent_requests: usize,

    /// Attempts per catalog page on connectivity failures
    pub catalog_retry_attempts: u32,

    /// Base delay of the catalog retry backoff
    pub catalog_retry_base_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            catalog_timeout_secs: DEFAULT_CATALOG_TIMEOUT_SECS,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            catalog_retry_attempts: DEFAULT_CATALOG_RETRY_ATTEMPTS,
            catalog_retry_base_ms: DEFAULT_CATALOG_RETRY_BASE_MS,
        }
    }
}

impl GatewayConfig {
    pub fn settings(&self) -> GatewaySettings {
        GatewaySettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_concurrent_requests: self.max_concurrent_requests,
            catalog: CatalogSettings {
                timeout: Duration::from_secs(self.catalog_timeout_secs),
                retry_attempts: self.catalog_retry_attempts,
                retry_base: Duration::from_millis(self.catalog_retry_base_ms),
            },
        }
    }
}

/// Where provider secrets live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    /// System keyring
    #[default]
    Keyring,
    /// Process memory only; secrets must come from the environment
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialsConfig {
    pub backend: CredentialBackend,

    /// Fall back to `<PROVIDER_ID>_API_KEY` when no secret is stored
    pub env_fallback: bool,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            backend: CredentialBackend::Keyring,
            env_fallback: true,
        }
    }
}
