use super::types::{
    CredentialsConfig, DEFAULT_CATALOG_RETRY_ATTEMPTS, DEFAULT_CATALOG_RETRY_BASE_MS,
    DEFAULT_CATALOG_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_REQUEST_TIMEOUT_SECS,
    GatewayConfig, RawCredentialsConfig, RawGatewayConfig, RawSwitchboardConfig,
    SwitchboardConfig,
};
use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<SwitchboardConfig> {
        let mut raw = RawSwitchboardConfig::default();

        // Layer 1: User config
        let user_path = Self::user_config_path();
        if user_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(&user_path)?);
        }

        // Layer 2: Project config
        let project_path = Self::project_config_path();
        if project_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(&project_path)?);
        }

        Self::finalize(raw)
    }

    /// User config path (`$XDG_CONFIG_HOME/switchboard/config.toml`)
    pub fn user_config_path() -> PathBuf {
        switchboard_paths::config_dir().join("config.toml")
    }

    /// Get project config path
    /// Can be overridden with SWITCHBOARD_PROJECT_CONFIG_DIR env var (useful for isolated e2e tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("SWITCHBOARD_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".switchboard/config.toml")
        }
    }

    fn read_raw(path: &Path) -> Result<RawSwitchboardConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config in {}", path.display()))
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawSwitchboardConfig, overlay: RawSwitchboardConfig) -> RawSwitchboardConfig {
        RawSwitchboardConfig {
            gateway: RawGatewayConfig {
                request_timeout_secs: overlay
                    .gateway
                    .request_timeout_secs
                    .or(base.gateway.request_timeout_secs),
                catalog_timeout_secs: overlay
                    .gateway
                    .catalog_timeout_secs
                    .or(base.gateway.catalog_timeout_secs),
                max_concurrent_requests: overlay
                    .gateway
                    .max_concurrent_requests
                    .or(base.gateway.max_concurrent_requests),
                catalog_retry_attempts: overlay
                    .gateway
                    .catalog_retry_attempts
                    .or(base.gateway.catalog_retry_attempts),
                catalog_retry_base_ms: overlay
                    .gateway
                    .catalog_retry_base_ms
                    .or(base.gateway.catalog_retry_base_ms),
            },
            credentials: RawCredentialsConfig {
                backend: overlay.credentials.backend.or(base.credentials.backend),
                env_fallback: overlay
                    .credentials
                    .env_fallback
                    .or(base.credentials.env_fallback),
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawSwitchboardConfig) -> Result<SwitchboardConfig> {
        let defaults = CredentialsConfig::default();
        let config = SwitchboardConfig {
            gateway: GatewayConfig {
                request_timeout_secs: raw
                    .gateway
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
                catalog_timeout_secs: raw
                    .gateway
                    .catalog_timeout_secs
                    .unwrap_or(DEFAULT_CATALOG_TIMEOUT_SECS),
                max_concurrent_requests: raw
                    .gateway
                    .max_concurrent_requests
                    .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS),
                catalog_retry_attempts: raw
                    .gateway
                    .catalog_retry_attempts
                    .unwrap_or(DEFAULT_CATALOG_RETRY_ATTEMPTS),
                catalog_retry_base_ms: raw
                    .gateway
                    .catalog_retry_base_ms
                    .unwrap_or(DEFAULT_CATALOG_RETRY_BASE_MS),
            },
            credentials: CredentialsConfig {
                backend: raw.credentials.backend.unwrap_or(defaults.backend),
                env_fallback: raw.credentials.env_fallback.unwrap_or(defaults.env_fallback),
            },
        };
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &SwitchboardConfig) -> Result<()> {
        let gateway = &config.gateway;
        if gateway.request_timeout_secs == 0 {
            bail!("gateway.request_timeout_secs must be at least 1");
        }
        if gateway.catalog_timeout_secs == 0 {
            bail!("gateway.catalog_timeout_secs must be at least 1");
        }
        if gateway.max_concurrent_requests == 0 {
            bail!("gateway.max_concurrent_requests must be at least 1");
        }
        if gateway.catalog_retry_attempts == 0 {
            bail!("gateway.catalog_retry_attempts must be at least 1");
        }
        Ok(())
    }

    /// Save config to a specific path
    ///
    /// Creates parent directories if they don't exist.
    pub fn save_to_path(config: &SwitchboardConfig, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let toml = toml::to_string_pretty(config)?;
        std::fs::write(path, toml)?;

        Ok(())
    }

    /// Load config from a specific path (for testing)
    #[cfg(test)]
    pub fn load_from_path(path: &Path) -> Result<SwitchboardConfig> {
        if path.exists() {
            Self::finalize(Self::read_raw(path)?)
        } else {
            Ok(SwitchboardConfig::default())
        }
    }
}
