//! Subcommand implementations and the helpers they share.

pub mod config;
pub mod conversation;
pub mod favorite;
pub mod model;
pub mod provider;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use dialoguer::{Password, theme::ColorfulTheme};
use switchboard_gateway::auth::{
    CredentialSource, KeyringBackend, MemoryBackend, SecretBackend, env_var_for_provider,
};
use switchboard_gateway::{
    ApiKey, CredentialStore, Gateway, ModelTarget, ReqwestTransport, StateDir,
};
use tracing::debug;

use crate::config::{ConfigLoader, CredentialBackend, KEYRING_SERVICE};

/// Options every subcommand sees.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Keep all state under this directory instead of the XDG locations.
    pub state_dir: Option<PathBuf>,
}

/// A command that ran but must still exit non-zero.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{failed} of {total} provider(s) failed verification")]
    Unhealthy {
        failed: usize,
        total: usize,
        exit_code: i32,
    },
}

impl CommandError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Unhealthy { exit_code, .. } => *exit_code,
        }
    }
}

/// Open the gateway over the configured credential backend and state dir.
pub async fn open_gateway(ctx: &Context) -> Result<Gateway> {
    let config = ConfigLoader::load()?;

    let backend: Arc<dyn SecretBackend> = match config.credentials.backend {
        CredentialBackend::Keyring => Arc::new(KeyringBackend::new(KEYRING_SERVICE)),
        CredentialBackend::Memory => Arc::new(MemoryBackend::new()),
    };
    let mut credentials = CredentialStore::new(backend);
    if config.credentials.env_fallback {
        credentials = credentials.with_env_fallback();
    }

    let state = match &ctx.state_dir {
        Some(root) => StateDir::under(root),
        None => StateDir::from_env(),
    };
    debug!(?state, backend = ?config.credentials.backend, "opening gateway");

    let gateway = Gateway::open(
        state,
        Arc::new(credentials),
        Arc::new(ReqwestTransport::new()),
        config.gateway.settings(),
    )
    .await?;
    Ok(gateway)
}

/// Parse `provider/model`.
pub fn parse_target(s: &str) -> Result<ModelTarget> {
    ModelTarget::parse(s).ok_or_else(|| anyhow!("expected <provider>/<model>, got '{s}'"))
}

/// Obtain a secret from `--secret-env`, or by prompting on a terminal.
///
/// Returns `None` when neither is available.
pub fn read_secret(provider_id: &str, secret_env: Option<&str>) -> Result<Option<ApiKey>> {
    if let Some(var) = secret_env {
        let value = std::env::var(var)
            .with_context(|| format!("environment variable {var} is not set"))?;
        if value.trim().is_empty() {
            bail!("environment variable {var} is empty");
        }
        return Ok(Some(ApiKey::new(value.trim())));
    }

    if !std::io::stdin().is_terminal() {
        return Ok(None);
    }

    println!(
        "Enter API key for {provider_id} (leave empty to use {})",
        env_var_for_provider(provider_id)
    );
    let key = Password::with_theme(&ColorfulTheme::default())
        .with_prompt("API key")
        .allow_empty_password(true)
        .interact()?;
    Ok((!key.is_empty()).then(|| ApiKey::new(key)))
}

/// A table with the CLI's house style and cyan headers.
pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    table
}

pub fn format_source(source: Option<CredentialSource>) -> &'static str {
    match source {
        Some(CredentialSource::Keyring) => "keyring",
        Some(CredentialSource::Memory) => "memory",
        Some(CredentialSource::Environment) => "environment",
        None => "-",
    }
}

/// Format context window size.
pub fn format_context(tokens: u32) -> String {
    if tokens >= 1_000_000 {
        format!("{}M", tokens / 1_000_000)
    } else if tokens >= 1_000 {
        format!("{}K", tokens / 1_000)
    } else {
        format!("{}", tokens)
    }
}
