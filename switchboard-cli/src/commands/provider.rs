//! Provider management commands.
//!
//! Adding or editing a provider always ends with a verification call; the
//! record is kept either way and the command exits with the matching code.

use std::collections::BTreeMap;

use anyhow::{Context as _, Result, anyhow, bail};
use clap::{Args, Subcommand, ValueEnum};
use comfy_table::{Cell, Color};
use dialoguer::{Confirm, theme::ColorfulTheme};
use switchboard_gateway::registry::{FallbackPolicy, ResetPolicy, ResponseShape, TierLimit};
use switchboard_gateway::{AuthScheme, Gateway, HealthResult, ProviderConfig, ProviderStatus, Tier};

use super::{CommandError, Context, format_source, open_gateway, read_secret, table};

/// Provider management arguments.
#[derive(Args, Debug)]
pub struct ProviderArgs {
    #[command(subcommand)]
    pub command: ProviderCommands,
}

/// Provider subcommands.
#[derive(Subcommand, Debug)]
pub enum ProviderCommands {
    /// Register a provider, store its API key and verify it
    Add(AddArgs),
    /// Change a provider's record or rotate its API key
    Edit(EditArgs),
    /// Remove a provider with its key, models, favorites and usage
    Remove {
        /// Provider id
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// List registered providers
    List,
    /// Check that providers are reachable and accept their keys
    Verify {
        /// Only verify this provider
        id: Option<String>,
    },
    /// Show quota usage for a provider
    Usage {
        /// Provider id
        id: String,
    },
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Provider id (lowercase letters, digits, '-' and '_')
    pub id: String,

    /// Base URL of the provider's API
    #[arg(long)]
    pub base_url: String,

    /// How the API key is attached to requests
    #[arg(long, value_enum, default_value_t = AuthSchemeArg::BearerHeader)]
    pub auth_scheme: AuthSchemeArg,

    /// Header or query parameter name carrying the key
    #[arg(long, default_value = "Authorization")]
    pub auth_header: String,

    #[command(flatten)]
    pub options: RecordOptions,
}

#[derive(Args, Debug)]
pub struct EditArgs {
    /// Provider id
    pub id: String,

    /// New base URL
    #[arg(long)]
    pub base_url: Option<String>,

    /// New auth scheme
    #[arg(long, value_enum)]
    pub auth_scheme: Option<AuthSchemeArg>,

    /// New header or query parameter name
    #[arg(long)]
    pub auth_header: Option<String>,

    /// Drop all configured tier limits before applying --limit
    #[arg(long)]
    pub clear_limits: bool,

    #[command(flatten)]
    pub options: RecordOptions,
}

/// Options shared by `add` and `edit`.
#[derive(Args, Debug, Default)]
pub struct RecordOptions {
    /// Display name
    #[arg(long)]
    pub name: Option<String>,

    /// Wire dialect for chat and model listing
    #[arg(long, value_enum)]
    pub shape: Option<ShapeArg>,

    /// Tier of models without an explicit override
    #[arg(long, value_enum)]
    pub default_tier: Option<TierArg>,

    /// Per-model tier override, MODEL=TIER (repeatable)
    #[arg(long = "model-tier", value_parser = parse_model_tier)]
    pub model_tiers: Vec<(String, Tier)>,

    /// Request limit per tier, TIER=N (repeatable)
    #[arg(long = "limit", value_parser = parse_limit)]
    pub limits: Vec<(Tier, u32)>,

    /// When limits reset
    #[arg(long, value_enum)]
    pub window: Option<WindowArg>,

    /// Model to use once a tier is exhausted, TIER=MODEL (repeatable)
    #[arg(long = "fallback", value_parser = parse_fallback)]
    pub fallbacks: Vec<(Tier, String)>,

    /// Whether exhausted tiers may switch to their fallback model
    #[arg(long, value_enum)]
    pub fallback_policy: Option<FallbackPolicyArg>,

    /// Read the API key from this environment variable instead of prompting
    #[arg(long)]
    pub secret_env: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthSchemeArg {
    BearerHeader,
    NamedHeader,
    QueryParam,
}

impl From<AuthSchemeArg> for AuthScheme {
    fn from(arg: AuthSchemeArg) -> Self {
        match arg {
            AuthSchemeArg::BearerHeader => AuthScheme::BearerHeader,
            AuthSchemeArg::NamedHeader => AuthScheme::NamedHeader,
            AuthSchemeArg::QueryParam => AuthScheme::QueryParam,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShapeArg {
    ChatMessageArray,
    SingleCompletionObject,
}

impl From<ShapeArg> for ResponseShape {
    fn from(arg: ShapeArg) -> Self {
        match arg {
            ShapeArg::ChatMessageArray => ResponseShape::ChatMessageArray,
            ShapeArg::SingleCompletionObject => ResponseShape::SingleCompletionObject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TierArg {
    Free,
    Paid,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Free => Tier::Free,
            TierArg::Paid => Tier::Paid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WindowArg {
    #[value(name = "rolling-24h")]
    Rolling24h,
    CalendarDay,
    None,
}

impl From<WindowArg> for ResetPolicy {
    fn from(arg: WindowArg) -> Self {
        match arg {
            WindowArg::Rolling24h => ResetPolicy::Rolling24h,
            WindowArg::CalendarDay => ResetPolicy::CalendarDay,
            WindowArg::None => ResetPolicy::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FallbackPolicyArg {
    Automatic,
    Disabled,
}

impl From<FallbackPolicyArg> for FallbackPolicy {
    fn from(arg: FallbackPolicyArg) -> Self {
        match arg {
            FallbackPolicyArg::Automatic => FallbackPolicy::Automatic,
            FallbackPolicyArg::Disabled => FallbackPolicy::Disabled,
        }
    }
}

fn parse_tier(s: &str) -> Result<Tier, String> {
    match s {
        "free" => Ok(Tier::Free),
        "paid" => Ok(Tier::Paid),
        other => Err(format!("unknown tier '{other}' (expected free or paid)")),
    }
}

fn split_pair(s: &str) -> Result<(&str, &str), String> {
    s.split_once('=')
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

fn parse_model_tier(s: &str) -> Result<(String, Tier), String> {
    let (model, tier) = split_pair(s)?;
    Ok((model.to_string(), parse_tier(tier)?))
}

fn parse_limit(s: &str) -> Result<(Tier, u32), String> {
    let (tier, n) = split_pair(s)?;
    let n = n
        .parse()
        .map_err(|_| format!("limit must be a non-negative integer, got '{n}'"))?;
    Ok((parse_tier(tier)?, n))
}

fn parse_fallback(s: &str) -> Result<(Tier, String), String> {
    let (tier, model) = split_pair(s)?;
    Ok((parse_tier(tier)?, model.to_string()))
}

impl RecordOptions {
    /// Overlay these options onto `config`.
    fn apply(&self, mut config: ProviderConfig) -> Result<ProviderConfig> {
        if let Some(name) = &self.name {
            config.display_name = name.clone();
        }
        if let Some(shape) = self.shape {
            config.response_shape = shape.into();
        }
        if let Some(tier) = self.default_tier {
            config.default_tier = tier.into();
        }
        for (model, tier) in &self.model_tiers {
            config.model_tiers.insert(model.clone(), *tier);
        }
        if let Some(policy) = self.fallback_policy {
            config.fallback_policy = policy.into();
        }

        let mut limits: BTreeMap<Tier, TierLimit> = config
            .tier_limits
            .drain(..)
            .map(|l| (l.tier, l))
            .collect();
        for (tier, n) in &self.limits {
            let window = self
                .window
                .map(ResetPolicy::from)
                .or_else(|| limits.get(tier).map(|l| l.window_policy))
                .unwrap_or_default();
            let fallback = limits.get(tier).and_then(|l| l.fallback_model_id.clone());
            let mut limit = TierLimit::new(*tier, *n, window);
            limit.fallback_model_id = fallback;
            limits.insert(*tier, limit);
        }
        if let Some(window) = self.window {
            for limit in limits.values_mut() {
                limit.window_policy = window.into();
            }
        }
        for (tier, model) in &self.fallbacks {
            let limit = limits
                .get_mut(tier)
                .ok_or_else(|| anyhow!("--fallback {tier}={model} needs a --limit for the {tier} tier"))?;
            limit.fallback_model_id = Some(model.clone());
        }
        config.tier_limits = limits.into_values().collect();

        Ok(config)
    }
}

/// Run provider command.
pub async fn run(ctx: &Context, args: ProviderArgs) -> Result<()> {
    let gateway = open_gateway(ctx).await?;
    let result = match args.command {
        ProviderCommands::Add(add) => add_provider(&gateway, add).await,
        ProviderCommands::Edit(edit) => edit_provider(&gateway, edit).await,
        ProviderCommands::Remove { id, yes } => remove_provider(&gateway, &id, yes).await,
        ProviderCommands::List => list_providers(&gateway).await,
        ProviderCommands::Verify { id } => verify(&gateway, id.as_deref()).await,
        ProviderCommands::Usage { id } => show_usage(&gateway, &id),
    };
    gateway.shutdown().await?;
    result
}

async fn add_provider(gateway: &Gateway, args: AddArgs) -> Result<()> {
    let config = ProviderConfig::new(
        &args.id,
        &args.base_url,
        args.auth_scheme.into(),
        &args.auth_header,
    );
    let config = args.options.apply(config)?;
    // Reject bad records before prompting for a key.
    config.validate()?;

    let secret = read_secret(&args.id, args.options.secret_env.as_deref())?;
    let result = gateway.add_provider(config, secret).await?;

    println!("Added provider {}", args.id);
    report(&[result])
}

async fn edit_provider(gateway: &Gateway, args: EditArgs) -> Result<()> {
    let mut config = gateway.get_provider(&args.id)?.config;
    if let Some(url) = &args.base_url {
        config.base_url = url.clone();
    }
    if let Some(scheme) = args.auth_scheme {
        config.auth_scheme = scheme.into();
    }
    if let Some(header) = &args.auth_header {
        config.auth_header_name = header.clone();
    }
    if args.clear_limits {
        config.tier_limits.clear();
    }
    let config = args.options.apply(config)?;
    config.validate()?;

    // Only rotate when asked; never prompt on a plain edit.
    let secret = match &args.options.secret_env {
        Some(var) => read_secret(&args.id, Some(var))?,
        None => None,
    };
    let result = gateway.edit_provider(&args.id, config, secret).await?;

    println!("Updated provider {}", args.id);
    report(&[result])
}

async fn remove_provider(
    gateway: &Gateway,
    id: &str,
    yes: bool,
) -> Result<()> {
    gateway.get_provider(id)?;

    if !yes {
        if !std::io::IsTerminal::is_terminal(&std::io::stdin()) {
            bail!("refusing to remove {id} without --yes");
        }
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Remove {id} along with its API key, favorites and usage history?"
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted");
            return Ok(());
        }
    }

    gateway
        .remove_provider(id)
        .await
        .with_context(|| format!("failed to fully remove {id}"))?;
    println!("Removed provider {id}");
    Ok(())
}

async fn list_providers(gateway: &Gateway) -> Result<()> {
    let providers = gateway.list_providers();
    if providers.is_empty() {
        println!("No providers registered. Add one with `switchboard provider add`.");
        return Ok(());
    }

    let mut table = table(&["ID", "Name", "Base URL", "Auth", "Key", "Status", "Checked"]);
    for provider in &providers {
        let source = gateway.credentials().source(provider.id()).await;
        let checked = provider
            .status_checked_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(provider.id()),
            Cell::new(&provider.config.display_name),
            Cell::new(&provider.config.base_url),
            Cell::new(provider.config.auth_scheme),
            Cell::new(format_source(source)),
            status_cell(provider.status),
            Cell::new(checked),
        ]);
    }

    println!("{table}");
    Ok(())
}

async fn verify(gateway: &Gateway, id: Option<&str>) -> Result<()> {
    let results = match id {
        Some(id) => vec![gateway.verify_provider(id).await?],
        None => gateway.verify_all().await?,
    };
    if results.is_empty() {
        println!("No providers registered.");
        return Ok(());
    }
    report(&results)
}

fn show_usage(gateway: &Gateway, id: &str) -> Result<()> {
    let counters = gateway.usage(id)?;
    if counters.is_empty() {
        println!("No usage recorded for {id}");
        return Ok(());
    }

    let mut table = table(&["Tier", "Requests", "Limit", "Tokens", "Window", "Resets"]);
    for counter in &counters {
        let limit = counter
            .limit
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".to_string());
        let resets = counter
            .window_end()
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        table.add_row(vec![
            Cell::new(counter.tier),
            Cell::new(counter.count),
            Cell::new(limit),
            Cell::new(counter.tokens_used),
            Cell::new(counter.reset_policy),
            Cell::new(resets),
        ]);
    }

    println!("{table}");
    Ok(())
}

fn status_cell(status: ProviderStatus) -> Cell {
    let color = match status {
        ProviderStatus::Healthy => Color::Green,
        ProviderStatus::Unverified => Color::Yellow,
        ProviderStatus::Unreachable | ProviderStatus::Unauthorized => Color::Red,
    };
    Cell::new(status).fg(color)
}

/// Print verification results; fail if any provider is unhealthy.
fn report(results: &[HealthResult]) -> Result<()> {
    let mut table = table(&["Provider", "Status", "Latency", "Detail"]);
    for result in results {
        table.add_row(vec![
            Cell::new(&result.provider_id),
            status_cell(result.status),
            Cell::new(format!("{}ms", result.latency.as_millis())),
            Cell::new(result.detail.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");

    let failed: Vec<_> = results.iter().filter(|r| !r.is_healthy()).collect();
    if failed.is_empty() {
        return Ok(());
    }
    let exit_code = if failed
        .iter()
        .any(|r| r.status == ProviderStatus::Unauthorized)
    {
        2
    } else {
        3
    };
    Err(CommandError::Unhealthy {
        failed: failed.len(),
        total: results.len(),
        exit_code,
    }
    .into())
}
