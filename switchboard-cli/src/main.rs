use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "switchboard", about = "One front door to many model providers")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Keep all state under this directory
    #[arg(long, global = true, env = "SWITCHBOARD_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage providers and their API keys
    Provider(commands::provider::ProviderArgs),
    /// List and refresh model catalogs
    Model(commands::model::ModelArgs),
    /// Manage favorite models
    Favorite(commands::favorite::FavoriteArgs),
    /// Talk to a model
    Conversation(commands::conversation::ConversationArgs),
    /// Manage configuration
    Config(commands::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = commands::Context {
        state_dir: cli.state_dir,
    };

    match cli.command {
        Commands::Provider(args) => commands::provider::run(&ctx, args).await,
        Commands::Model(args) => commands::model::run(&ctx, args).await,
        Commands::Favorite(args) => commands::favorite::run(&ctx, args).await,
        Commands::Conversation(args) => commands::conversation::run(&ctx, args).await,
        Commands::Config(args) => commands::config::run(&ctx, args),
    }
}

/// Map an error chain to the process exit code.
///
/// `1` validation, `2` authentication, `3` connectivity, `4` quota.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<switchboard_gateway::Error>() {
            return e.exit_code() as u8;
        }
        if let Some(e) = cause.downcast_ref::<commands::CommandError>() {
            return e.exit_code() as u8;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;
    use clap::CommandFactory;
    use switchboard_gateway::{Error, QuotaSource};

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_provider_add() {
        let cli = Cli::try_parse_from([
            "switchboard",
            "provider",
            "add",
            "acme",
            "--base-url",
            "https://api.acme.test/v1",
            "--auth-scheme",
            "named-header",
            "--auth-header",
            "x-api-key",
            "--limit",
            "paid=50",
            "--fallback",
            "paid=model-mini",
            "--window",
            "rolling-24h",
        ])
        .unwrap();

        match cli.command {
            Commands::Provider(args) => match args.command {
                commands::provider::ProviderCommands::Add(add) => {
                    assert_eq!(add.id, "acme");
                    assert_eq!(add.auth_header, "x-api-key");
                    assert_eq!(add.options.limits.len(), 1);
                    assert_eq!(add.options.fallbacks[0].1, "model-mini");
                }
                other => panic!("unexpected command {other:?}"),
            },
            _ => panic!("expected provider command"),
        }
    }

    #[test]
    fn parses_global_state_dir_after_subcommand() {
        let cli = Cli::try_parse_from([
            "switchboard",
            "model",
            "list",
            "--provider",
            "acme",
            "--state-dir",
            "/tmp/sb",
        ])
        .unwrap();
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/sb")));
    }

    #[test]
    fn send_requires_a_message() {
        assert!(Cli::try_parse_from(["switchboard", "conversation", "send", "c1"]).is_err());
    }

    #[test]
    fn exit_code_from_gateway_error_through_context() {
        let err = Err::<(), _>(Error::QuotaExceeded {
            provider_id: "acme".to_string(),
            tier: None,
            origin: QuotaSource::Local,
            retry_after_secs: None,
        })
        .context("sending message")
        .unwrap_err();
        assert_eq!(exit_code(&err), 4);
    }

    #[test]
    fn exit_code_for_auth_and_validation() {
        let auth: anyhow::Error = Error::CredentialNotFound {
            provider_id: "acme".to_string(),
        }
        .into();
        assert_eq!(exit_code(&auth), 2);

        let invalid: anyhow::Error = Error::invalid_config(Some("acme"), "id", "bad").into();
        assert_eq!(exit_code(&invalid), 1);
    }

    #[test]
    fn exit_code_from_command_error() {
        let err: anyhow::Error = commands::CommandError::Unhealthy {
            failed: 1,
            total: 1,
            exit_code: 3,
        }
        .into();
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn plain_errors_are_validation() {
        assert_eq!(exit_code(&anyhow::anyhow!("bad flag")), 1);
    }
}
