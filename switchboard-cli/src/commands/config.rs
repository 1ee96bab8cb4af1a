use crate::commands::Context;
use crate::config::{ConfigLoader, SwitchboardConfig};
use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use switchboard_gateway::StateDir;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show current configuration (merged)
    Show,
    /// Show configuration and state file paths
    Path,
    /// Write a user config with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn run(ctx: &Context, args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show => show_config(),
        ConfigCommands::Path => show_paths(ctx),
        ConfigCommands::Init { force } => init_config(force),
    }
}

fn show_config() -> Result<()> {
    let config = ConfigLoader::load()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{}", toml_str);
    Ok(())
}

fn show_paths(ctx: &Context) -> Result<()> {
    let state = match &ctx.state_dir {
        Some(root) => StateDir::under(root),
        None => StateDir::from_env(),
    };
    println!("User config:    {:?}", ConfigLoader::user_config_path());
    println!("Project config: {:?}", ConfigLoader::project_config_path());
    println!("Providers:      {:?}", state.providers_file());
    println!("Favorites:      {:?}", state.favorites_file());
    println!("Conversations:  {:?}", state.conversations_dir());
    println!("Catalog cache:  {:?}", state.catalog_dir());
    Ok(())
}

fn init_config(force: bool) -> Result<()> {
    let path = ConfigLoader::user_config_path();
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    ConfigLoader::save_to_path(&SwitchboardConfig::default(), &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
