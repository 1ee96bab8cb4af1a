//! Model catalog commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use comfy_table::{Cell, Color};
use switchboard_gateway::{Availability, Error, Gateway, Model, PartialCatalog};

use super::{Context, format_context, open_gateway, table};

/// Model catalog arguments.
#[derive(Args, Debug)]
pub struct ModelArgs {
    #[command(subcommand)]
    pub command: ModelCommands,
}

/// Model subcommands.
#[derive(Subcommand, Debug)]
pub enum ModelCommands {
    /// List cataloged models
    List {
        /// Only this provider's models
        #[arg(long)]
        provider: Option<String>,

        /// Only models carrying this capability tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Fetch fresh model lists from providers
    Refresh {
        /// Only refresh this provider
        #[arg(long)]
        provider: Option<String>,
    },
}

/// Run model command.
pub async fn run(ctx: &Context, args: ModelArgs) -> Result<()> {
    let gateway = open_gateway(ctx).await?;
    let result = match args.command {
        ModelCommands::List {
            provider,
            tags,
            json,
        } => list_models(&gateway, provider.as_deref(), &tags, json),
        ModelCommands::Refresh { provider } => refresh(&gateway, provider.as_deref()).await,
    };
    gateway.shutdown().await?;
    result
}

fn list_models(
    gateway: &Gateway,
    provider: Option<&str>,
    tags: &[String],
    json: bool,
) -> Result<()> {
    let models: Vec<Model> = gateway
        .list_models(provider)?
        .into_iter()
        .filter(|m| m.has_tags(tags.iter().map(String::as_str)))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    if models.is_empty() {
        println!("No models found. Run `switchboard model refresh` to fetch catalogs.");
        return Ok(());
    }

    let favorites = gateway.list_favorites();
    let mut table = table(&["Model", "Name", "Context", "Tier", "Tags", "Status"]);
    for model in &models {
        let starred = favorites
            .iter()
            .any(|f| f.provider_id == model.provider_id && f.model_id == model.id);
        let target = model.target().to_string();
        let tags = model
            .capability_tags
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(if starred { format!("* {target}") } else { target }),
            Cell::new(&model.display_name),
            Cell::new(format_context(model.context_window_tokens)),
            Cell::new(model.tier),
            Cell::new(tags),
            availability_cell(model.availability),
        ]);
    }

    println!("{table}");
    println!("\n{} model(s)", models.len());
    Ok(())
}

async fn refresh(gateway: &Gateway, provider: Option<&str>) -> Result<()> {
    let outcomes = match provider {
        Some(id) => vec![gateway.refresh_models(id).await?],
        None => gateway.refresh_all().await?,
    };

    let mut warnings: Vec<PartialCatalog> = Vec::new();
    for outcome in outcomes {
        match outcome.warning {
            Some(warning) => {
                eprintln!("warning: {warning}");
                warnings.push(warning);
            }
            None => println!(
                "{}: {} model(s){}",
                outcome.provider_id,
                outcome.models.len(),
                if outcome.removed.is_empty() {
                    String::new()
                } else {
                    format!(", {} removed", outcome.removed.len())
                }
            ),
        }
    }

    // A partial refresh still served stale data but the exit code reports it.
    match warnings.into_iter().next() {
        Some(first) => Err(Error::PartialCatalog(first).into()),
        None => Ok(()),
    }
}

fn availability_cell(availability: Availability) -> Cell {
    let color = match availability {
        Availability::Listed => Color::Green,
        Availability::Stale => Color::Yellow,
        Availability::Unavailable => Color::Red,
    };
    Cell::new(availability).fg(color)
}
