//! Favorite model commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use comfy_table::Cell;
use switchboard_gateway::Gateway;

use super::{Context, open_gateway, parse_target, table};

/// Favorites arguments.
#[derive(Args, Debug)]
pub struct FavoriteArgs {
    #[command(subcommand)]
    pub command: FavoriteCommands,
}

/// Favorites subcommands.
#[derive(Subcommand, Debug)]
pub enum FavoriteCommands {
    /// Mark a cataloged model as a favorite
    Add {
        /// Model as provider/model
        model: String,
    },
    /// Remove a favorite
    Remove {
        /// Model as provider/model
        model: String,
    },
    /// List favorites in rank order
    List,
    /// Move a favorite to a new position (1 is first)
    Move {
        /// Model as provider/model
        model: String,

        /// New position
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        position: u32,
    },
}

/// Run favorite command.
pub async fn run(ctx: &Context, args: FavoriteArgs) -> Result<()> {
    let gateway = open_gateway(ctx).await?;
    let result = dispatch(&gateway, args.command).await;
    gateway.shutdown().await?;
    result
}

async fn dispatch(gateway: &Gateway, command: FavoriteCommands) -> Result<()> {
    match command {
        FavoriteCommands::Add { model } => {
            let target = parse_target(&model)?;
            let entry = gateway
                .add_favorite(&target.provider_id, &target.model_id)
                .await?;
            println!("Added {} at position {}", entry.target(), entry.rank);
        }
        FavoriteCommands::Remove { model } => {
            let target = parse_target(&model)?;
            if gateway
                .remove_favorite(&target.provider_id, &target.model_id)
                .await?
            {
                println!("Removed {target}");
            } else {
                println!("{target} is not a favorite");
            }
        }
        FavoriteCommands::List => {
            let favorites = gateway.list_favorites();
            if favorites.is_empty() {
                println!("No favorites yet.");
            } else {
                let mut table = table(&["#", "Model"]);
                for entry in &favorites {
                    table.add_row(vec![
                        Cell::new(entry.rank),
                        Cell::new(entry.target()),
                    ]);
                }
                println!("{table}");
            }
        }
        FavoriteCommands::Move { model, position } => {
            let target = parse_target(&model)?;
            let entry = gateway
                .move_favorite(&target.provider_id, &target.model_id, position)
                .await?;
            println!("Moved {} to position {}", entry.target(), entry.rank);
        }
    }
    Ok(())
}
