//! Conversation commands.
//!
//! Each invocation is a fresh process; conversations live on disk between
//! calls, so `send` can continue a conversation started by `new`.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use comfy_table::Cell;
use switchboard_gateway::{Conversation, Gateway, Message, MessageRole};

use super::{Context, open_gateway, parse_target, table};

/// Conversation arguments.
#[derive(Args, Debug)]
pub struct ConversationArgs {
    #[command(subcommand)]
    pub command: ConversationCommands,
}

/// Conversation subcommands.
#[derive(Subcommand, Debug)]
pub enum ConversationCommands {
    /// Start a conversation
    New {
        /// Model to talk to, as provider/model
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Send a message and print the reply
    Send {
        /// Conversation id
        id: String,

        /// Message text
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,

        /// Model as provider/model; must match once the conversation is bound
        #[arg(short, long)]
        model: Option<String>,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Close a conversation
    Close {
        /// Conversation id
        id: String,
    },
    /// Print a conversation's transcript
    Show {
        /// Conversation id
        id: String,
    },
    /// List conversations
    List,
}

/// Run conversation command.
pub async fn run(ctx: &Context, args: ConversationArgs) -> Result<()> {
    let gateway = open_gateway(ctx).await?;
    let result = dispatch(&gateway, args.command).await;
    gateway.shutdown().await?;
    result
}

async fn dispatch(gateway: &Gateway, command: ConversationCommands) -> Result<()> {
    match command {
        ConversationCommands::New { model } => {
            let target = model.as_deref().map(parse_target).transpose()?;
            let conversation = gateway.start_conversation(target).await?;
            println!("{}", conversation.id);
        }
        ConversationCommands::Send {
            id,
            message,
            model,
            timeout,
        } => {
            let target = model.as_deref().map(parse_target).transpose()?;
            let content = message.join(" ");
            if content.trim().is_empty() {
                bail!("message must not be empty");
            }
            let reply = match timeout {
                Some(0) => bail!("--timeout must be at least 1 second"),
                Some(secs) => {
                    gateway
                        .send_message_with_timeout(&id, target, &content, Duration::from_secs(secs))
                        .await?
                }
                None => gateway.send_message(&id, target, &content).await?,
            };
            print_reply(&reply);
        }
        ConversationCommands::Close { id } => {
            let conversation = gateway.close_conversation(&id).await?;
            println!("Closed {}", conversation.id);
        }
        ConversationCommands::Show { id } => {
            let conversation = gateway.get_conversation(&id).await?;
            print_transcript(&conversation);
        }
        ConversationCommands::List => {
            let conversations = gateway.list_conversations().await;
            if conversations.is_empty() {
                println!("No conversations.");
                return Ok(());
            }
            let mut table = table(&["ID", "Model", "State", "Messages", "Created"]);
            for c in &conversations {
                table.add_row(vec![
                    Cell::new(&c.id),
                    Cell::new(model_label(c)),
                    Cell::new(c.state),
                    Cell::new(c.messages.len()),
                    Cell::new(c.created_at.format("%Y-%m-%d %H:%M")),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

fn model_label(conversation: &Conversation) -> String {
    conversation
        .bound
        .as_ref()
        .or(conversation.target.as_ref())
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_reply(reply: &Message) {
    if let (Some(requested), Some(model)) = (&reply.substituted_from, &reply.model) {
        eprintln!("note: quota reached for {requested}, answered by {model}");
    }
    println!("{}", reply.content);
}

fn print_transcript(conversation: &Conversation) {
    println!(
        "Conversation {} ({}, {})",
        conversation.id,
        model_label(conversation),
        conversation.state
    );
    for message in &conversation.messages {
        let who = match message.role {
            MessageRole::User => "you".to_string(),
            MessageRole::Assistant => match (&message.model, &message.substituted_from) {
                (Some(model), Some(from)) => format!("{model} (instead of {from})"),
                (Some(model), None) => model.clone(),
                _ => "assistant".to_string(),
            },
            MessageRole::Error => "error".to_string(),
        };
        println!(
            "\n[{}] {who}:\n{}",
            message.timestamp.format("%H:%M:%S"),
            message.content
        );
    }
}
