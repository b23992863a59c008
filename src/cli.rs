use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "chatsync",
    about = "Chat sync core: demo run and outbox maintenance"
)]
pub struct Cli {
    /// Path to config file (default: ./chatsync.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a two-user session against the in-process backend
    Demo,
    /// Inspect or clear a user's persisted message queue
    Outbox {
        #[command(subcommand)]
        action: OutboxAction,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum OutboxAction {
    /// List queued messages
    List {
        #[arg(long)]
        user: String,
    },
    /// Remove queued messages
    Purge {
        #[arg(long)]
        user: String,
        /// Only remove messages that exhausted their retries
        #[arg(long)]
        dead_only: bool,
    },
}

impl Cli {
    pub fn command_or_default(&self) -> Command {
        self.command.clone().unwrap_or(Command::Demo)
    }
}
