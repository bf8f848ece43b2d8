//! CLI argument parsing for takeover.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "takeover")]
#[command(about = "Re-skin a chat application's conversation panels over its debugging port")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Override the debugging endpoint host
    #[arg(long)]
    pub host: Option<String>,

    /// Override the debugging endpoint port
    #[arg(long)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List the conversation panels currently in the document
    Panels,

    /// Show one panel's descriptor
    State { index: usize },

    /// Print a full read-only extraction snapshot
    Extract,

    /// Type a message into a panel's compose surface
    Send {
        index: usize,
        message: String,

        /// Append to the existing draft instead of replacing it
        #[arg(long)]
        no_clear: bool,

        /// Leave the message in the compose surface
        #[arg(long)]
        no_submit: bool,
    },

    /// Wait for a panel's transcript to stop changing
    Response {
        index: usize,

        /// Give up after this many milliseconds (default from config)
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Open a new conversation panel through the command entry
    Spawn,

    /// Mount the replacement UI and keep it live until Ctrl-C
    Mount,
}
