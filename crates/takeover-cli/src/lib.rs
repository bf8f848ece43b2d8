//! takeover CLI - thin front end over the takeover engine.

mod cli_args;
mod commands;
mod utils;

use anyhow::Result;
use clap::Parser;
use tracing::debug;

use takeover_core::{Takeover, TakeoverError};

pub use cli_args::{Cli, Command};
use utils::{initialize_logging, load_config_with_cli_overrides};

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    initialize_logging(cli.verbose);

    let config = load_config_with_cli_overrides(&cli)?;
    debug!(endpoint = %config.endpoint_url(), "Loaded configuration");

    let doc = takeover_remote::attach(&config.remote)
        .await
        .map_err(|e| TakeoverError::Connection(e.to_string()))?;
    let engine = Takeover::new(doc.clone(), config);

    let result = commands::execute(engine, cli.command).await;
    doc.session().disconnect().await;
    result
}
