use anyhow::Result;
use serde::Serialize;
use takeover_config::Config;

use crate::cli_args::Cli;

pub fn initialize_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = if verbose { "debug" } else { "warn" };
    let cli_target = env!("CARGO_PKG_NAME").replace('-', "_");
    let mut filter = EnvFilter::from_default_env();
    for target in ["takeover", cli_target.as_str(), "takeover_core", "takeover_remote"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

pub fn load_config_with_cli_overrides(cli: &Cli) -> Result<Config> {
    Config::load_with_overrides(cli.config.as_deref(), cli.host.clone(), cli.port)
}

/// Result records go to stdout as pretty JSON; logs go to stderr
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
