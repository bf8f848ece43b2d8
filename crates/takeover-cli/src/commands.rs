//! One function per subcommand. Each prints its result record as JSON.

use std::time::Duration;

use anyhow::Result;
use takeover_core::{SendOptions, Takeover, TakeoverError};
use takeover_remote::CdpDocument;
use tracing::{info, warn};

use crate::cli_args::Command;
use crate::utils::print_json;

pub async fn execute(mut engine: Takeover<CdpDocument>, command: Command) -> Result<()> {
    match command {
        Command::Panels => print_json(&engine.list_panels().await),
        Command::State { index } => print_json(&engine.get_panel_state(index).await),
        Command::Extract => print_json(&engine.extract().await?),
        Command::Send {
            index,
            message,
            no_clear,
            no_submit,
        } => {
            let options = SendOptions {
                clear: !no_clear,
                submit: !no_submit,
            };
            print_json(&engine.send(index, &message, options).await)
        }
        Command::Response { index, timeout_ms } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            print_json(&engine.get_response(index, timeout).await)
        }
        Command::Spawn => print_json(&engine.spawn_panel().await),
        Command::Mount => mount_until_interrupted(&mut engine).await,
    }
}

async fn mount_until_interrupted(engine: &mut Takeover<CdpDocument>) -> Result<()> {
    let report = engine.mount().await.map_err(TakeoverError::Mount)?;
    print_json(&report)?;
    info!(mount_id = %report.mount_id, "Mounted; press Ctrl-C to restore the host UI");

    let session = engine.document().session().clone();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if !session.is_connected() {
                    warn!("Connection to the host dropped while mounted");
                    break;
                }
            }
        }
    }

    print_json(&engine.unmount().await)
}
