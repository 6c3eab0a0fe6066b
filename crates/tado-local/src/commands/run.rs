//! `run`: keep a gateway session open and print every accepted change.

use tracing::{info, warn};

use tado_local_core::{Bridge, ConnectionState, StateChange, StateStore};

use crate::cli::{GlobalOpts, OutputFormat, RunArgs};
use crate::config;
use crate::error::CliError;
use crate::output;

use super::util;

pub async fn handle(args: RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = config::load(global)?;
    let mut resolved = config::resolve(&cfg)?;
    config::apply_run_overrides(&mut resolved.bridge, &args)?;

    let bridge = Bridge::open(resolved.bridge, resolved.transport).await?;
    let mut changes = bridge.subscribe();
    let mut connection = bridge.connection_state();
    if let Err(e) = bridge.start().await {
        bridge.shutdown().await;
        util::close(&bridge).await;
        return Err(e.into());
    }
    info!(devices = bridge.devices().len(), "bridge running, press Ctrl-C to stop");

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break Ok(());
            }
            change = changes.next_change() => {
                let Some(change) = change else {
                    break Ok(());
                };
                match render_change(global.output, bridge.store(), &change) {
                    Ok(line) => output::print_output(&line, global.quiet),
                    Err(e) => break Err(e),
                }
            }
            Ok(()) = connection.changed() => {
                let state = connection.borrow_and_update().clone();
                match state {
                    ConnectionState::Failed => {
                        break Err(CliError::ConnectionFailed {
                            reason: "gave up reconnecting to the gateway".into(),
                        });
                    }
                    ConnectionState::Reconnecting { attempt } => warn!(attempt, "gateway connection lost"),
                    other => info!(state = ?other, "connection state changed"),
                }
            }
        }
    };

    bridge.shutdown().await;
    util::close(&bridge).await;
    result
}

fn render_change(format: OutputFormat, store: &StateStore, change: &StateChange) -> Result<String, CliError> {
    Ok(match format {
        OutputFormat::Json | OutputFormat::JsonCompact => serde_json::to_string(change)?,
        OutputFormat::Table | OutputFormat::Plain => {
            let previous = change
                .previous_value
                .map_or_else(|| "None".to_owned(), |v| v.to_string());
            format!(
                "{} [{}] {} | {}: {} -> {}",
                change.timestamp.format("%H:%M:%S"),
                change.source,
                store.label(change.device_id),
                change.field,
                previous,
                change.value
            )
        }
    })
}
