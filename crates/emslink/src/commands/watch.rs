//! `watch`: stream messages for one device until Ctrl-C.

use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use crate::cli::GlobalOpts;
use crate::error::CliError;

const METADATA_WAIT: Duration = Duration::from_secs(3);

pub async fn run(
    global: &GlobalOpts,
    device: Option<String>,
    channels: Vec<String>,
) -> Result<(), CliError> {
    let conn = super::establish(global).await?;

    // Resolve the target: named device, or the sole announced one.
    let mut changes = conn.registry_changes();
    let _ = timeout(METADATA_WAIT, async {
        while conn.devices().is_empty() {
            if changes.changed().await.is_err() {
                break;
            }
        }
    })
    .await;

    let target = match device {
        Some(ref name) => conn.device(name)?,
        None => {
            let mut devices = conn.devices();
            devices.sort_by(|a, b| a.name().cmp(b.name()));
            devices.into_iter().next().ok_or_else(|| CliError::NoDevices {
                connection: conn.name().to_string(),
            })?
        }
    };

    if !channels.is_empty() {
        conn.subscribe_channels(Some(target.name()), json!(channels))?;
    }

    tracing::info!(device = target.name(), "watching, Ctrl-C to stop");
    let mut messages = target.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = messages.recv() => {
                match message {
                    Ok(message) => println!("{message}"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "output too slow, dropped messages");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    conn.disconnect().await;
    Ok(())
}
