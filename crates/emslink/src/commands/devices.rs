//! `devices`: list the devices announced by the backend.

use std::time::Duration;

use tokio::time::timeout;

use crate::cli::{GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

/// How long to wait for the first metadata announcement after auth.
const METADATA_WAIT: Duration = Duration::from_secs(3);

pub async fn run(global: &GlobalOpts, format: OutputFormat) -> Result<(), CliError> {
    let conn = super::establish(global).await?;

    // Metadata usually follows the auth grant within milliseconds, but
    // is its own message: wait for the registry to populate.
    let mut changes = conn.registry_changes();
    let _ = timeout(METADATA_WAIT, async {
        while conn.devices().is_empty() {
            if changes.changed().await.is_err() {
                break;
            }
        }
    })
    .await;

    let mut devices = conn.devices();
    devices.sort_by(|a, b| a.name().cmp(b.name()));

    match format {
        OutputFormat::Table => println!("{}", output::device_table(&devices)),
        OutputFormat::Json => println!("{}", output::device_json(&devices)),
    }

    conn.disconnect().await;
    Ok(())
}
