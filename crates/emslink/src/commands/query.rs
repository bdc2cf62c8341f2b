//! `query`: send one query and print the correlated reply.

use serde_json::Value;

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub async fn run(global: &GlobalOpts, body: &str, device: Option<String>) -> Result<(), CliError> {
    let body: Value = serde_json::from_str(body)?;

    let conn = super::establish(global).await?;
    let reply = conn.query(device.as_deref(), body).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&reply).unwrap_or_else(|_| reply.to_string())
    );

    conn.disconnect().await;
    Ok(())
}
