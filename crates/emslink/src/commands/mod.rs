//! Command dispatch and shared connection setup.

mod config_cmd;
mod devices;
mod query;
mod session;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use emslink_api::{Connection, Credential, Error as ApiError};
use emslink_config::{KeyringTokenStore, active_connection_name, connection_config};

use crate::cli::{Cli, Command};
use crate::error::CliError;

const AUTH_WAIT: Duration = Duration::from_secs(5);

pub async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Login { password } => session::login(&cli.global, password).await,
        Command::Logout => session::logout(&cli.global).await,
        Command::Devices { output } => devices::run(&cli.global, output).await,
        Command::Watch { device, channels } => watch::run(&cli.global, device, channels).await,
        Command::Query { body, device } => query::run(&cli.global, &body, device).await,
        Command::Config(cmd) => config_cmd::run(&cli.global, cmd),
    }
}

/// Build the connection for the active profile, without connecting.
pub fn build_connection(
    global: &crate::cli::GlobalOpts,
) -> Result<(Connection, emslink_config::Config, String), CliError> {
    let cfg = emslink_config::load_config_or_default();
    let name = active_connection_name(global.connection.as_deref(), &cfg);
    let config = connection_config(&cfg, &name)?;
    let conn = Connection::new(config, Arc::new(KeyringTokenStore::new()));
    Ok((conn, cfg, name))
}

/// Connect and authenticate: stored token first, then the profile's
/// password chain.
pub async fn establish(global: &crate::cli::GlobalOpts) -> Result<Connection, CliError> {
    let (conn, cfg, name) = build_connection(global)?;

    if !conn.connect_with_stored_token().await? {
        let profile = cfg
            .connections
            .get(&name)
            .ok_or_else(|| emslink_config::ConfigError::NoSuchConnection { name: name.clone() })?;
        let password = emslink_config::resolve_password(profile, &name)
            .map_err(|_| CliError::NoCredentials {
                connection: name.clone(),
            })?;
        conn.connect(Some(Credential::Password(password))).await?;
    }

    conn.wait_authenticated(AUTH_WAIT)
        .await
        .map_err(|source| map_auth_error(&name, source))?;
    Ok(conn)
}

/// Translate an authentication-wait failure into a user-facing error.
pub fn map_auth_error(connection: &str, source: ApiError) -> CliError {
    match source {
        ApiError::Authentication { .. } => CliError::AuthFailed {
            connection: connection.to_string(),
            source,
        },
        _ => CliError::ConnectionFailed {
            connection: connection.to_string(),
            source,
        },
    }
}
