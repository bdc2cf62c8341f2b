//! `login` / `logout`: session establishment and teardown.

use secrecy::SecretString;

use emslink_api::{Credential, EventKind};

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub async fn login(global: &GlobalOpts, password: Option<String>) -> Result<(), CliError> {
    let password = match password {
        Some(password) => SecretString::from(password),
        None => prompt_password()?,
    };

    let (conn, _cfg, name) = super::build_connection(global)?;
    let mut events = conn.events();

    conn.connect(Some(Credential::Password(password))).await?;
    conn.wait_authenticated(super::AUTH_WAIT)
        .await
        .map_err(|source| super::map_auth_error(&name, source))?;

    // The success event carries the backend's greeting (username).
    let mut greeting = None;
    while let Ok(event) = events.try_recv() {
        if event.kind == EventKind::Success {
            greeting = Some(event.message.clone());
            break;
        }
    }

    match greeting {
        Some(message) => println!("{name}: {message}, token stored"),
        None => println!("{name}: authenticated, token stored"),
    }

    conn.disconnect().await;
    Ok(())
}

pub async fn logout(global: &GlobalOpts) -> Result<(), CliError> {
    let (conn, _cfg, name) = super::build_connection(global)?;
    // close() discards the stored token even without a live session.
    conn.close().await;
    println!("{name}: logged out, token deleted");
    Ok(())
}

fn prompt_password() -> Result<SecretString, CliError> {
    let password = rpassword::prompt_password("Password: ")?;
    Ok(SecretString::from(password))
}
