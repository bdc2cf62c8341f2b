//! CLI error types with miette diagnostics.
//!
//! Maps API and config errors into user-facing errors with actionable
//! help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

/// Exit codes.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("Could not connect to backend for '{connection}'")]
    #[diagnostic(
        code(emslink::connection_failed),
        help("Check that the backend is running and the URL in your profile is reachable.")
    )]
    ConnectionFailed {
        connection: String,
        #[source]
        source: emslink_api::Error,
    },

    #[error("Authentication failed for '{connection}'")]
    #[diagnostic(
        code(emslink::auth_failed),
        help("The stored token may have expired. Run: emslink login -c {connection}")
    )]
    AuthFailed {
        connection: String,
        #[source]
        source: emslink_api::Error,
    },

    #[error("No password available for '{connection}'")]
    #[diagnostic(
        code(emslink::no_credentials),
        help(
            "Pass --password, set EMSLINK_PASSWORD, or store a password in the keyring.\n\
             Run: emslink login -c {connection}"
        )
    )]
    NoCredentials { connection: String },

    #[error("No devices announced by '{connection}'")]
    #[diagnostic(
        code(emslink::no_devices),
        help("The backend accepted the login but announced no devices. Check the backend's device configuration.")
    )]
    NoDevices { connection: String },

    #[error(transparent)]
    #[diagnostic(code(emslink::api))]
    Api(#[from] emslink_api::Error),

    #[error(transparent)]
    #[diagnostic(code(emslink::config))]
    Config(#[from] emslink_config::ConfigError),

    #[error("Invalid JSON body: {0}")]
    #[diagnostic(
        code(emslink::invalid_json),
        help("The query body must be a JSON object, e.g. '{{\"query\":{{\"kind\":\"history\"}}}}'")
    )]
    InvalidJson(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(emslink::io))]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::Api(e) => match e {
                emslink_api::Error::RequestTimeout { .. }
                | emslink_api::Error::AuthenticationTimeout { .. } => exit_code::TIMEOUT,
                emslink_api::Error::DeviceNotFound { .. }
                | emslink_api::Error::ConnectionNotFound { .. } => exit_code::NOT_FOUND,
                emslink_api::Error::Authentication { .. } => exit_code::AUTH,
                emslink_api::Error::WebSocketConnect(_)
                | emslink_api::Error::ConnectionClosed => exit_code::CONNECTION,
                _ => exit_code::GENERAL,
            },
            Self::NoDevices { .. }
            | Self::Config(emslink_config::ConfigError::NoSuchConnection { .. }) => {
                exit_code::NOT_FOUND
            }
            Self::InvalidJson(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_devices_names_the_connection() {
        let err = CliError::NoDevices {
            connection: "home".into(),
        };
        assert_eq!(err.exit_code(), exit_code::NOT_FOUND);
        assert_eq!(err.to_string(), "No devices announced by 'home'");
    }

    #[test]
    fn timeouts_map_to_the_timeout_exit_code() {
        let err = CliError::Api(emslink_api::Error::RequestTimeout {
            request_id: "r1".into(),
            timeout_secs: 10,
        });
        assert_eq!(err.exit_code(), exit_code::TIMEOUT);
    }
}
