//! Shared configuration for emslink tools.
//!
//! TOML profiles (one per backend connection), credential resolution
//! (env + keyring + plaintext), and keyring-backed session-token
//! persistence behind the `emslink_api::TokenStore` seam.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use emslink_api::{ConnectionConfig, ReconnectConfig, TokenStore};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no connection configured under '{name}'")]
    NoSuchConnection { name: String },

    #[error("no password configured for connection '{name}'")]
    NoCredentials { name: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Connection used when none is named on the command line.
    pub default_connection: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named backend connections.
    #[serde(default)]
    pub connections: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_connection: Some("default".into()),
            defaults: Defaults::default(),
            connections: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// Delay between reconnection attempts, in seconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,

    /// Consecutive connection failures tolerated before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            reconnect_delay: default_reconnect_delay(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_reconnect_delay() -> u64 {
    1
}
fn default_max_retries() -> u32 {
    10
}

/// One named backend connection.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Backend WebSocket URL (e.g., "ws://192.168.1.50:8085").
    pub url: String,

    /// Password for login (plaintext — prefer keyring or env var).
    pub password: Option<String>,

    /// Environment variable name containing the password.
    pub password_env: Option<String>,

    /// Override reconnection delay (seconds).
    pub reconnect_delay: Option<u64>,

    /// Override retry budget.
    pub max_retries: Option<u32>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "emslink", "emslink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("emslink");
    p
}

// ── Config loading / saving ─────────────────────────────────────────

/// Load the full Config from file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit path (used by tests and `--config`).
pub fn load_config_from(path: &std::path::Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("EMSLINK_").split("_"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &std::path::Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Connection resolution ───────────────────────────────────────────

/// Pick the active connection name: explicit choice, else the config's
/// default, else `"default"`.
pub fn active_connection_name(explicit: Option<&str>, cfg: &Config) -> String {
    explicit
        .map(String::from)
        .or_else(|| cfg.default_connection.clone())
        .unwrap_or_else(|| "default".into())
}

/// Build a `ConnectionConfig` from a named profile.
pub fn connection_config(cfg: &Config, name: &str) -> Result<ConnectionConfig, ConfigError> {
    let profile = cfg
        .connections
        .get(name)
        .ok_or_else(|| ConfigError::NoSuchConnection { name: name.into() })?;

    let url: url::Url = profile.url.parse().map_err(|_| ConfigError::Validation {
        field: "url".into(),
        reason: format!("invalid URL: {}", profile.url),
    })?;

    let mut config = ConnectionConfig::new(name, url);
    config.reconnect = ReconnectConfig {
        delay: Duration::from_secs(
            profile.reconnect_delay.unwrap_or(cfg.defaults.reconnect_delay),
        ),
        max_retries: profile.max_retries.unwrap_or(cfg.defaults.max_retries),
    };
    Ok(config)
}

/// Build `ConnectionConfig`s for every configured connection, for
/// handing to `ConnectionManager::from_configs` at startup.
pub fn all_connection_configs(cfg: &Config) -> Result<Vec<ConnectionConfig>, ConfigError> {
    cfg.connections
        .keys()
        .map(|name| connection_config(cfg, name))
        .collect()
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve a password from the credential chain:
/// profile's `password_env` → `EMSLINK_PASSWORD` → keyring → plaintext.
pub fn resolve_password(profile: &Profile, name: &str) -> Result<SecretString, ConfigError> {
    if let Some(ref env_name) = profile.password_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    if let Ok(val) = std::env::var("EMSLINK_PASSWORD") {
        return Ok(SecretString::from(val));
    }

    if let Ok(entry) = keyring::Entry::new("emslink", &format!("{name}/password")) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    if let Some(ref password) = profile.password {
        return Ok(SecretString::from(password.clone()));
    }

    Err(ConfigError::NoCredentials { name: name.into() })
}

// ── Keyring-backed token store ──────────────────────────────────────

/// Session-token persistence in the system keyring.
///
/// Keys are `"{connection}/token"` under the `emslink` service. Failing
/// keyring operations degrade to "no token" with a warning — a broken
/// secret service must not take the session down.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringTokenStore;

impl KeyringTokenStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(connection: &str) -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new("emslink", &format!("{connection}/token"))
    }
}

impl TokenStore for KeyringTokenStore {
    fn load(&self, connection: &str) -> Option<SecretString> {
        match Self::entry(connection).and_then(|e| e.get_password()) {
            Ok(token) => Some(SecretString::from(token)),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                tracing::warn!(connection, error = %e, "keyring load failed");
                None
            }
        }
    }

    fn save(&self, connection: &str, token: &str) {
        if let Err(e) = Self::entry(connection).and_then(|e| e.set_password(token)) {
            tracing::warn!(connection, error = %e, "keyring save failed");
        }
    }

    fn delete(&self, connection: &str) {
        match Self::entry(connection).and_then(|e| e.delete_credential()) {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(e) => {
                tracing::warn!(connection, error = %e, "keyring delete failed");
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
