use thiserror::Error;

/// Top-level error type for the `emslink-api` crate.
///
/// Covers every failure mode of the connection client: transport,
/// authentication, request correlation, and addressing. The CLI maps
/// these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The backend explicitly rejected the credential.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// No success or failure reply arrived within the handshake window.
    #[error("Authentication timed out after {timeout_secs}s")]
    AuthenticationTimeout { timeout_secs: u64 },

    // ── Transport ───────────────────────────────────────────────────
    /// WebSocket connection failed (refused, DNS, TLS, handshake).
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// The session was closed, either by `close()` or by exhausting
    /// the reconnection budget.
    #[error("Connection closed")]
    ConnectionClosed,

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Requests ────────────────────────────────────────────────────
    /// No reply carrying the request id arrived in time.
    #[error("Request {request_id} timed out after {timeout_secs}s")]
    RequestTimeout {
        request_id: String,
        timeout_secs: u64,
    },

    // ── Addressing ──────────────────────────────────────────────────
    /// A message was targeted at a device the registry does not know.
    #[error("Device '{name}' not found")]
    DeviceNotFound { name: String },

    /// The manager has no connection under that name.
    #[error("Connection '{name}' not found")]
    ConnectionNotFound { name: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WebSocketConnect(_)
                | Self::AuthenticationTimeout { .. }
                | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if the backend rejected the credential; a fresh
    /// credential is required and retrying the same one is pointless.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}
