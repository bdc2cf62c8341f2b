//! Token persistence: an opaque session token per connection name.
//!
//! Read on startup for silent re-login, overwritten on every successful
//! authentication that returns a fresh token, deleted on explicit close
//! or authentication failure. The keyring-backed implementation lives in
//! `emslink-config`; this crate only defines the seam and an in-memory
//! store for tests.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use secrecy::{ExposeSecret, SecretString};

/// Key-value persistence for session tokens, keyed by connection name.
///
/// Implementations are expected to be tolerant: a failing backing store
/// should log and degrade to "no token" rather than fail the session.
pub trait TokenStore: Send + Sync {
    fn load(&self, connection: &str) -> Option<SecretString>;
    fn save(&self, connection: &str, token: &str);
    fn delete(&self, connection: &str);
}

/// In-memory token store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, connection: &str) -> Option<SecretString> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection)
            .map(|t| SecretString::from(t.clone()))
    }

    fn save(&self, connection: &str, token: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection.to_string(), token.to_string());
    }

    fn delete(&self, connection: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_overwrites_previous_token() {
        let store = MemoryTokenStore::new();
        store.save("A", "tok1");
        store.save("A", "tok2");
        assert_eq!(store.load("A").expect("token stored").expose_secret(), "tok2");
    }

    #[test]
    fn delete_removes_token() {
        let store = MemoryTokenStore::new();
        store.save("A", "tok1");
        store.delete("A");
        assert!(store.load("A").is_none());
        // Idempotent.
        store.delete("A");
    }

    #[test]
    fn connections_are_isolated() {
        let store = MemoryTokenStore::new();
        store.save("A", "tok-a");
        assert!(store.load("B").is_none());
    }
}
