//! Explicit connection manager: constructed once at startup, torn down
//! at shutdown, passed by reference to consumers. No hidden singleton
//! state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::Error;
use crate::token::TokenStore;

/// Owns one [`Connection`] per configured backend, keyed by name.
pub struct ConnectionManager {
    connections: HashMap<String, Connection>,
    token_store: Arc<dyn TokenStore>,
}

impl ConnectionManager {
    pub fn new(token_store: Arc<dyn TokenStore>) -> Self {
        Self {
            connections: HashMap::new(),
            token_store,
        }
    }

    /// Build a manager from static configuration.
    pub fn from_configs(
        configs: impl IntoIterator<Item = ConnectionConfig>,
        token_store: Arc<dyn TokenStore>,
    ) -> Self {
        let mut manager = Self::new(token_store);
        for config in configs {
            manager.add(config);
        }
        manager
    }

    /// Register a connection. Replaces any existing connection with the
    /// same name (the replaced handle stays valid for holders until
    /// they drop it).
    pub fn add(&mut self, config: ConnectionConfig) -> Connection {
        let connection = Connection::new(config, self.token_store.clone());
        self.connections
            .insert(connection.name().to_string(), connection.clone());
        connection
    }

    /// The connection with that name, if configured.
    pub fn get(&self, name: &str) -> Result<Connection, Error> {
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ConnectionNotFound { name: name.into() })
    }

    pub fn names(&self) -> Vec<&str> {
        self.connections.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// End every session. Called at application shutdown.
    ///
    /// Stored tokens are kept so the next startup can re-login silently;
    /// deleting a token is reserved for explicit logout via
    /// [`Connection::close`].
    pub async fn shutdown_all(&self) {
        for connection in self.connections.values() {
            connection.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{MemoryTokenStore, TokenStore};

    fn config(name: &str) -> ConnectionConfig {
        ConnectionConfig::new(name, "ws://127.0.0.1:9/".parse().expect("valid test url"))
    }

    #[tokio::test]
    async fn get_returns_registered_connection() {
        let mut manager = ConnectionManager::new(Arc::new(MemoryTokenStore::new()));
        manager.add(config("A"));

        assert_eq!(manager.get("A").expect("registered").name(), "A");
        assert!(matches!(
            manager.get("B"),
            Err(Error::ConnectionNotFound { name }) if name == "B"
        ));
    }

    #[tokio::test]
    async fn from_configs_registers_all() {
        let manager = ConnectionManager::from_configs(
            vec![config("A"), config("B")],
            Arc::new(MemoryTokenStore::new()),
        );
        assert_eq!(manager.len(), 2);
        let mut names = manager.names();
        names.sort_unstable();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn shutdown_all_is_safe_on_idle_connections() {
        let manager = ConnectionManager::from_configs(
            vec![config("A")],
            Arc::new(MemoryTokenStore::new()),
        );
        manager.shutdown_all().await;
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn shutdown_all_preserves_stored_tokens() {
        let store = Arc::new(MemoryTokenStore::new());
        store.save("A", "tok1");
        let manager = ConnectionManager::from_configs(vec![config("A")], store.clone());

        manager.shutdown_all().await;

        // Silent re-login on the next startup depends on the token
        // surviving an ordinary shutdown.
        assert!(store.load("A").is_some());
    }
}
