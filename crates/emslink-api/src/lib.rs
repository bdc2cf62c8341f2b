// emslink-api: Async WebSocket client for energy-management edge backends.

pub mod connection;
pub mod device;
pub mod envelope;
pub mod error;
pub mod manager;
pub mod pending;
pub mod token;

pub use connection::{
    AuthState, Connection, ConnectionConfig, ConnectionEvent, EventKind, ReconnectConfig,
};
pub use device::{Device, DeviceRegistry};
pub use envelope::{Credential, DeviceMetadata, Notification};
pub use error::Error;
pub use manager::ConnectionManager;
pub use token::{MemoryTokenStore, TokenStore};
