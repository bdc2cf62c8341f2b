//! Devices: remote entities exposed by a connection once authenticated.
//!
//! A [`Device`] is handed to consumers as `Arc<Device>` and updated in
//! place through interior watch channels. Metadata upserts must never
//! replace the `Arc` — other components hold direct references to it.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::envelope::DeviceMetadata;

const MESSAGE_CHANNEL_CAPACITY: usize = 256;

// ── Device ───────────────────────────────────────────────────────────

/// A remote entity exposed by a connection.
///
/// Carries the latest metadata and telemetry snapshot, plus a broadcast
/// stream of every inbound message demultiplexed to this device.
pub struct Device {
    name: String,
    connection: String,
    metadata: watch::Sender<DeviceMetadata>,
    telemetry: watch::Sender<Option<Arc<Value>>>,
    messages: broadcast::Sender<Arc<Value>>,
}

impl Device {
    fn new(connection: &str, metadata: DeviceMetadata) -> Self {
        let name = metadata.name.clone();
        let (metadata, _) = watch::channel(metadata);
        let (telemetry, _) = watch::channel(None);
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        Self {
            name,
            connection: connection.to_string(),
            metadata,
            telemetry,
            messages,
        }
    }

    /// Unique device name within its connection.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning connection.
    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Latest metadata snapshot.
    pub fn metadata(&self) -> DeviceMetadata {
        self.metadata.borrow().clone()
    }

    /// Observe metadata changes.
    pub fn subscribe_metadata(&self) -> watch::Receiver<DeviceMetadata> {
        self.metadata.subscribe()
    }

    /// Latest telemetry payload (`currentdata`), if any arrived yet.
    pub fn telemetry(&self) -> Option<Arc<Value>> {
        self.telemetry.borrow().clone()
    }

    /// Observe telemetry changes.
    pub fn subscribe_telemetry(&self) -> watch::Receiver<Option<Arc<Value>>> {
        self.telemetry.subscribe()
    }

    /// Subscribe to every message demultiplexed to this device.
    ///
    /// Slow consumers receive [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Value>> {
        self.messages.subscribe()
    }

    /// Deliver a demultiplexed inbound message to this device.
    pub(crate) fn handle_message(&self, message: Value) {
        let message = Arc::new(message);
        if let Some(current) = message.get("currentdata") {
            let _ = self.telemetry.send(Some(Arc::new(current.clone())));
        }
        // Ignore send errors — no active subscribers right now.
        let _ = self.messages.send(message);
    }

    pub(crate) fn update_metadata(&self, metadata: DeviceMetadata) {
        let _ = self.metadata.send(metadata);
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

// ── DeviceRegistry ───────────────────────────────────────────────────

/// Registry of devices announced by a connection.
///
/// Cleared on disconnect; upserts bump a watch counter so consumers can
/// wait for the registry to populate after authentication.
pub struct DeviceRegistry {
    connection: String,
    devices: DashMap<String, Arc<Device>>,
    version: watch::Sender<u64>,
}

impl DeviceRegistry {
    pub fn new(connection: &str) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            connection: connection.to_string(),
            devices: DashMap::new(),
            version,
        }
    }

    /// Create-or-update a device from a metadata announcement.
    ///
    /// An existing device keeps its object identity and is updated in
    /// place; a duplicate is never created for a known name.
    pub fn upsert(&self, metadata: DeviceMetadata) -> Arc<Device> {
        let device = match self.devices.entry(metadata.name.clone()) {
            dashmap::Entry::Occupied(existing) => {
                existing.get().update_metadata(metadata);
                existing.get().clone()
            }
            dashmap::Entry::Vacant(slot) => {
                let device = Arc::new(Device::new(&self.connection, metadata));
                slot.insert(device.clone());
                device
            }
        };
        self.version.send_modify(|v| *v += 1);
        device
    }

    pub fn get(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.get(name).map(|entry| entry.clone())
    }

    /// The sole registered device, if exactly one exists.
    ///
    /// Used by the demultiplexer's single-device fallback.
    pub fn sole(&self) -> Option<Arc<Device>> {
        if self.devices.len() == 1 {
            self.devices.iter().next().map(|entry| entry.value().clone())
        } else {
            None
        }
    }

    pub fn all(&self) -> Vec<Arc<Device>> {
        self.devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&self) {
        self.devices.clear();
        self.version.send_modify(|v| *v += 1);
    }

    /// Observe registry changes (each upsert or clear bumps the counter).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
