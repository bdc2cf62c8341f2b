//! Correlation of outbound requests with inbound `queryreply` frames.
//!
//! Each outstanding request is keyed by a generated `requestId`. At most
//! one entry exists per identifier, and identifiers are never reused
//! while pending.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Table of outstanding requests awaiting correlated replies.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Value>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new request, returning its generated identifier and
    /// the receiver the reply will be delivered on.
    pub fn insert(&self) -> (String, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table();
        // UUID v4 collisions are not a practical concern, but the
        // at-most-one-per-id invariant is cheap to uphold.
        let mut id = Uuid::new_v4().to_string();
        while table.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }
        table.insert(id.clone(), tx);
        (id, rx)
    }

    /// Resolve exactly the request with the matching identifier.
    ///
    /// Replies with unknown identifiers are ignored — transient races
    /// between timeout cleanup and in-flight replies are expected.
    pub fn resolve(&self, request_id: &str, payload: Value) -> bool {
        match self.table().remove(request_id) {
            Some(tx) => {
                // A dropped receiver means the caller gave up (timeout).
                let _ = tx.send(payload);
                true
            }
            None => {
                tracing::debug!(request_id, "reply for unknown request id, dropping");
                false
            }
        }
    }

    /// Discard an entry, typically after the caller's timeout elapsed.
    /// Idempotent.
    pub fn discard(&self, request_id: &str) {
        self.table().remove(request_id);
    }

    /// Fail every outstanding request by dropping its reply sender.
    /// Called when the session is closed for good.
    pub fn fail_all(&self) {
        self.table().clear();
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_completes_only_the_matching_request() {
        let pending = PendingRequests::new();
        let (id_a, rx_a) = pending.insert();
        let (_id_b, mut rx_b) = pending.insert();

        assert!(pending.resolve(&id_a, json!({ "data": 1 })));
        assert_eq!(rx_a.blocking_recv().expect("reply delivered")["data"], 1);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn unknown_request_id_is_ignored() {
        let pending = PendingRequests::new();
        let (_id, mut rx) = pending.insert();

        assert!(!pending.resolve("nope", json!({})));
        assert!(rx.try_recv().is_err());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn discard_is_idempotent() {
        let pending = PendingRequests::new();
        let (id, _rx) = pending.insert();

        pending.discard(&id);
        pending.discard(&id);
        assert!(pending.is_empty());
        assert!(!pending.resolve(&id, json!({})));
    }

    #[test]
    fn fail_all_drops_every_reply_sender() {
        let pending = PendingRequests::new();
        let (_a, rx_a) = pending.insert();
        let (_b, rx_b) = pending.insert();

        pending.fail_all();
        assert!(pending.is_empty());
        assert!(rx_a.blocking_recv().is_err());
        assert!(rx_b.blocking_recv().is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        let pending = PendingRequests::new();
        let (id_a, _rx_a) = pending.insert();
        let (id_b, _rx_b) = pending.insert();
        assert_ne!(id_a, id_b);
    }
}
