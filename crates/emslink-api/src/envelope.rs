//! Wire protocol: JSON object envelopes exchanged with an edge backend.
//!
//! The backend speaks untyped JSON objects over a single WebSocket. Field
//! names are load-bearing and must stay exactly as the backend expects:
//! `authenticate`, `password`, `token`, `username`, `mode`, `metadata`,
//! `devices`, `device`, `requestId`, `query`, `queryreply`, `notification`,
//! `subscribe`. This module owns building outbound envelopes and
//! classifying inbound frames; it never touches sockets.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ── Credential ───────────────────────────────────────────────────────

/// How to authenticate with an edge backend.
///
/// Exactly one of the two is sent in the `authenticate` envelope; a
/// stored token enables silent re-login across restarts.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Interactive password login.
    Password(SecretString),
    /// Previously issued session token.
    Token(SecretString),
}

// ── Outbound envelopes ───────────────────────────────────────────────

/// Build the `authenticate` envelope for a credential.
pub fn authenticate(credential: &Credential) -> Value {
    match credential {
        Credential::Password(password) => json!({
            "authenticate": { "password": password.expose_secret() }
        }),
        Credential::Token(token) => json!({
            "authenticate": { "token": token.expose_secret() }
        }),
    }
}

/// Build a `subscribe` envelope for a channel set.
pub fn subscribe(channels: Value) -> Value {
    json!({ "subscribe": channels })
}

/// Tag an outbound envelope with its target device name.
pub fn tag_device(envelope: &mut Value, device: &str) {
    if let Some(map) = envelope.as_object_mut() {
        map.insert("device".into(), Value::String(device.into()));
    }
}

/// Tag an outbound envelope with a request identifier.
pub fn tag_request_id(envelope: &mut Value, request_id: &str) {
    if let Some(map) = envelope.as_object_mut() {
        map.insert("requestId".into(), Value::String(request_id.into()));
    }
}

// ── Inbound: authentication result ───────────────────────────────────

/// Outcome of the `authenticate` handshake.
#[derive(Debug, Clone)]
pub enum AuthResult {
    /// `mode == "allow"`. A fresh token may accompany the grant and must
    /// overwrite any previously stored token.
    Allowed {
        token: Option<String>,
        username: Option<String>,
    },
    /// Anything else is a denial — the backend either sends an explicit
    /// marker or simply omits `mode: "allow"`.
    Denied { message: String },
}

fn parse_auth(auth: &Value) -> AuthResult {
    if auth.get("mode").and_then(Value::as_str) == Some("allow") {
        AuthResult::Allowed {
            token: auth.get("token").and_then(Value::as_str).map(String::from),
            username: auth
                .get("username")
                .and_then(Value::as_str)
                .map(String::from),
        }
    } else {
        AuthResult::Denied {
            message: auth
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("access denied")
                .to_string(),
        }
    }
}

// ── Inbound: metadata ────────────────────────────────────────────────

/// One entry of `metadata.devices`.
///
/// `#[serde(flatten)]` captures any fields beyond the core set so
/// nothing the backend sends is silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Unique device name within its connection.
    pub name: String,

    /// Human-readable display name.
    #[serde(default)]
    pub comment: String,

    /// Product type identifier.
    #[serde(default)]
    pub producttype: String,

    /// Whether the backend currently reaches the device.
    #[serde(default)]
    pub online: bool,

    /// All remaining fields the backend sends.
    #[serde(flatten)]
    pub extra: Value,
}

// ── Inbound: notification ────────────────────────────────────────────

/// A `{"notification": {"type", "message"}}` payload, routed to the
/// notification sink regardless of device targeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Extract a notification from a frame, if one is attached.
///
/// Checked independently of [`classify`]: a frame can carry both a
/// notification and a device payload.
pub fn notification(frame: &Value) -> Option<Notification> {
    let value = frame.get("notification")?;
    match serde_json::from_value(value.clone()) {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::debug!(error = %e, "malformed notification payload");
            None
        }
    }
}

// ── Inbound classification ───────────────────────────────────────────

/// An inbound frame, classified for the demultiplexer.
#[derive(Debug)]
pub enum Inbound {
    /// `authenticate` handshake result.
    Auth(AuthResult),

    /// Device announcement. `devices: None` means the backend sent a
    /// `metadata` envelope without a device list — the legacy
    /// single-device form.
    Metadata { devices: Option<Vec<DeviceMetadata>> },

    /// Correlated reply to an outstanding request. `payload` is the
    /// `queryreply` value when present, otherwise the whole frame.
    QueryReply { request_id: String, payload: Value },

    /// Everything else: a payload addressed at a device (explicitly via
    /// the `device` key, or implicitly when exactly one is registered).
    Payload {
        device: Option<String>,
        body: Value,
    },
}

/// Classify an inbound frame. Returns `None` for non-object frames,
/// which are dropped by the caller.
pub fn classify(frame: Value) -> Option<Inbound> {
    if !frame.is_object() {
        return None;
    }

    if let Some(auth) = frame.get("authenticate") {
        return Some(Inbound::Auth(parse_auth(auth)));
    }

    if let Some(metadata) = frame.get("metadata") {
        let devices = match metadata.get("devices") {
            Some(list) => match serde_json::from_value(list.clone()) {
                Ok(devices) => Some(devices),
                Err(e) => {
                    tracing::debug!(error = %e, "malformed metadata.devices");
                    return None;
                }
            },
            None => None,
        };
        return Some(Inbound::Metadata { devices });
    }

    if let Some(request_id) = frame.get("requestId").and_then(Value::as_str) {
        let request_id = request_id.to_string();
        let payload = frame.get("queryreply").cloned().unwrap_or(frame);
        return Some(Inbound::QueryReply {
            request_id,
            payload,
        });
    }

    let device = frame
        .get("device")
        .and_then(Value::as_str)
        .map(String::from);
    Some(Inbound::Payload {
        device,
        body: frame,
    })
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_with_password() {
        let cred = Credential::Password(SecretString::from("hunter2"));
        let envelope = authenticate(&cred);
        assert_eq!(envelope["authenticate"]["password"], "hunter2");
        assert!(envelope["authenticate"].get("token").is_none());
    }

    #[test]
    fn authenticate_with_token() {
        let cred = Credential::Token(SecretString::from("tok1"));
        let envelope = authenticate(&cred);
        assert_eq!(envelope["authenticate"]["token"], "tok1");
    }

    #[test]
    fn tag_helpers_insert_wire_fields() {
        let mut envelope = json!({ "query": { "kind": "history" } });
        tag_device(&mut envelope, "edge0");
        tag_request_id(&mut envelope, "r1");
        assert_eq!(envelope["device"], "edge0");
        assert_eq!(envelope["requestId"], "r1");
    }

    #[test]
    fn classify_auth_allow() {
        let frame = json!({
            "authenticate": { "mode": "allow", "token": "tok2", "username": "u" }
        });
        match classify(frame) {
            Some(Inbound::Auth(AuthResult::Allowed { token, username })) => {
                assert_eq!(token.as_deref(), Some("tok2"));
                assert_eq!(username.as_deref(), Some("u"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_auth_without_allow_mode_is_denial() {
        let frame = json!({ "authenticate": { "message": "bad password" } });
        match classify(frame) {
            Some(Inbound::Auth(AuthResult::Denied { message })) => {
                assert_eq!(message, "bad password");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_metadata_devices() {
        let frame = json!({
            "metadata": {
                "devices": [
                    { "name": "d1", "comment": "Edge One", "producttype": "home", "online": true },
                    { "name": "d2" },
                ]
            }
        });
        match classify(frame) {
            Some(Inbound::Metadata {
                devices: Some(devices),
            }) => {
                assert_eq!(devices.len(), 2);
                assert_eq!(devices[0].name, "d1");
                assert_eq!(devices[0].comment, "Edge One");
                assert!(devices[0].online);
                assert_eq!(devices[1].name, "d2");
                assert!(!devices[1].online);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_metadata_without_device_list() {
        let frame = json!({ "metadata": { "user": { "name": "u" } } });
        assert!(matches!(
            classify(frame),
            Some(Inbound::Metadata { devices: None })
        ));
    }

    #[test]
    fn classify_query_reply() {
        let frame = json!({ "queryreply": { "data": [1, 2, 3] }, "requestId": "r1" });
        match classify(frame) {
            Some(Inbound::QueryReply {
                request_id,
                payload,
            }) => {
                assert_eq!(request_id, "r1");
                assert_eq!(payload["data"][0], 1);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_device_payload() {
        let frame = json!({ "device": "d2", "currentdata": { "gridPower": 1200 } });
        match classify(frame) {
            Some(Inbound::Payload { device, body }) => {
                assert_eq!(device.as_deref(), Some("d2"));
                assert_eq!(body["currentdata"]["gridPower"], 1200);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_untargeted_payload() {
        let frame = json!({ "currentdata": { "gridPower": 0 } });
        assert!(matches!(
            classify(frame),
            Some(Inbound::Payload { device: None, .. })
        ));
    }

    #[test]
    fn classify_non_object_frame() {
        assert!(classify(json!("just a string")).is_none());
        assert!(classify(json!([1, 2])).is_none());
    }

    #[test]
    fn notification_is_extracted_independently() {
        let frame = json!({
            "device": "d1",
            "notification": { "type": "warning", "message": "battery low" }
        });
        let n = notification(&frame).expect("notification present");
        assert_eq!(n.kind, "warning");
        assert_eq!(n.message, "battery low");

        // Still classifies as a device payload.
        assert!(matches!(
            classify(frame),
            Some(Inbound::Payload { device: Some(d), .. }) if d == "d1"
        ));
    }
}
