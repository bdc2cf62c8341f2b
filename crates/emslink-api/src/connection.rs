//! The connection client: one always-attempting-to-be-connected session
//! per configured edge backend.
//!
//! Hides physical reconnects behind a stable authenticated message
//! stream, demultiplexes inbound frames to the right [`Device`], and
//! correlates outbound queries with inbound replies. Reconnection uses a
//! fixed delay and a bounded retry budget so a permanently unreachable
//! or rejecting backend never produces an infinite loop.
//!
//! # Example
//!
//! ```rust,ignore
//! use emslink_api::{Connection, ConnectionConfig, Credential, MemoryTokenStore};
//! use secrecy::SecretString;
//! use std::sync::Arc;
//!
//! let config = ConnectionConfig::new("home", "ws://192.168.1.50:8085".parse()?);
//! let conn = Connection::new(config, Arc::new(MemoryTokenStore::new()));
//!
//! let mut events = conn.events();
//! conn.connect(Some(Credential::Password(SecretString::from("guest")))).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}: {}", event.kind, event.message);
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::device::{Device, DeviceRegistry};
use crate::envelope::{self, AuthResult, Credential, Inbound, Notification};
use crate::error::Error;
use crate::pending::PendingRequests;
use crate::token::TokenStore;

// ── Timeouts and channel sizing ──────────────────────────────────────

const AUTH_TIMEOUT: Duration = Duration::from_secs(2);
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 64;
const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

// ── Configuration ────────────────────────────────────────────────────

/// Reconnection policy: fixed delay between attempts, bounded budget.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay between reconnection attempts. Default: 1s.
    pub delay: Duration,

    /// Consecutive failures tolerated before giving up. Default: 10.
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_retries: 10,
        }
    }
}

/// Configuration for a single backend endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Unique connection name; also the token-store key.
    pub name: String,

    /// WebSocket URL of the backend.
    pub url: Url,

    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, url: Url) -> Self {
        Self {
            name: name.into(),
            url,
            reconnect: ReconnectConfig::default(),
        }
    }
}

// ── Observable state and events ──────────────────────────────────────

/// Authentication state, observable via a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Disconnected,
    Connecting,
    Authenticated,
    /// The backend rejected the credential. Sticky until the next
    /// `connect()` or `disconnect()`, so observers arriving after the
    /// denial event still see the outcome.
    Denied,
}

/// Discriminator for events on the connection's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Success,
    Error,
    Warning,
    Info,
}

/// A session-level event: authentication outcome, reconnect progress,
/// final give-up. All session-viability conditions flow through here.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub kind: EventKind,
    pub message: String,
}

// ── Connection ───────────────────────────────────────────────────────

/// Handle to one logical backend session. Cheaply cloneable.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    url: Url,
    reconnect: ReconnectConfig,
    state: watch::Sender<AuthState>,
    events: broadcast::Sender<Arc<ConnectionEvent>>,
    notifications: broadcast::Sender<Arc<Notification>>,
    registry: DeviceRegistry,
    pending: PendingRequests,
    outbox_tx: mpsc::UnboundedSender<Value>,
    outbox_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    /// Monotonic session generation. Frames from a superseded socket
    /// check this before mutating shared state.
    generation: AtomicU64,
    credential: Mutex<Option<Credential>>,
    /// Channel sets to replay after each successful authentication,
    /// keyed by target device (None = connection-wide).
    subscriptions: Mutex<HashMap<Option<String>, Value>>,
    session_cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
    token_store: Arc<dyn TokenStore>,
}

impl Connection {
    pub fn new(config: ConnectionConfig, token_store: Arc<dyn TokenStore>) -> Self {
        let (state, _) = watch::channel(AuthState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                registry: DeviceRegistry::new(&config.name),
                name: config.name,
                url: config.url,
                reconnect: config.reconnect,
                state,
                events,
                notifications,
                pending: PendingRequests::new(),
                outbox_tx,
                outbox_rx: tokio::sync::Mutex::new(Some(outbox_rx)),
                generation: AtomicU64::new(0),
                credential: Mutex::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                session_cancel: Mutex::new(CancellationToken::new()),
                task: Mutex::new(None),
                token_store,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Begin a connection attempt with the given credential.
    ///
    /// `None` is a valid "do not connect" call. No-op if a session is
    /// already running. Success/failure is signaled asynchronously on
    /// the [`events`](Self::events) stream; on success the backend may
    /// return a fresh token, which overwrites the stored one.
    pub async fn connect(&self, credential: Option<Credential>) -> Result<(), Error> {
        let Some(credential) = credential else {
            return Ok(());
        };

        let Some(outbox) = self.inner.outbox_rx.lock().await.take() else {
            tracing::debug!(connection = %self.inner.name, "connect ignored, session already running");
            return Ok(());
        };

        *lock(&self.inner.credential) = Some(credential);

        let cancel = CancellationToken::new();
        *lock(&self.inner.session_cancel) = cancel.clone();
        let _ = self.inner.state.send(AuthState::Connecting);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let outbox = session_loop(&inner, outbox, &cancel).await;
            *inner.outbox_rx.lock().await = Some(outbox);
        });
        *lock(&self.inner.task) = Some(handle);
        Ok(())
    }

    /// Attempt a silent login with the stored token, if one exists.
    ///
    /// Returns `false` (without connecting) when no token is stored.
    pub async fn connect_with_stored_token(&self) -> Result<bool, Error> {
        match self.inner.token_store.load(&self.inner.name) {
            Some(token) => {
                self.connect(Some(Credential::Token(token))).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// End the session but keep the stored token, so a later
    /// [`connect_with_stored_token`](Self::connect_with_stored_token)
    /// can resume silently. Idempotent.
    pub async fn disconnect(&self) {
        lock(&self.inner.session_cancel).cancel();
        let handle = lock(&self.inner.task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner.pending.fail_all();
        self.inner.registry.clear();
        let _ = self.inner.state.send(AuthState::Disconnected);
    }

    /// Forcibly end the session.
    ///
    /// Cancels the session task and any in-flight reconnect timers,
    /// discards the stored token, fails pending requests, clears the
    /// device registry, and resets the state to disconnected. Idempotent.
    pub async fn close(&self) {
        self.disconnect().await;
        self.inner.token_store.delete(&self.inner.name);
        *lock(&self.inner.credential) = None;
    }

    // ── Messaging ────────────────────────────────────────────────────

    /// Enqueue a message for transmission, tagging it with the device
    /// name if targeted.
    ///
    /// Messages sent before the socket opens are queued and flushed in
    /// order once it does — never silently dropped pre-open. Queued
    /// messages survive a reconnect; a message already handed to a dead
    /// socket is dropped with a warning.
    pub fn send(&self, device: Option<&str>, mut message: Value) -> Result<(), Error> {
        if let Some(device) = device {
            envelope::tag_device(&mut message, device);
        }
        self.inner
            .outbox_tx
            .send(message)
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Send a query and await its correlated reply.
    ///
    /// The reply resolves only the pending request whose generated id
    /// matches. If no reply arrives within 10 seconds, the request is
    /// discarded and a timeout error is returned.
    pub async fn query(&self, device: Option<&str>, mut message: Value) -> Result<Value, Error> {
        let (request_id, reply) = self.inner.pending.insert();
        envelope::tag_request_id(&mut message, &request_id);

        if let Err(e) = self.send(device, message) {
            self.inner.pending.discard(&request_id);
            return Err(e);
        }

        match time::timeout(QUERY_TIMEOUT, reply).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.inner.pending.discard(&request_id);
                Err(Error::RequestTimeout {
                    request_id,
                    timeout_secs: QUERY_TIMEOUT.as_secs(),
                })
            }
        }
    }

    /// Subscribe to a channel set, remembered per target device and
    /// replayed after every successful (re)authentication.
    ///
    /// A `null` channel set clears the remembered subscription.
    pub fn subscribe_channels(&self, device: Option<&str>, channels: Value) -> Result<(), Error> {
        {
            let mut subscriptions = lock(&self.inner.subscriptions);
            if channels.is_null() {
                subscriptions.remove(&device.map(String::from));
            } else {
                subscriptions.insert(device.map(String::from), channels.clone());
            }
        }
        self.send(device, envelope::subscribe(channels))
    }

    // ── Lookups and streams ──────────────────────────────────────────

    /// The device with that name, if known.
    pub fn device(&self, name: &str) -> Result<Arc<Device>, Error> {
        self.inner
            .registry
            .get(name)
            .ok_or_else(|| Error::DeviceNotFound { name: name.into() })
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.inner.registry.all()
    }

    /// Observe device registry changes (bumped on each announcement).
    pub fn registry_changes(&self) -> watch::Receiver<u64> {
        self.inner.registry.subscribe()
    }

    /// Subscribe to session events. Multiple subscribers are independent
    /// and delivery order matches emission order.
    pub fn events(&self) -> broadcast::Receiver<Arc<ConnectionEvent>> {
        self.inner.events.subscribe()
    }

    /// Subscribe to backend notifications, routed here regardless of
    /// device targeting.
    pub fn notifications(&self) -> broadcast::Receiver<Arc<Notification>> {
        self.inner.notifications.subscribe()
    }

    /// Observe the authentication state.
    pub fn state(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    /// Convenience: wait until authenticated, or fail on an error event
    /// or after `timeout`.
    pub async fn wait_authenticated(&self, timeout: Duration) -> Result<(), Error> {
        let mut events = self.events();
        let mut state = self.state();

        let wait = async {
            loop {
                match *state.borrow_and_update() {
                    AuthState::Authenticated => return Ok(()),
                    AuthState::Denied => {
                        return Err(Error::Authentication {
                            message: "credential rejected by backend".into(),
                        });
                    }
                    AuthState::Disconnected | AuthState::Connecting => {}
                }
                tokio::select! {
                    changed = state.changed() => {
                        if changed.is_err() {
                            return Err(Error::ConnectionClosed);
                        }
                    }
                    event = events.recv() => {
                        if let Ok(event) = event {
                            if event.kind == EventKind::Error {
                                return Err(Error::Authentication {
                                    message: event.message.clone(),
                                });
                            }
                        }
                    }
                }
            }
        };

        time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::AuthenticationTimeout {
                timeout_secs: timeout.as_secs(),
            })?
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("url", &self.inner.url.as_str())
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn emit(&self, kind: EventKind, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(connection = %self.name, ?kind, %message, "session event");
        // Ignore send errors — no active subscribers right now.
        let _ = self.events.send(Arc::new(ConnectionEvent { kind, message }));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Session loop ─────────────────────────────────────────────────────

/// How a single socket session ended.
enum SessionEnd {
    /// Backend explicitly rejected the credential; do not retry it.
    AuthRejected,
    /// Socket dropped (close frame, stream end, or caller cancel).
    Dropped { was_authenticated: bool },
}

/// Main loop: connect → run → on failure, fixed delay → reconnect,
/// up to the configured budget. Returns the outbound receiver so a
/// later `connect()` can resume draining the queue.
async fn session_loop(
    inner: &Arc<Inner>,
    mut outbox: mpsc::UnboundedReceiver<Value>,
    cancel: &CancellationToken,
) -> mpsc::UnboundedReceiver<Value> {
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = run_session(inner, &mut outbox, cancel) => result,
        };

        match result {
            Ok(SessionEnd::AuthRejected) => break,
            Ok(SessionEnd::Dropped { was_authenticated }) => {
                if cancel.is_cancelled() {
                    break;
                }
                if was_authenticated {
                    attempt = 0;
                }
                tracing::info!(connection = %inner.name, "session dropped, reconnecting");
            }
            Err(e) => {
                tracing::warn!(connection = %inner.name, error = %e, attempt, "session error");
            }
        }

        attempt += 1;
        if attempt > inner.reconnect.max_retries {
            inner.emit(
                EventKind::Error,
                format!(
                    "giving up after {} consecutive connection failures",
                    inner.reconnect.max_retries
                ),
            );
            break;
        }

        let _ = inner.state.send(AuthState::Connecting);
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = time::sleep(inner.reconnect.delay) => {}
        }
    }

    // A recorded denial stays visible to late observers.
    inner.state.send_if_modified(|state| {
        if *state == AuthState::Denied {
            false
        } else {
            *state = AuthState::Disconnected;
            true
        }
    });
    inner.pending.fail_all();
    inner.registry.clear();
    outbox
}

/// Establish one socket, authenticate, then pump frames both ways
/// until the socket drops or the caller cancels.
async fn run_session(
    inner: &Arc<Inner>,
    outbox: &mut mpsc::UnboundedReceiver<Value>,
    cancel: &CancellationToken,
) -> Result<SessionEnd, Error> {
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

    tracing::info!(connection = %inner.name, url = %inner.url, generation, "connecting");
    let (ws, _response) = tokio_tungstenite::connect_async(inner.url.as_str())
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
    let (mut write, mut read) = ws.split();

    // Authenticate before draining the queue.
    let credential = lock(&inner.credential).clone();
    if let Some(ref credential) = credential {
        let frame = envelope::authenticate(credential);
        write
            .send(tungstenite::Message::text(frame.to_string()))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
    }

    let auth_deadline = time::sleep(AUTH_TIMEOUT);
    tokio::pin!(auth_deadline);
    let mut auth_pending = credential.is_some();
    let mut was_authenticated = false;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Ok(SessionEnd::Dropped { was_authenticated });
            }
            // The timeout fires an error event but does not tear down
            // the attempt — a late grant still authenticates.
            () = &mut auth_deadline, if auth_pending => {
                auth_pending = false;
                inner.emit(EventKind::Error, "authentication timed out");
            }
            outbound = outbox.recv() => {
                let Some(message) = outbound else {
                    return Ok(SessionEnd::Dropped { was_authenticated });
                };
                if let Err(e) = write
                    .send(tungstenite::Message::text(message.to_string()))
                    .await
                {
                    // Already pulled off the queue; not requeued since
                    // the backend may or may not have observed it.
                    tracing::warn!(connection = %inner.name, error = %e, "dropping message, socket write failed");
                    return Err(Error::WebSocketConnect(e.to_string()));
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        match handle_frame(inner, generation, &text) {
                            FrameOutcome::AuthAllowed => {
                                auth_pending = false;
                                was_authenticated = true;
                            }
                            FrameOutcome::AuthDenied => {
                                return Ok(SessionEnd::AuthRejected);
                            }
                            FrameOutcome::Handled => {}
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite replies with pong automatically
                    }
                    Some(Ok(tungstenite::Message::Close(_))) => {
                        tracing::info!(connection = %inner.name, "close frame received");
                        return Ok(SessionEnd::Dropped { was_authenticated });
                    }
                    Some(Err(e)) => {
                        return Err(Error::WebSocketConnect(e.to_string()));
                    }
                    None => {
                        tracing::info!(connection = %inner.name, "stream ended");
                        return Ok(SessionEnd::Dropped { was_authenticated });
                    }
                    _ => {
                        // Binary, Pong, Frame — ignore
                    }
                }
            }
        }
    }
}

// ── Inbound demultiplexing ───────────────────────────────────────────

enum FrameOutcome {
    AuthAllowed,
    AuthDenied,
    Handled,
}

/// Route one inbound frame:
///
/// 1. `authenticate` → auth state transition (+ token persistence)
/// 2. `metadata.devices` → registry upsert, identity preserved
/// 3. `device`-keyed payload → that device's handler
/// 4. no `device` key and exactly one device registered → that device
///    (backward-compatible single-device special case)
/// 5. `notification` → notification sink, independent of 1–4
///
/// Frames from a superseded session generation are dropped before any
/// state is touched.
fn handle_frame(inner: &Arc<Inner>, generation: u64, text: &str) -> FrameOutcome {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(connection = %inner.name, error = %e, "malformed frame, dropping");
            return FrameOutcome::Handled;
        }
    };

    if inner.generation.load(Ordering::SeqCst) != generation {
        tracing::debug!(connection = %inner.name, generation, "frame from stale session, dropping");
        return FrameOutcome::Handled;
    }

    if let Some(notification) = envelope::notification(&frame) {
        let _ = inner.notifications.send(Arc::new(notification));
    }

    match envelope::classify(frame) {
        Some(Inbound::Auth(result)) => handle_auth(inner, &result),
        Some(Inbound::Metadata { devices }) => {
            match devices {
                Some(devices) => {
                    for metadata in devices {
                        inner.registry.upsert(metadata);
                    }
                }
                None => {
                    // Legacy single-device backends announce no list;
                    // register a default device named after the connection.
                    inner.registry.upsert(default_metadata(&inner.name));
                }
            }
            FrameOutcome::Handled
        }
        Some(Inbound::QueryReply {
            request_id,
            payload,
        }) => {
            inner.pending.resolve(&request_id, payload);
            FrameOutcome::Handled
        }
        Some(Inbound::Payload { device, body }) => {
            let target = match device {
                Some(ref name) => inner.registry.get(name),
                // Single-device convenience routing.
                None => inner.registry.sole(),
            };
            match target {
                Some(target) => target.handle_message(body),
                None => {
                    tracing::debug!(
                        connection = %inner.name,
                        device = device.as_deref().unwrap_or("<implicit>"),
                        "payload for unknown device, dropping"
                    );
                }
            }
            FrameOutcome::Handled
        }
        None => FrameOutcome::Handled,
    }
}

fn handle_auth(inner: &Arc<Inner>, result: &AuthResult) -> FrameOutcome {
    match result {
        AuthResult::Allowed { token, username } => {
            if let Some(token) = token {
                inner.token_store.save(&inner.name, token);
                *lock(&inner.credential) = Some(Credential::Token(SecretString::from(token.clone())));
            }
            let _ = inner.state.send(AuthState::Authenticated);
            inner.emit(
                EventKind::Success,
                match username {
                    Some(username) => format!("authenticated as {username}"),
                    None => "authenticated".to_string(),
                },
            );
            replay_subscriptions(inner);
            FrameOutcome::AuthAllowed
        }
        AuthResult::Denied { message } => {
            // The credential is spent: clear it so a reconnect never
            // replays a rejected token.
            inner.token_store.delete(&inner.name);
            *lock(&inner.credential) = None;
            let _ = inner.state.send(AuthState::Denied);
            inner.emit(EventKind::Error, format!("authentication failed: {message}"));
            FrameOutcome::AuthDenied
        }
    }
}

/// Re-enqueue the remembered channel sets through the outbound queue so
/// they are sent on the socket that just authenticated.
fn replay_subscriptions(inner: &Arc<Inner>) {
    let subscriptions: Vec<(Option<String>, Value)> = lock(&inner.subscriptions)
        .iter()
        .map(|(device, channels)| (device.clone(), channels.clone()))
        .collect();

    for (device, channels) in subscriptions {
        let mut message = envelope::subscribe(channels);
        if let Some(ref device) = device {
            envelope::tag_device(&mut message, device);
        }
        let _ = inner.outbox_tx.send(message);
    }
}

fn default_metadata(name: &str) -> crate::envelope::DeviceMetadata {
    crate::envelope::DeviceMetadata {
        name: name.to_string(),
        comment: String::new(),
        producttype: String::new(),
        online: true,
        extra: Value::Object(serde_json::Map::new()),
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_connection() -> (Connection, Arc<crate::token::MemoryTokenStore>) {
        let store = Arc::new(crate::token::MemoryTokenStore::new());
        let config = ConnectionConfig::new(
            "A",
            "ws://127.0.0.1:9/".parse().expect("valid test url"),
        );
        (Connection::new(config, store.clone()), store)
    }

    fn current_generation(conn: &Connection) -> u64 {
        conn.inner.generation.load(Ordering::SeqCst)
    }

    fn deliver(conn: &Connection, frame: &Value) {
        handle_frame(&conn.inner, current_generation(conn), &frame.to_string());
    }

    #[tokio::test]
    async fn token_rollover_on_allow() {
        use secrecy::ExposeSecret;

        let (conn, store) = test_connection();
        store.save("A", "tok1");
        let mut events = conn.events();

        deliver(
            &conn,
            &json!({ "authenticate": { "mode": "allow", "token": "tok2", "username": "u" } }),
        );

        assert_eq!(store.load("A").expect("token kept").expose_secret(), "tok2");
        assert_eq!(*conn.state().borrow(), AuthState::Authenticated);

        let event = events.try_recv().expect("success event emitted");
        assert_eq!(event.kind, EventKind::Success);
        assert!(event.message.contains('u'), "message: {}", event.message);
    }

    #[tokio::test]
    async fn auth_denial_clears_stored_token() {
        let (conn, store) = test_connection();
        store.save("A", "tok1");
        let mut events = conn.events();

        let outcome = handle_frame(
            &conn.inner,
            current_generation(&conn),
            &json!({ "authenticate": { "message": "bad token" } }).to_string(),
        );

        assert!(matches!(outcome, FrameOutcome::AuthDenied));
        assert!(store.load("A").is_none());
        assert_eq!(*conn.state().borrow(), AuthState::Denied);
        let event = events.try_recv().expect("error event emitted");
        assert_eq!(event.kind, EventKind::Error);
    }

    #[tokio::test]
    async fn denial_is_reported_even_when_waiting_starts_late() {
        let (conn, _store) = test_connection();

        // The denial lands before anyone subscribes to the event stream.
        deliver(&conn, &json!({ "authenticate": { "message": "bad token" } }));

        let result = conn.wait_authenticated(Duration::from_millis(50)).await;
        assert!(
            matches!(result, Err(Error::Authentication { .. })),
            "expected an authentication failure, got {result:?}"
        );
    }

    #[tokio::test]
    async fn metadata_then_targeted_payload_updates_only_that_device() {
        let (conn, _store) = test_connection();

        deliver(
            &conn,
            &json!({ "metadata": { "devices": [ { "name": "d1" }, { "name": "d2" } ] } }),
        );
        assert_eq!(conn.devices().len(), 2);

        deliver(&conn, &json!({ "device": "d2", "currentdata": { "soc": 55 } }));

        let d1 = conn.device("d1").expect("d1 registered");
        let d2 = conn.device("d2").expect("d2 registered");
        assert!(d1.telemetry().is_none());
        assert_eq!(d2.telemetry().expect("d2 updated")["soc"], 55);
    }

    #[tokio::test]
    async fn sole_device_receives_untargeted_payloads() {
        let (conn, _store) = test_connection();

        deliver(&conn, &json!({ "metadata": { "devices": [ { "name": "d1" } ] } }));
        deliver(&conn, &json!({ "currentdata": { "gridPower": 300 } }));

        let d1 = conn.device("d1").expect("d1 registered");
        assert_eq!(d1.telemetry().expect("telemetry routed")["gridPower"], 300);

        // With two devices the fallback no longer applies.
        deliver(&conn, &json!({ "metadata": { "devices": [ { "name": "d2" } ] } }));
        deliver(&conn, &json!({ "currentdata": { "gridPower": 999 } }));
        assert_eq!(d1.telemetry().expect("unchanged")["gridPower"], 300);
    }

    #[tokio::test]
    async fn metadata_without_device_list_registers_default_device() {
        let (conn, _store) = test_connection();

        deliver(&conn, &json!({ "metadata": { "user": { "name": "u" } } }));

        let device = conn.device("A").expect("default device registered");
        assert_eq!(device.name(), "A");
    }

    #[tokio::test]
    async fn stale_generation_frames_are_dropped() {
        let (conn, _store) = test_connection();
        let stale = current_generation(&conn);
        conn.inner.generation.fetch_add(1, Ordering::SeqCst);

        handle_frame(
            &conn.inner,
            stale,
            &json!({ "metadata": { "devices": [ { "name": "d1" } ] } }).to_string(),
        );

        assert!(conn.devices().is_empty());
    }

    #[tokio::test]
    async fn notification_routed_independently_of_device_targeting() {
        let (conn, _store) = test_connection();
        let mut notifications = conn.notifications();

        deliver(
            &conn,
            &json!({
                "device": "unknown",
                "notification": { "type": "warning", "message": "battery low" }
            }),
        );

        let n = notifications.try_recv().expect("notification routed");
        assert_eq!(n.kind, "warning");
        assert_eq!(n.message, "battery low");
    }

    #[tokio::test]
    async fn query_reply_resolves_matching_pending_request() {
        let (conn, _store) = test_connection();
        let (request_id, mut reply) = conn.inner.pending.insert();

        deliver(&conn, &json!({ "queryreply": { "data": [1] }, "requestId": "bogus" }));
        assert!(reply.try_recv().is_err());

        deliver(&conn, &json!({ "queryreply": { "data": [1] }, "requestId": request_id }));
        assert_eq!(reply.try_recv().expect("resolved")["data"][0], 1);
        assert!(conn.inner.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn query_times_out_and_cleans_up() {
        let (conn, _store) = test_connection();

        let result = conn.query(None, json!({ "query": { "kind": "history" } })).await;

        match result {
            Err(Error::RequestTimeout { timeout_secs, .. }) => {
                assert_eq!(timeout_secs, QUERY_TIMEOUT.as_secs());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(conn.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn sends_before_connect_are_queued_in_order() {
        let (conn, _store) = test_connection();

        conn.send(None, json!({ "n": 1 })).expect("queued");
        conn.send(Some("d1"), json!({ "n": 2 })).expect("queued");
        conn.send(None, json!({ "n": 3 })).expect("queued");

        let mut outbox = conn
            .inner
            .outbox_rx
            .lock()
            .await
            .take()
            .expect("receiver available before connect");

        let first = outbox.recv().await.expect("first");
        let second = outbox.recv().await.expect("second");
        let third = outbox.recv().await.expect("third");
        assert_eq!(first["n"], 1);
        assert_eq!(second["n"], 2);
        assert_eq!(second["device"], "d1");
        assert_eq!(third["n"], 3);
    }

    #[tokio::test]
    async fn subscriptions_are_replayed_after_authentication() {
        let (conn, _store) = test_connection();

        conn.subscribe_channels(Some("d1"), json!(["ess0/Soc"]))
            .expect("queued");

        // Drain the immediate subscribe message.
        let mut outbox = conn
            .inner
            .outbox_rx
            .lock()
            .await
            .take()
            .expect("receiver available");
        let immediate = outbox.recv().await.expect("immediate subscribe");
        assert_eq!(immediate["subscribe"][0], "ess0/Soc");

        // A successful (re)authentication replays the remembered set.
        deliver(&conn, &json!({ "authenticate": { "mode": "allow" } }));
        let replayed = outbox.recv().await.expect("replayed subscribe");
        assert_eq!(replayed["subscribe"][0], "ess0/Soc");
        assert_eq!(replayed["device"], "d1");
    }

    #[tokio::test]
    async fn connect_with_no_credential_is_a_no_op() {
        let (conn, _store) = test_connection();
        conn.connect(None).await.expect("no-op");
        assert_eq!(*conn.state().borrow(), AuthState::Disconnected);
        assert!(conn.inner.outbox_rx.lock().await.is_some());
    }

    #[tokio::test]
    async fn connect_with_stored_token_requires_a_token() {
        let (conn, _store) = test_connection();
        let connected = conn.connect_with_stored_token().await.expect("checked");
        assert!(!connected);
    }

    #[tokio::test]
    async fn device_lookup_reports_not_found() {
        let (conn, _store) = test_connection();
        assert!(matches!(
            conn.device("nope"),
            Err(Error::DeviceNotFound { name }) if name == "nope"
        ));
    }
}
