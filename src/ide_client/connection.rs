//! Connection manager.
//!
//! Owns the single socket of a client and serializes every state transition
//! behind one lock:
//! - connect / disconnect
//! - closure handling: fatal auth rejection vs. unexpected loss
//! - bounded reconnection with linear backoff on a background task
//! - gating outbound traffic on the handshake state
//!
//! Each socket (and each reconnect task) is tagged with the epoch current
//! when it was created. `connect` and `disconnect` bump the epoch, so
//! callbacks from a superseded socket or a stale reconnect task are ignored.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;

use super::correlation::{Dispatch, PendingTable};
use super::errors::IdeError;
use super::handshake;
use super::transport::{self, TransportHandle};
use super::types::{
    close_codes, ConnectionState, Endpoint, JsonRpcNotification, JsonRpcRequest, PeerNotification,
};

/// Buffered peer notifications per subscriber before the oldest are dropped.
const NOTIFICATION_CAPACITY: usize = 64;

/// Which traffic a send is allowed to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Ordinary RPCs: only once the handshake has completed.
    Ready,
    /// The initialize request and its notification: any open socket.
    Handshake,
}

/// Outcome of [`Shared::begin_handshake`].
#[derive(Debug)]
pub enum HandshakeStart {
    AlreadyReady(serde_json::Value),
    Begin { epoch: u64 },
}

/// Mutable connection state. Only touched under [`Shared::core`].
#[derive(Debug)]
struct Core {
    state: ConnectionState,
    endpoint: Option<Endpoint>,
    transport: Option<TransportHandle>,
    epoch: u64,
    reconnect_attempts: u32,
    reconnect_task: Option<JoinHandle<()>>,
    auth_rejected: bool,
    initialize_result: Option<serde_json::Value>,
}

/// State shared between client handles and the background tasks.
///
/// Background tasks only hold `Weak` references, so dropping the last client
/// handle tears the connection down.
#[derive(Debug)]
pub struct Shared {
    pub config: ClientConfig,
    pub pending: PendingTable,
    notifications: broadcast::Sender<PeerNotification>,
    core: Mutex<Core>,
}

impl Shared {
    pub fn new(config: ClientConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            config,
            pending: PendingTable::new(),
            notifications,
            core: Mutex::new(Core {
                state: ConnectionState::Disconnected,
                endpoint: None,
                transport: None,
                epoch: 0,
                reconnect_attempts: 0,
                reconnect_task: None,
                auth_rejected: false,
                initialize_result: None,
            }),
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Introspection ───────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.lock_core().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock_core().reconnect_attempts
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.lock_core().endpoint.clone()
    }

    pub fn initialize_result(&self) -> Option<serde_json::Value> {
        self.lock_core().initialize_result.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerNotification> {
        self.notifications.subscribe()
    }

    // ─── Connecting ──────────────────────────────────────────────────────

    /// Open an authenticated socket to `endpoint`.
    ///
    /// Succeeds immediately if a socket to the same endpoint is already open.
    /// A socket to a different endpoint is closed first.
    pub async fn connect(self: &Arc<Self>, endpoint: Endpoint) -> Result<(), IdeError> {
        let epoch = {
            let mut core = self.lock_core();
            let same_endpoint = core
                .endpoint
                .as_ref()
                .is_some_and(|e| e.host == endpoint.host && e.port == endpoint.port);

            if core.state.is_open() && core.transport.is_some() && same_endpoint {
                return Ok(());
            }
            if core.state == ConnectionState::Connecting {
                // The epoch bump below makes the in-flight attempt discard its socket.
                tracing::debug!(port = endpoint.port, "superseding connection attempt in progress");
            }
            if let Some(old) = core.transport.take() {
                old.close(close_codes::NORMAL, "Switching session");
                self.pending.fail_all(|| IdeError::ConnectionClosed);
            }
            if let Some(task) = core.reconnect_task.take() {
                task.abort();
            }

            core.epoch += 1;
            core.state = ConnectionState::Connecting;
            core.endpoint = Some(endpoint.clone());
            core.auth_rejected = false;
            core.initialize_result = None;
            core.reconnect_attempts = 0;
            core.epoch
        };

        self.establish(endpoint, epoch).await
    }

    /// Open the socket for a `Connecting` attempt tagged `epoch`.
    async fn establish(self: &Arc<Self>, endpoint: Endpoint, epoch: u64) -> Result<(), IdeError> {
        tracing::debug!(port = endpoint.port, epoch, "opening websocket");
        let opened = transport::open(&endpoint, self.config.connect_timeout()).await;

        let mut core = self.lock_core();
        if core.epoch != epoch {
            // Superseded by disconnect() or another connect() while opening.
            return Err(IdeError::ConnectionClosed);
        }

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                core.state = ConnectionState::Disconnected;
                core.auth_rejected = e.is_fatal();
                return Err(e);
            }
        };

        let on_frame = {
            let weak = Arc::downgrade(self);
            move |text: &str| match weak.upgrade() {
                Some(shared) => {
                    shared.on_frame(text);
                    true
                }
                None => false,
            }
        };
        let on_close = {
            let weak = Arc::downgrade(self);
            move |code: Option<u16>| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_closed(epoch, code);
                }
            }
        };

        core.transport = Some(transport::spawn_io(stream, on_frame, on_close));
        core.state = ConnectionState::Connected;
        core.reconnect_attempts = 0;
        tracing::info!(port = endpoint.port, "connected to IDE");
        Ok(())
    }

    // ─── Inbound ─────────────────────────────────────────────────────────

    fn on_frame(&self, text: &str) {
        if let Dispatch::Notification(notification) = self.pending.dispatch(text) {
            tracing::debug!(method = %notification.method, "peer notification");
            // No subscribers is fine.
            let _ = self.notifications.send(notification);
        }
    }

    /// Reader task finished for the socket tagged `epoch`.
    fn on_closed(self: &Arc<Self>, epoch: u64, code: Option<u16>) {
        let mut core = self.lock_core();
        if core.epoch != epoch {
            tracing::debug!(epoch, ?code, "ignoring close of superseded connection");
            return;
        }

        core.transport = None;
        core.initialize_result = None;
        core.state = ConnectionState::Disconnected;

        if code == Some(close_codes::AUTH_REJECTED) {
            core.auth_rejected = true;
            drop(core);
            tracing::warn!("IDE rejected the auth token; not reconnecting");
            self.pending.fail_all(|| IdeError::AuthenticationFailed);
            return;
        }

        tracing::warn!(?code, "connection closed unexpectedly");
        self.schedule_reconnect(&mut core);
        drop(core);
        self.pending.fail_all(|| IdeError::ConnectionClosed);
    }

    // ─── Reconnection ────────────────────────────────────────────────────

    /// Queue the next reconnection attempt unless the budget is spent.
    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core) {
        let max = self.config.max_reconnect_attempts;
        if core.reconnect_attempts >= max {
            tracing::warn!(attempts = core.reconnect_attempts, "reconnect attempts exhausted");
            return;
        }
        let Some(endpoint) = core.endpoint.clone() else {
            return;
        };

        core.reconnect_attempts += 1;
        let attempt = core.reconnect_attempts;
        let delay = self.config.reconnect_delay(attempt);
        let epoch = core.epoch;
        let weak = Arc::downgrade(self);

        tracing::info!(attempt, max, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        core.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.reconnect(endpoint, epoch, attempt).await;
            }
        }));
    }

    /// One background reconnection attempt. Failures are logged, never returned.
    async fn reconnect(self: Arc<Self>, endpoint: Endpoint, epoch: u64, attempt: u32) {
        let attempt_epoch = {
            let mut core = self.lock_core();
            core.reconnect_task = None;
            if core.epoch != epoch || core.state != ConnectionState::Disconnected {
                tracing::debug!(attempt, "reconnect superseded");
                return;
            }
            core.epoch += 1;
            core.state = ConnectionState::Connecting;
            core.epoch
        };

        if let Err(e) = self.establish(endpoint, attempt_epoch).await {
            tracing::warn!(attempt, error = %e, "reconnect attempt failed");
            if e.is_fatal() {
                return;
            }
            let mut core = self.lock_core();
            if core.epoch == attempt_epoch {
                self.schedule_reconnect(&mut core);
            }
            return;
        }

        match handshake::initialize(&self).await {
            Ok(_) => tracing::info!(attempt, "reconnected and reinitialized"),
            Err(e) => tracing::warn!(attempt, error = %e, "handshake after reconnect failed; staying down"),
        }
    }

    // ─── Disconnecting ───────────────────────────────────────────────────

    /// Close the socket with a normal-closure code and fail every pending call.
    ///
    /// Cancels any scheduled reconnect. No-op when already disconnected.
    pub fn disconnect(&self) {
        let mut core = self.lock_core();
        if core.state == ConnectionState::Disconnected
            && core.transport.is_none()
            && core.reconnect_task.is_none()
        {
            return;
        }

        core.epoch += 1;
        if let Some(task) = core.reconnect_task.take() {
            task.abort();
        }
        if let Some(transport) = core.transport.take() {
            transport.close(close_codes::NORMAL, "Client disconnecting");
        }
        core.state = ConnectionState::Disconnected;
        core.reconnect_attempts = 0;
        core.initialize_result = None;
        drop(core);

        self.pending.fail_all(|| IdeError::ConnectionClosed);
        tracing::info!("disconnected from IDE");
    }

    // ─── Handshake State ─────────────────────────────────────────────────

    /// Move `Connected → HandshakeInFlight`, or report that the session is ready.
    pub fn begin_handshake(&self) -> Result<HandshakeStart, IdeError> {
        let mut core = self.lock_core();
        match core.state {
            ConnectionState::Ready => Ok(HandshakeStart::AlreadyReady(
                core.initialize_result
                    .clone()
                    .unwrap_or(serde_json::Value::Null),
            )),
            ConnectionState::Connected => {
                core.state = ConnectionState::HandshakeInFlight;
                Ok(HandshakeStart::Begin { epoch: core.epoch })
            }
            ConnectionState::HandshakeInFlight => Err(IdeError::NotInitialized),
            _ if core.auth_rejected => Err(IdeError::AuthenticationFailed),
            _ => Err(IdeError::NotConnected),
        }
    }

    /// Settle a handshake begun at `epoch`.
    ///
    /// A failure on the current socket closes it with 1000 and leaves the
    /// client `Disconnected` with no reconnect scheduled.
    pub fn finish_handshake(
        &self,
        epoch: u64,
        outcome: Result<serde_json::Value, IdeError>,
    ) -> Result<serde_json::Value, IdeError> {
        let mut core = self.lock_core();
        let current = core.epoch == epoch && core.state == ConnectionState::HandshakeInFlight;

        match outcome {
            Ok(result) if current => {
                core.state = ConnectionState::Ready;
                core.initialize_result = Some(result.clone());
                tracing::info!("IDE session initialized");
                Ok(result)
            }
            Ok(_) => Err(IdeError::ConnectionClosed),
            Err(e) if current => {
                // A socket that cannot complete the handshake is dropped, not retried.
                core.epoch += 1;
                if let Some(task) = core.reconnect_task.take() {
                    task.abort();
                }
                if let Some(transport) = core.transport.take() {
                    transport.close(close_codes::NORMAL, "Handshake failed");
                }
                core.state = ConnectionState::Disconnected;
                core.initialize_result = None;
                drop(core);
                self.pending.fail_all(|| IdeError::ConnectionClosed);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    // ─── Outbound ────────────────────────────────────────────────────────

    /// The live transport and its epoch, if `gate` permits sending now.
    fn transport_for(&self, gate: Gate) -> Result<(TransportHandle, u64), IdeError> {
        let core = self.lock_core();
        match (core.state, gate) {
            (ConnectionState::Ready, _) => {}
            (ConnectionState::Connected | ConnectionState::HandshakeInFlight, Gate::Handshake) => {}
            (ConnectionState::Connected | ConnectionState::HandshakeInFlight, Gate::Ready) => {
                return Err(IdeError::NotInitialized);
            }
            _ if core.auth_rejected => return Err(IdeError::AuthenticationFailed),
            _ => return Err(IdeError::NotConnected),
        }
        let transport = core.transport.clone().ok_or(IdeError::NotConnected)?;
        Ok((transport, core.epoch))
    }

    /// Whether the socket tagged `epoch` is still the live one.
    fn is_live(&self, epoch: u64) -> bool {
        let core = self.lock_core();
        core.epoch == epoch && core.transport.is_some()
    }

    /// Error for a call whose socket went away under it.
    fn closed_error(&self) -> IdeError {
        if self.lock_core().auth_rejected {
            IdeError::AuthenticationFailed
        } else {
            IdeError::ConnectionClosed
        }
    }

    /// Send a request and wait for its reply or deadline.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        gate: Gate,
    ) -> Result<serde_json::Value, IdeError> {
        let (transport, epoch) = self.transport_for(gate)?;
        let registration = self.pending.register(method, self.config.request_timeout());

        // A close between the gate check and registration would miss this entry.
        if !self.is_live(epoch) {
            self.pending.remove(&registration.id);
            return Err(self.closed_error());
        }

        let frame = serde_json::to_string(&JsonRpcRequest::new(&registration.id, method, params))
            .map_err(|e| IdeError::TransportError {
                reason: format!("failed to serialize request: {e}"),
            });
        let sent = frame.and_then(|frame| transport.send_text(frame));
        if let Err(e) = sent {
            self.pending.remove(&registration.id);
            return Err(if self.is_live(epoch) { e } else { self.closed_error() });
        }

        tracing::trace!(id = %registration.id, method, "request sent");
        registration.wait(&self.pending).await
    }

    /// Send a notification. Returns once it is queued on the socket.
    pub fn notify(&self, method: &str, params: serde_json::Value, gate: Gate) -> Result<(), IdeError> {
        let (transport, _) = self.transport_for(gate)?;
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params)).map_err(|e| {
            IdeError::TransportError {
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        transport.send_text(frame)?;
        tracing::trace!(method, "notification sent");
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = core.reconnect_task.take() {
            task.abort();
        }
        if let Some(transport) = core.transport.take() {
            transport.close(close_codes::NORMAL, "Client dropped");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ide_client::test_support::{default_handler, eventually, fast_config, MockPeer, PeerAction};
    use crate::IdeClient;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Never answers `tools/call` named "hang"; closes with `code` on "close".
    fn scripted(frame: &Value, code: u16) -> Vec<PeerAction> {
        match frame["params"]["name"].as_str() {
            Some("hang") => vec![],
            Some("close") => vec![PeerAction::Close(code)],
            _ => default_handler(frame),
        }
    }

    #[tokio::test]
    async fn test_disconnect_wakes_pending_and_does_not_reconnect() {
        let peer = MockPeer::start_with("tok", |f| scripted(f, 1011)).await;
        let client = IdeClient::new(fast_config());
        client.connect_and_initialize(&peer.descriptor()).await.unwrap();

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.invoke("hang", json!({})).await }
        });
        assert!(eventually(|| client.pending_count() == 1).await);

        client.disconnect();
        assert!(matches!(pending.await.unwrap(), Err(IdeError::ConnectionClosed)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.pending_count(), 0);

        // Second call is a no-op.
        client.disconnect();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(peer.sessions(), 1);
        assert_eq!(client.reconnect_attempts(), 0);
        assert!(matches!(client.invoke("x", json!({})).await, Err(IdeError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_when_never_connected() {
        let client = IdeClient::new(fast_config());
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_wrong_token_is_fatal() {
        let peer = MockPeer::start("right").await;
        let client = IdeClient::new(fast_config());

        let err = client
            .connect_and_initialize(&peer.descriptor_with_token("wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, IdeError::AuthenticationFailed), "got {err:?}");
        assert!(err.is_fatal());

        assert!(eventually(|| client.state() == ConnectionState::Disconnected).await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(peer.sessions(), 1);
        assert_eq!(client.reconnect_attempts(), 0);
        assert!(matches!(
            client.invoke("x", json!({})).await,
            Err(IdeError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn test_auth_close_mid_session_fails_pending() {
        let peer = MockPeer::start_with("tok", |frame| match frame["params"]["name"].as_str() {
            Some("revoke") => vec![PeerAction::Close(close_codes::AUTH_REJECTED)],
            _ => default_handler(frame),
        })
        .await;
        let client = IdeClient::new(fast_config());
        client.connect_and_initialize(&peer.descriptor()).await.unwrap();

        let err = client.invoke("revoke", json!({})).await.unwrap_err();
        assert!(matches!(err, IdeError::AuthenticationFailed), "got {err:?}");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(peer.sessions(), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.initialize_result().is_none());
    }

    #[tokio::test]
    async fn test_unexpected_close_reconnects_and_reinitializes() {
        let peer = MockPeer::start_with("tok", |f| scripted(f, 1011)).await;
        let client = IdeClient::new(fast_config());
        client.connect_and_initialize(&peer.descriptor()).await.unwrap();

        let err = client.invoke("close", json!({})).await.unwrap_err();
        assert!(matches!(err, IdeError::ConnectionClosed), "got {err:?}");

        assert!(eventually(|| client.is_ready() && peer.sessions() == 2).await);
        assert_eq!(client.reconnect_attempts(), 0);

        let inits = peer
            .frames()
            .iter()
            .filter(|f| f["method"] == "initialize")
            .count();
        assert_eq!(inits, 2);

        let result = client.invoke("after", json!({})).await.unwrap();
        assert_eq!(result["tool"], "after");
    }

    #[tokio::test]
    async fn test_peer_normal_close_also_reconnects() {
        let peer = MockPeer::start_with("tok", |f| scripted(f, close_codes::NORMAL)).await;
        let client = IdeClient::new(fast_config());
        client.connect_and_initialize(&peer.descriptor()).await.unwrap();

        let _ = client.invoke("close", json!({})).await;
        assert!(eventually(|| client.is_ready() && peer.sessions() == 2).await);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let peer = MockPeer::start_limited("tok", |f| scripted(f, 1011), 1).await;
        let client = IdeClient::new(fast_config());
        client.connect_and_initialize(&peer.descriptor()).await.unwrap();

        let _ = client.invoke("close", json!({})).await;

        assert!(eventually(|| peer.dropped() == 3).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(peer.dropped(), 3);
        assert_eq!(client.reconnect_attempts(), 3);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(client.invoke("x", json!({})).await, Err(IdeError::NotConnected)));
    }

    #[tokio::test]
    async fn test_failed_handshake_after_reconnect_stays_down() {
        let inits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&inits);
        let peer = MockPeer::start_with("tok", move |frame| {
            if frame["method"] == "initialize" && seen.fetch_add(1, Ordering::SeqCst) > 0 {
                return vec![PeerAction::reply_error(frame, -32603, "not ready")];
            }
            scripted(frame, 1011)
        })
        .await;
        let client = IdeClient::new(fast_config());
        client.connect_and_initialize(&peer.descriptor()).await.unwrap();

        let _ = client.invoke("close", json!({})).await;
        assert!(
            eventually(|| inits.load(Ordering::SeqCst) == 2
                && client.state() == ConnectionState::Disconnected)
            .await
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(peer.sessions(), 2);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(client.invoke("x", json!({})).await, Err(IdeError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_supersedes_attempt_in_progress() {
        // Completes the TCP handshake but never answers the upgrade.
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_port = silent.local_addr().unwrap().port();
        let peer = MockPeer::start("tok").await;
        let client = IdeClient::new(fast_config());

        let stalled = tokio::spawn({
            let client = client.clone();
            let mut descriptor = peer.descriptor();
            descriptor.port = silent_port;
            async move { client.connect(&descriptor).await }
        });
        assert!(eventually(|| client.state() == ConnectionState::Connecting).await);

        client.connect_and_initialize(&peer.descriptor()).await.unwrap();
        assert!(matches!(stalled.await.unwrap(), Err(IdeError::ConnectionClosed)));
        assert!(client.is_ready());
        assert_eq!(client.endpoint().map(|e| e.port), Some(peer.port));
        drop(silent);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let shared = Arc::new(Shared::new(fast_config()));
        let err = shared
            .connect(Endpoint {
                host: "127.0.0.1".into(),
                port,
                auth_token: "tok".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IdeError::ConnectFailed { .. }), "got {err:?}");
        assert_eq!(shared.state(), ConnectionState::Disconnected);
        assert_eq!(shared.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_gate_rules() {
        let peer = MockPeer::start("tok").await;
        let shared = Arc::new(Shared::new(fast_config()));
        let endpoint = Endpoint {
            host: "127.0.0.1".into(),
            port: peer.port,
            auth_token: "tok".into(),
        };
        shared.connect(endpoint).await.unwrap();

        assert!(matches!(
            shared.notify("anything", json!({}), Gate::Ready),
            Err(IdeError::NotInitialized)
        ));
        assert!(shared.notify("initialized", json!({}), Gate::Handshake).is_ok());
    }
}
