//! IDE client — the public handle over one editor session.
//!
//! Ties discovery, selection, the connection manager and the handshake
//! together. Handles are cheap to clone and share one connection; independent
//! clients share nothing.

use std::sync::Arc;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::broadcast;

use crate::config::ClientConfig;

use super::connection::{Gate, Shared};
use super::discovery;
use super::errors::IdeError;
use super::handshake;
use super::selector::{self, ChoicePrompt};
use super::types::{is_notification_method, ConnectionState, Endpoint, PeerNotification, SessionDescriptor};

// ─── IdeClient ───────────────────────────────────────────────────────────────

/// Client for one locally running editor integration.
#[derive(Debug, Clone)]
pub struct IdeClient {
    shared: Arc<Shared>,
}

impl IdeClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    /// Scan the configured lock directory.
    pub fn discover_sessions(&self) -> Vec<SessionDescriptor> {
        discovery::scan_descriptors(&self.shared.config.lock_dir())
    }

    /// Discover, pick, connect, and initialize.
    ///
    /// `hint` narrows several sessions by workspace folder substring; without
    /// it, `prompt` is asked to choose. Returns the chosen descriptor.
    ///
    /// The prompt may block. On a multi-threaded runtime it runs under
    /// `block_in_place`; on a current-thread runtime it blocks that thread.
    pub async fn select_workspace(
        &self,
        hint: Option<&str>,
        prompt: &mut dyn ChoicePrompt,
    ) -> Result<SessionDescriptor, IdeError> {
        let lock_dir = self.shared.config.lock_dir();
        let descriptors = discovery::scan_descriptors(&lock_dir);
        let label = lock_dir.display().to_string();
        let selected = run_blocking(|| selector::select_session(descriptors, hint, &label, prompt))?;

        tracing::info!(
            workspace = ?selected.workspace_folders,
            ide = selected.display_ide_name(),
            port = selected.port,
            "selected IDE session"
        );

        self.connect_and_initialize(&selected).await?;
        Ok(selected)
    }

    // ─── Connection ──────────────────────────────────────────────────────

    /// Open the authenticated socket for `descriptor`. Does not run the handshake.
    pub async fn connect(&self, descriptor: &SessionDescriptor) -> Result<(), IdeError> {
        let endpoint = Endpoint {
            host: self.shared.config.host.clone(),
            port: descriptor.port,
            auth_token: descriptor.auth_token.clone(),
        };
        self.shared.connect(endpoint).await
    }

    /// [`connect`](Self::connect) followed by [`initialize`](Self::initialize).
    pub async fn connect_and_initialize(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<serde_json::Value, IdeError> {
        self.connect(descriptor).await?;
        self.initialize().await
    }

    /// Run the handshake. A no-op returning the stored result when already ready.
    pub async fn initialize(&self) -> Result<serde_json::Value, IdeError> {
        handshake::initialize(&self.shared).await
    }

    /// Close the socket and fail every outstanding call with `ConnectionClosed`.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    // ─── RPC ─────────────────────────────────────────────────────────────

    /// Send a request and wait for its result payload (`null` when absent).
    ///
    /// Notification methods (`initialized`, `notifications/*`) are sent
    /// without an id and return `null` immediately.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, IdeError> {
        if is_notification_method(method) {
            self.notify(method, params)?;
            return Ok(serde_json::Value::Null);
        }
        self.shared.request(method, params, Gate::Ready).await
    }

    /// Send a notification; no reply is expected.
    pub fn notify(&self, method: &str, params: serde_json::Value) -> Result<(), IdeError> {
        self.shared.notify(method, params, Gate::Ready)
    }

    /// Receive notifications pushed by the peer.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<PeerNotification> {
        self.shared.subscribe()
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Inbound frames discarded as unparseable.
    pub fn malformed_frames(&self) -> u64 {
        self.shared.pending.malformed_frames()
    }

    pub fn initialize_result(&self) -> Option<serde_json::Value> {
        self.shared.initialize_result()
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.shared.endpoint()
    }
}

/// Run `work` inline, handing the worker thread off first when the runtime allows it.
fn run_blocking<R>(work: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

impl Default for IdeClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
