//! Shared types for the IDE client.
//!
//! JSON-RPC 2.0 envelopes, session descriptors, and connection state.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// Protocol marker carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request message (expects a reply).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    pub fn new(id: &str, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: id.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`, no reply).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        }
    }
}

/// Any message the peer may send: a reply, or a notification of its own.
///
/// Fields are all optional; classification happens in the correlation layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// A notification pushed by the peer, fanned out to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerNotification {
    pub method: String,
    pub params: serde_json::Value,
}

/// Whether a method name denotes a one-way notification.
pub fn is_notification_method(method: &str) -> bool {
    method == "initialized" || method.starts_with("notifications/")
}

// ─── Session Descriptors ─────────────────────────────────────────────────────

/// One running editor session, parsed from `<port>.lock`.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// Taken from the file stem, never from the file body.
    pub port: u16,
    pub auth_token: String,
    pub workspace_folders: Vec<String>,
    pub ide_name: Option<String>,
    pub pid: Option<u32>,
    pub transport: Option<String>,
    pub source_path: PathBuf,
}

impl SessionDescriptor {
    /// IDE name for display, `"Unknown"` when the lock file omits it.
    pub fn display_ide_name(&self) -> &str {
        self.ide_name.as_deref().unwrap_or("Unknown")
    }

    /// Whether any workspace folder contains `hint` as a substring.
    pub fn matches_workspace(&self, hint: &str) -> bool {
        self.workspace_folders
            .iter()
            .any(|folder| folder.contains(hint))
    }
}

impl fmt::Debug for SessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDescriptor")
            .field("port", &self.port)
            .field("auth_token", &"<redacted>")
            .field("workspace_folders", &self.workspace_folders)
            .field("ide_name", &self.ide_name)
            .field("pid", &self.pid)
            .field("transport", &self.transport)
            .field("source_path", &self.source_path)
            .finish()
    }
}

/// Where to connect, kept by the client for reconnection.
#[derive(Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub auth_token: String,
}

impl Endpoint {
    pub fn url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

// ─── Connection State ────────────────────────────────────────────────────────

/// Lifecycle of the single connection owned by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    HandshakeInFlight,
    Ready,
    /// Not entered by this client: `disconnect` closes synchronously and
    /// lands directly in `Disconnected`.
    Closing,
}

impl ConnectionState {
    /// A socket is open (handshake may or may not be done).
    pub fn is_open(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::HandshakeInFlight | ConnectionState::Ready
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::HandshakeInFlight => "handshake-in-flight",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

// ─── WebSocket Close Codes ───────────────────────────────────────────────────

/// Close codes with meaning to the connection manager.
pub mod close_codes {
    /// Clean shutdown.
    pub const NORMAL: u16 = 1000;
    /// Peer rejected the auth token (policy violation).
    pub const AUTH_REJECTED: u16 = 1008;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
