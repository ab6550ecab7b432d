//! IDE client error types.

use thiserror::Error;

/// Errors that can occur while discovering, connecting to, or calling an IDE session.
#[derive(Debug, Error)]
pub enum IdeError {
    /// The lock directory held no parseable session descriptors.
    #[error("no IDE sessions found in '{dir}' (is the editor integration running?)")]
    NoSessionFound { dir: String },

    /// A workspace hint was given but no session's folders contain it.
    #[error("no workspace found matching '{hint}'")]
    NoMatchingSession {
        hint: String,
        /// Workspace folders of every candidate, for display by the caller.
        candidates: Vec<Vec<String>>,
    },

    /// The interactive choice was not a number in `1..=N`.
    #[error("invalid selection: '{input}'")]
    InvalidSelection { input: String },

    /// No open socket to send on.
    #[error("not connected to an IDE session")]
    NotConnected,

    /// The socket is open but the initialize handshake has not completed.
    #[error("session not initialized (handshake incomplete)")]
    NotInitialized,

    /// Opening the socket failed.
    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// The peer rejected the auth token. Never retried.
    #[error("authentication failed - invalid token")]
    AuthenticationFailed,

    /// The connection closed while the call was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// No reply arrived within the per-request deadline.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    RequestTimedOut { method: String, timeout_ms: u64 },

    /// The peer answered with a JSON-RPC error object.
    #[error("RPC error: {message}")]
    RemoteError {
        code: Option<i64>,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Local serialization or framing failure.
    #[error("transport error: {reason}")]
    TransportError { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl IdeError {
    /// Whether this error ends the session for good (no reconnection).
    pub fn is_fatal(&self) -> bool {
        matches!(self, IdeError::AuthenticationFailed)
    }

    /// Whether a caller could reasonably try the same operation again.
    ///
    /// The client never retries calls itself; this is a hint for callers.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            IdeError::RequestTimedOut { .. }
                | IdeError::ConnectionClosed
                | IdeError::NotConnected
                | IdeError::NotInitialized
        )
    }
}
