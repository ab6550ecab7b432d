//! IDE Client — WebSocket JSON-RPC client for locally running editor sessions.
//!
//! This module handles:
//! - Discovering sessions from `~/.claude/ide/<port>.lock` descriptors
//! - Choosing one session (single, workspace hint, or interactive pick)
//! - An authenticated socket with bounded reconnection
//! - Request/reply correlation with per-call deadlines
//! - The `initialize` handshake and the named editor tools

pub mod client;
pub mod connection;
pub mod correlation;
pub mod discovery;
pub mod errors;
pub mod handshake;
pub mod selector;
pub mod tools;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use client::IdeClient;
pub use discovery::{default_lock_dir, scan_descriptors};
pub use errors::IdeError;
pub use selector::{select_session, ChoicePrompt, StdinPrompt};
pub use tools::{OpenDiffRequest, OpenFileOptions};
pub use types::{ConnectionState, Endpoint, PeerNotification, SessionDescriptor};
