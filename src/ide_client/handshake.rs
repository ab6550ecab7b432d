//! Initialize handshake.
//!
//! Runs once per socket: `initialize` request → success reply →
//! `initialized` notification → session `Ready`. Until then the connection
//! manager rejects every other call.

use serde_json::json;

use crate::config::ClientConfig;

use super::connection::{Gate, HandshakeStart, Shared};
use super::errors::IdeError;

/// Method of the handshake request.
pub const INITIALIZE_METHOD: &str = "initialize";

/// Method of the notification sent once the peer has answered.
pub const INITIALIZED_METHOD: &str = "initialized";

/// Parameters offered in `initialize`.
pub fn initialize_params(config: &ClientConfig) -> serde_json::Value {
    json!({
        "protocolVersion": config.protocol_version,
        "capabilities": {
            "tools": {},
            "resources": {},
            "prompts": {},
        },
        "clientInfo": {
            "name": config.client_name,
            "version": config.client_version,
        },
    })
}

/// Run the handshake on the current socket.
///
/// Returns the peer's initialize result. When the session is already ready
/// nothing is sent and the stored result is returned again.
pub async fn initialize(shared: &Shared) -> Result<serde_json::Value, IdeError> {
    let epoch = match shared.begin_handshake()? {
        HandshakeStart::AlreadyReady(result) => return Ok(result),
        HandshakeStart::Begin { epoch } => epoch,
    };

    let outcome = async {
        let result = shared
            .request(INITIALIZE_METHOD, initialize_params(&shared.config), Gate::Handshake)
            .await?;
        shared.notify(INITIALIZED_METHOD, json!({}), Gate::Handshake)?;
        Ok(result)
    }
    .await;

    if let Err(e) = &outcome {
        tracing::warn!(error = %e, "initialize handshake failed");
    }
    shared.finish_handshake(epoch, outcome)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
