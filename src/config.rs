//! Client configuration loading and validation.
//!
//! Reads an optional `.ide-bridge.yaml` and resolves environment variables.
//! Every field has a default, so a missing file means "use defaults".

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::ide_client::errors::IdeError;

/// Env var pointing directly at a config file.
pub const CONFIG_ENV_VAR: &str = "IDE_BRIDGE_CONFIG";

/// File name searched for when walking upward.
pub const CONFIG_FILE_NAME: &str = ".ide-bridge.yaml";

/// Upper bound accepted for `max_reconnect_attempts`.
const MAX_RECONNECT_ATTEMPTS_LIMIT: u32 = 10;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Runtime settings for an [`IdeClient`](crate::IdeClient).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host the editor listens on. Lock files only carry the port.
    pub host: String,
    /// Directory holding `<port>.lock` descriptors. `None` means `~/.claude/ide`.
    pub lock_dir: Option<PathBuf>,
    /// Per-request reply deadline.
    pub request_timeout_ms: u64,
    /// Deadline for the WebSocket upgrade.
    pub connect_timeout_ms: u64,
    /// Reconnection attempts after an unexpected closure.
    pub max_reconnect_attempts: u32,
    /// Linear backoff unit: attempt `n` waits `n * reconnect_backoff_ms`.
    pub reconnect_backoff_ms: u64,
    /// Protocol version offered in `initialize`.
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            lock_dir: None,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            max_reconnect_attempts: 3,
            reconnect_backoff_ms: 1_000,
            protocol_version: "2024-11-05".to_string(),
            client_name: "ide-bridge".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ClientConfig {
    /// Load from `IDE_BRIDGE_CONFIG` or the nearest `.ide-bridge.yaml` above the
    /// current directory, falling back to defaults when neither exists.
    pub fn discover() -> Result<Self, IdeError> {
        let cwd = std::env::current_dir().unwrap_or_default();
        match find_config_path(&cwd) {
            Some(path) => load_config(&path),
            None => Ok(Self::default()),
        }
    }

    /// Check ranges. Called by [`load_config`]; call it yourself for hand-built configs.
    pub fn validate(&self) -> Result<(), IdeError> {
        if self.host.trim().is_empty() {
            return Err(IdeError::ConfigError {
                reason: "host must not be empty".into(),
            });
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(IdeError::ConfigError {
                reason: "timeouts must be greater than zero".into(),
            });
        }
        if self.max_reconnect_attempts > MAX_RECONNECT_ATTEMPTS_LIMIT {
            return Err(IdeError::ConfigError {
                reason: format!(
                    "max_reconnect_attempts {} exceeds limit {MAX_RECONNECT_ATTEMPTS_LIMIT}",
                    self.max_reconnect_attempts
                ),
            });
        }
        Ok(())
    }

    /// Resolved descriptor directory.
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(crate::ide_client::discovery::default_lock_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay before reconnection attempt number `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate a config file.
///
/// Checks `IDE_BRIDGE_CONFIG` first, then walks upward from `start` looking
/// for `.ide-bridge.yaml`.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points at a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load and validate a config file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<ClientConfig, IdeError> {
    let raw = std::fs::read_to_string(path).map_err(|e| IdeError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let mut config: ClientConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| IdeError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?;

    config.lock_dir = config
        .lock_dir
        .map(|dir| PathBuf::from(expand_tilde(&dir.to_string_lossy())));

    config.validate()?;
    tracing::debug!(path = %path.display(), "loaded client config");
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
