//! Session discovery — scan the IDE lock directory for `<port>.lock` descriptors.
//!
//! Each running editor integration writes one lock file named after the port
//! it listens on. The file body is JSON with the auth token and workspace
//! folders. Nothing is cached: every scan re-reads the directory.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::types::SessionDescriptor;

/// Extension of descriptor files.
const LOCK_EXTENSION: &str = "lock";

/// `~/.claude/ide`, the directory editor integrations write lock files into.
pub fn default_lock_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("ide")
}

/// On-disk shape of a lock file. Unknown fields (including any `port`) are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockFileContents {
    auth_token: String,
    #[serde(default)]
    workspace_folders: Vec<String>,
    #[serde(default)]
    ide_name: Option<String>,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    transport: Option<String>,
}

/// Scan `lock_dir` and return every parseable session descriptor.
///
/// A missing directory yields an empty list. Files that fail to read or parse
/// are logged and skipped. Results are sorted by port.
pub fn scan_descriptors(lock_dir: &Path) -> Vec<SessionDescriptor> {
    let entries = match std::fs::read_dir(lock_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(
                path = %lock_dir.display(),
                error = %e,
                "lock directory not readable, no sessions discovered"
            );
            return Vec::new();
        }
    };

    let mut descriptors: Vec<SessionDescriptor> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(LOCK_EXTENSION))
        .filter_map(|path| match read_descriptor(&path) {
            Ok(descriptor) => Some(descriptor),
            Err(reason) => {
                tracing::warn!(path = %path.display(), %reason, "skipping lock file");
                None
            }
        })
        .collect();

    descriptors.sort_by_key(|d| d.port);
    tracing::debug!(
        path = %lock_dir.display(),
        count = descriptors.len(),
        "scanned IDE lock files"
    );
    descriptors
}

/// Parse a single lock file. The port comes from the file stem.
fn read_descriptor(path: &Path) -> Result<SessionDescriptor, String> {
    let port = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| "file stem is not a port number".to_string())?;

    let raw = std::fs::read_to_string(path).map_err(|e| format!("read failed: {e}"))?;
    let contents: LockFileContents =
        serde_json::from_str(&raw).map_err(|e| format!("invalid JSON: {e}"))?;

    Ok(SessionDescriptor {
        port,
        auth_token: contents.auth_token,
        workspace_folders: contents.workspace_folders,
        ide_name: contents.ide_name,
        pid: contents.pid,
        transport: contents.transport,
        source_path: path.to_path_buf(),
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
