//! Request/response correlation.
//!
//! Every outbound request gets a fresh id and a pending entry holding a
//! single-use completion handle. Inbound replies are matched by id; the entry
//! is removed on the first of reply, timeout, or connection loss, so each
//! caller is completed at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::errors::IdeError;
use super::types::{InboundMessage, PeerNotification};

/// Outcome delivered to a waiting caller.
pub type Outcome = Result<serde_json::Value, IdeError>;

/// Bookkeeping for one outstanding request.
#[derive(Debug)]
struct PendingRequest {
    method: String,
    created_at: Instant,
    completion: oneshot::Sender<Outcome>,
}

/// Handle returned by [`PendingTable::register`]; awaited by the caller.
#[derive(Debug)]
pub struct Registration {
    pub id: String,
    pub method: String,
    pub deadline: Instant,
    timeout: Duration,
    receiver: oneshot::Receiver<Outcome>,
}

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Completed the pending entry with this id.
    Completed(String),
    /// A peer-initiated notification.
    Notification(PeerNotification),
    /// Reply with no matching entry (late, unknown, or missing id).
    Stray,
    /// Not parseable as a JSON-RPC envelope.
    Malformed,
}

/// Id → pending entry map, shared by callers and the socket reader.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
    malformed_frames: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a pending entry under a fresh id, unique among outstanding entries.
    pub fn register(&self, method: &str, timeout: Duration) -> Registration {
        let (completion, receiver) = oneshot::channel();
        let created_at = Instant::now();
        let mut entries = self.lock();

        let mut id = uuid::Uuid::new_v4().to_string();
        while entries.contains_key(&id) {
            id = uuid::Uuid::new_v4().to_string();
        }

        entries.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                created_at,
                completion,
            },
        );

        Registration {
            id,
            method: method.to_string(),
            deadline: created_at + timeout,
            timeout,
            receiver,
        }
    }

    /// Drop an entry without completing it. Removing twice is a no-op.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Complete and remove an entry. Returns `false` when no entry matched.
    pub fn complete(&self, id: &str, outcome: Outcome) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        tracing::debug!(
            id,
            method = %entry.method,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "request completed"
        );
        // The caller may already have given up; nothing to do then.
        let _ = entry.completion.send(outcome);
        true
    }

    /// Fail every outstanding entry, leaving the table empty.
    pub fn fail_all(&self, error: impl Fn() -> IdeError) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.completion.send(Err(error()));
        }
        if count > 0 {
            tracing::debug!(count, "failed outstanding requests");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Inbound frames that could not be parsed since this table was created.
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    /// Route one inbound text frame.
    ///
    /// Unparseable frames and replies without a pending entry are logged and
    /// dropped; they never fail the connection.
    pub fn dispatch(&self, text: &str) -> Dispatch {
        let message: InboundMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, "discarding malformed inbound frame");
                return Dispatch::Malformed;
            }
        };

        match (message.id, message.method) {
            (Some(id), _) => {
                let Some(id) = id.as_str() else {
                    tracing::debug!(%id, "discarding reply with non-string id");
                    return Dispatch::Stray;
                };
                let outcome = match message.error {
                    Some(error) => Err(remote_error(error)),
                    None => Ok(message.result.unwrap_or(serde_json::Value::Null)),
                };
                if self.complete(id, outcome) {
                    Dispatch::Completed(id.to_string())
                } else {
                    tracing::debug!(id, "discarding reply with no pending request");
                    Dispatch::Stray
                }
            }
            (None, Some(method)) => Dispatch::Notification(PeerNotification {
                method,
                params: message.params.unwrap_or(serde_json::Value::Null),
            }),
            (None, None) => {
                tracing::debug!("discarding inbound frame with neither id nor method");
                Dispatch::Stray
            }
        }
    }
}

impl Registration {
    /// Wait for the reply. On deadline the entry is removed and the call fails.
    pub async fn wait(self, table: &PendingTable) -> Outcome {
        let deadline = tokio::time::Instant::from_std(self.deadline);
        match tokio::time::timeout_at(deadline, self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                table.remove(&self.id);
                Err(IdeError::ConnectionClosed)
            }
            Err(_) => {
                table.remove(&self.id);
                tracing::warn!(id = %self.id, method = %self.method, "request timed out");
                Err(IdeError::RequestTimedOut {
                    method: self.method,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Build a `RemoteError` from a JSON-RPC error object.
///
/// The message is the object's `message` verbatim, or the whole object
/// rendered as JSON when it carries none.
pub fn remote_error(error: serde_json::Value) -> IdeError {
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    IdeError::RemoteError {
        code: error.get("code").and_then(|c| c.as_i64()),
        message,
        data: error.get("data").cloned(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
