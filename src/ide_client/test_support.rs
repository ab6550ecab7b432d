//! In-process WebSocket peer for exercising the client over real sockets.
//!
//! The peer checks the auth header, records every JSON frame it receives, and
//! answers through a scripted handler. A wrong token is answered with close
//! code 1008, the way the editor integration rejects clients.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ClientConfig;

use super::transport::AUTH_HEADER;
use super::types::{close_codes, SessionDescriptor};

type Handler = Arc<dyn Fn(&Value) -> Vec<PeerAction> + Send + Sync>;

/// What the peer does in response to one inbound frame.
pub(crate) enum PeerAction {
    Send(Value),
    SendRaw(String),
    Sleep(Duration),
    Close(u16),
}

impl PeerAction {
    pub(crate) fn reply(frame: &Value, result: Value) -> Self {
        PeerAction::Send(json!({"jsonrpc": "2.0", "id": frame["id"], "result": result}))
    }

    pub(crate) fn reply_error(frame: &Value, code: i64, message: &str) -> Self {
        PeerAction::Send(json!({
            "jsonrpc": "2.0",
            "id": frame["id"],
            "error": {"code": code, "message": message},
        }))
    }
}

/// Answers `initialize`, `tools/list` and `tools/call`; ignores notifications.
pub(crate) fn default_handler(frame: &Value) -> Vec<PeerAction> {
    match frame["method"].as_str() {
        Some("initialize") => vec![PeerAction::reply(
            frame,
            json!({"protocolVersion": "2024-11-05", "serverInfo": {"name": "mock-ide"}}),
        )],
        Some("tools/list") => vec![PeerAction::reply(
            frame,
            json!({"tools": [{"name": "openFile", "description": "Open a file"}]}),
        )],
        Some("tools/call") => vec![PeerAction::reply(
            frame,
            json!({"tool": frame["params"]["name"], "arguments": frame["params"]["arguments"]}),
        )],
        _ => vec![],
    }
}

/// Short timeouts so failure paths finish quickly.
pub(crate) fn fast_config() -> ClientConfig {
    ClientConfig {
        request_timeout_ms: 500,
        connect_timeout_ms: 1_000,
        reconnect_backoff_ms: 20,
        ..ClientConfig::default()
    }
}

/// Poll `condition` for up to three seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub(crate) struct MockPeer {
    pub port: u16,
    token: String,
    frames: Arc<Mutex<Vec<Value>>>,
    sessions: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockPeer {
    pub(crate) async fn start(token: &str) -> Self {
        Self::spawn(token, Arc::new(default_handler), None).await
    }

    pub(crate) async fn start_with<F>(token: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> Vec<PeerAction> + Send + Sync + 'static,
    {
        Self::spawn(token, Arc::new(handler), None).await
    }

    /// Serve `max_sessions` WebSocket sessions, then drop every further
    /// TCP connection before the upgrade.
    pub(crate) async fn start_limited<F>(token: &str, handler: F, max_sessions: usize) -> Self
    where
        F: Fn(&Value) -> Vec<PeerAction> + Send + Sync + 'static,
    {
        Self::spawn(token, Arc::new(handler), Some(max_sessions)).await
    }

    async fn spawn(token: &str, handler: Handler, max_sessions: Option<usize>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sessions = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));

        let task = {
            let token = token.to_string();
            let frames = Arc::clone(&frames);
            let sessions = Arc::clone(&sessions);
            let dropped = Arc::clone(&dropped);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    if max_sessions.is_some_and(|max| sessions.load(Ordering::SeqCst) >= max) {
                        dropped.fetch_add(1, Ordering::SeqCst);
                        drop(stream);
                        continue;
                    }
                    sessions.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        token.clone(),
                        Arc::clone(&handler),
                        Arc::clone(&frames),
                    ));
                }
            })
        };

        Self {
            port,
            token: token.to_string(),
            frames,
            sessions,
            dropped,
            task,
        }
    }

    pub(crate) fn descriptor(&self) -> SessionDescriptor {
        self.descriptor_with_token(&self.token)
    }

    pub(crate) fn descriptor_with_token(&self, token: &str) -> SessionDescriptor {
        SessionDescriptor {
            port: self.port,
            auth_token: token.to_string(),
            workspace_folders: vec!["/home/user/proj".to_string()],
            ide_name: Some("Mock IDE".to_string()),
            pid: None,
            transport: None,
            source_path: PathBuf::from(format!("/tmp/{}.lock", self.port)),
        }
    }

    /// Every JSON frame received so far, across all sessions.
    pub(crate) fn frames(&self) -> Vec<Value> {
        self.frames.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for_frames(&self, count: usize) -> Vec<Value> {
        eventually(|| self.frames.lock().unwrap().len() >= count).await;
        self.frames()
    }

    /// WebSocket sessions accepted.
    pub(crate) fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// TCP connections dropped after the session limit was reached.
    pub(crate) fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl Drop for MockPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, token: String, handler: Handler, frames: Arc<Mutex<Vec<Value>>>) {
    let presented: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&presented);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        *captured.lock().unwrap() = request
            .headers()
            .get(AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };

    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    let authorized = presented.lock().unwrap().as_deref() == Some(token.as_str());
    if !authorized {
        close_with(&mut ws, close_codes::AUTH_REJECTED).await;
        return;
    }

    while let Some(Ok(message)) = ws.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        frames.lock().unwrap().push(frame.clone());

        for action in handler(&frame) {
            match action {
                PeerAction::Send(value) => {
                    let _ = ws.send(Message::Text(value.to_string())).await;
                }
                PeerAction::SendRaw(raw) => {
                    let _ = ws.send(Message::Text(raw)).await;
                }
                PeerAction::Sleep(duration) => tokio::time::sleep(duration).await,
                PeerAction::Close(code) => {
                    close_with(&mut ws, code).await;
                    return;
                }
            }
        }
    }
}

async fn close_with(ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>, code: u16) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    };
    let _ = ws.close(Some(frame)).await;
    while let Some(Ok(_)) = ws.next().await {}
}
