//! WebSocket transport.
//!
//! Opens the authenticated socket and runs two background tasks per
//! connection:
//! - a writer draining an unbounded queue into the socket, so callers never
//!   contend for the sink
//! - a reader handing each inbound text frame, strictly in order, to a
//!   callback, then reporting the close code once the socket ends

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::errors::IdeError;
use super::types::Endpoint;

/// Upgrade header carrying the session's auth token.
pub const AUTH_HEADER: &str = "x-claude-code-ide-authorization";

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A frame queued for the writer task.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: &'static str },
}

/// Sending half of a live connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl TransportHandle {
    /// Queue a text frame. Fails with `NotConnected` once the writer is gone.
    pub fn send_text(&self, text: String) -> Result<(), IdeError> {
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| IdeError::NotConnected)
    }

    /// Queue a close frame; the writer stops after sending it.
    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.outbound.send(Outbound::Close { code, reason });
    }
}

// ─── Connecting ──────────────────────────────────────────────────────────────

/// Open a WebSocket to `endpoint`, presenting its token in the upgrade request.
///
/// An HTTP 401/403 answer to the upgrade is reported as `AuthenticationFailed`.
pub async fn open(endpoint: &Endpoint, connect_timeout: Duration) -> Result<WsStream, IdeError> {
    let url = endpoint.url();
    let connect_failed = |reason: String| IdeError::ConnectFailed {
        endpoint: url.clone(),
        reason,
    };

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| connect_failed(format!("invalid request: {e}")))?;
    let token = HeaderValue::from_str(&endpoint.auth_token)
        .map_err(|e| connect_failed(format!("auth token is not a valid header value: {e}")))?;
    request.headers_mut().insert(AUTH_HEADER, token);

    match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request)).await {
        Err(_) => Err(connect_failed(format!(
            "timed out after {}ms",
            connect_timeout.as_millis()
        ))),
        Ok(Err(WsError::Http(response)))
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            tracing::warn!(port = endpoint.port, status = %response.status(), "upgrade rejected");
            Err(IdeError::AuthenticationFailed)
        }
        Ok(Err(e)) => Err(connect_failed(e.to_string())),
        Ok(Ok((stream, _response))) => Ok(stream),
    }
}

// ─── I/O Tasks ───────────────────────────────────────────────────────────────

/// Split `stream` and spawn its reader and writer tasks.
///
/// `on_frame` sees every inbound text frame in arrival order and returns
/// `false` to stop reading. `on_close` runs exactly once when reading stops,
/// with the peer's close code if one was received.
pub fn spawn_io<F, C>(stream: WsStream, mut on_frame: F, on_close: C) -> TransportHandle
where
    F: FnMut(&str) -> bool + Send + 'static,
    C: FnOnce(Option<u16>) + Send + 'static,
{
    let (mut sink, mut reader) = stream.split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<Outbound>();

    tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::debug!(error = %e, "websocket write failed");
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let close = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(close))).await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        let mut close_code = None;
        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if !on_frame(&text) {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    close_code = frame.map(|f| u16::from(f.code));
                    break;
                }
                Ok(Message::Binary(_)) => {
                    tracing::debug!("ignoring binary frame");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "websocket read failed");
                    break;
                }
            }
        }
        on_close(close_code);
    });

    TransportHandle { outbound }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
