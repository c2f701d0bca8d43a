//! WebSocket listener using tokio-tungstenite.
//!
//! The request path is inspected during the upgrade: `/ws/control` and
//! `/ws/sessions/{id}` are accepted, anything else is refused with 404
//! before a WebSocket exists.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use webterm_core::{WebtermError, WebtermResult};

/// Maximum frame size accepted from clients (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// What an accepted connection asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Control,
    Session {
        id: String,
        /// Output as unframed text frames (`?format=raw`).
        raw: bool,
    },
}

/// Map a request path and query onto a route.
pub fn parse_route(path: &str, query: Option<&str>) -> Option<Route> {
    let path = path.trim_end_matches('/');
    if path == "/ws/control" {
        return Some(Route::Control);
    }
    let id = path.strip_prefix("/ws/sessions/")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    let raw = query
        .unwrap_or_default()
        .split('&')
        .any(|pair| pair == "format=raw");
    Some(Route::Session {
        id: id.to_string(),
        raw,
    })
}

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    pub route: Route,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> WebtermResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| WebtermError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut route = None;
                        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            route = parse_route(req.uri().path(), req.uri().query());
                            if route.is_some() {
                                Ok(resp)
                            } else {
                                let mut refusal = ErrorResponse::new(Some("not found".into()));
                                *refusal.status_mut() = StatusCode::NOT_FOUND;
                                Err(refusal)
                            }
                        };
                        let accepted = tokio_tungstenite::accept_hdr_async(stream, callback).await;
                        match accepted {
                            Ok(ws_stream) => {
                                let Some(route) = route else {
                                    return;
                                };
                                debug!(remote = %addr, ?route, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    route,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// One inbound item that matters to a connection loop.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    /// A ping or pong from the peer; proves liveness, carries nothing.
    Heartbeat,
}

/// Helper: send a text frame.
pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: String) -> WebtermResult<()> {
    ws.send(Message::text(text))
        .await
        .map_err(|e| WebtermError::Transport(format!("WS send failed: {e}")))
}

/// Helper: send a protocol-level ping.
pub async fn ws_send_ping(ws: &mut WebSocketStream<TcpStream>) -> WebtermResult<()> {
    ws.send(Message::Ping(Vec::new().into()))
        .await
        .map_err(|e| WebtermError::Transport(format!("WS ping failed: {e}")))
}

/// Helper: receive the next text frame (binary frames holding UTF-8 are
/// accepted as text).
///
/// Returns `None` if the connection is closed. Pings are answered here.
pub async fn ws_recv(ws: &mut WebSocketStream<TcpStream>) -> WebtermResult<Option<Inbound>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_WS_FRAME_SIZE {
                    return Err(frame_too_large(text.len()));
                }
                return Ok(Some(Inbound::Text(text.to_string())));
            }
            Some(Ok(Message::Binary(data))) => {
                if data.len() > MAX_WS_FRAME_SIZE {
                    return Err(frame_too_large(data.len()));
                }
                match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Ok(Some(Inbound::Text(text))),
                    Err(_) => debug!("ignoring non-UTF-8 binary frame"),
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
                return Ok(Some(Inbound::Heartbeat));
            }
            Some(Ok(Message::Pong(_))) => return Ok(Some(Inbound::Heartbeat)),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(WebtermError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

/// Helper: close the connection, ignoring errors from an already-gone peer.
pub async fn ws_close(ws: &mut WebSocketStream<TcpStream>) {
    let _ = ws.close(None).await;
}

fn frame_too_large(len: usize) -> WebtermError {
    WebtermError::InvalidMessage(format!(
        "WS frame too large: {len} bytes (max {MAX_WS_FRAME_SIZE})"
    ))
}
