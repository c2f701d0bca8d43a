//! Core server: accepts WebSocket connections and serves the session stream
//! and control channel.
//!
//! Owns nothing but configuration and a handle on the session registry;
//! every connection runs in its own task.

use crate::config::ServerConfig;
use crate::session::{EventPayload, Received, SessionRegistry, SessionRuntime};
use crate::transport::websocket::{self, Inbound, Route, WebSocketConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use webterm_core::{
    decode_message, encode_message, ClientMessage, ControlRequest, ControlResponse, ServerMessage, WebtermError,
    WebtermResult,
};

/// Keystroke frames buffered per viewer while a command boundary is handled.
const INPUT_QUEUE: usize = 256;

/// The webterm server instance.
pub struct WebtermServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl WebtermServer {
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Ask every open connection to close.
    pub fn notify_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind and serve until the listener goes away.
    pub async fn run(self: Arc<Self>) -> WebtermResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| WebtermError::Other(format!("invalid address: {e}")))?;
        let (local_addr, ws_rx) = websocket::start_listener(addr).await?;
        info!(
            addr = %local_addr,
            data_dir = %self.config.data_dir.display(),
            "webterm-server ready"
        );
        self.serve(ws_rx).await;
        Ok(())
    }

    async fn serve(self: Arc<Self>, mut ws_rx: mpsc::Receiver<WebSocketConnection>) {
        while let Some(conn) = ws_rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                let remote = conn.remote_addr;
                if let Err(e) = srv.handle_websocket(conn).await {
                    warn!(remote = %remote, error = %e, "WebSocket connection error");
                }
            });
        }
        info!("listener closed, shutting down");
    }

    async fn handle_websocket(&self, mut conn: WebSocketConnection) -> WebtermResult<()> {
        match conn.route.clone() {
            Route::Control => self.control_loop(&mut conn).await,
            Route::Session { id, raw } => {
                let runtime = match self.registry.get(&id).await {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let msg = encode_message(&ServerMessage::Error { message: e.to_string() })?;
                        let _ = websocket::ws_send_text(&mut conn.ws_stream, msg).await;
                        websocket::ws_close(&mut conn.ws_stream).await;
                        return Ok(());
                    }
                };
                self.session_loop(&mut conn, runtime, raw).await
            }
        }
    }

    /// Stream one session to one viewer and forward the viewer's input.
    async fn session_loop(
        &self,
        conn: &mut WebSocketConnection,
        runtime: Arc<SessionRuntime>,
        raw: bool,
    ) -> WebtermResult<()> {
        let remote = conn.remote_addr;
        let session_id = runtime.id().to_string();
        let mut subscription = runtime.subscribe(remote.to_string()).await;
        info!(session_id = %session_id, remote = %remote, raw, "viewer attached");

        // Input is written from its own task so a command boundary waiting on
        // git never stalls output delivery to this viewer.
        let (input_tx, mut input_rx) = mpsc::channel::<String>(INPUT_QUEUE);
        let (fail_tx, mut fail_rx) = mpsc::channel::<String>(8);
        let writer = {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                while let Some(data) = input_rx.recv().await {
                    if let Err(e) = runtime.send_input(&data).await {
                        let _ = fail_tx.try_send(e.to_string());
                    }
                }
            })
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;
        let mut last_seen = Instant::now();
        let mut streaming = true;

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(session_id = %session_id, "shutdown signal received, closing viewer");
                    break Ok(());
                }

                item = subscription.recv(), if streaming => {
                    match item {
                        Some(item) => {
                            if let Err(e) = send_received(&mut conn.ws_stream, item, raw).await {
                                break Err(e);
                            }
                        }
                        None => {
                            debug!(session_id = %session_id, "session stream ended");
                            streaming = false;
                        }
                    }
                }

                Some(message) = fail_rx.recv() => {
                    if let Err(e) = send_message(&mut conn.ws_stream, &ServerMessage::Error { message }).await {
                        break Err(e);
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.config.idle_timeout {
                        info!(session_id = %session_id, remote = %remote, "viewer timed out");
                        break Ok(());
                    }
                    if let Err(e) = websocket::ws_send_ping(&mut conn.ws_stream).await {
                        break Err(e);
                    }
                }

                inbound = websocket::ws_recv(&mut conn.ws_stream) => {
                    match inbound {
                        Ok(Some(Inbound::Text(text))) => {
                            last_seen = Instant::now();
                            let reply = handle_client_frame(&runtime, &input_tx, &text, raw).await;
                            if let Some(reply) = reply {
                                if let Err(e) = send_message(&mut conn.ws_stream, &reply).await {
                                    break Err(e);
                                }
                            }
                        }
                        Ok(Some(Inbound::Heartbeat)) => last_seen = Instant::now(),
                        Ok(None) => break Ok(()),
                        Err(e) => {
                            debug!(session_id = %session_id, error = %e, "viewer connection ended");
                            break Ok(());
                        }
                    }
                }
            }
        };

        subscription.unsubscribe();
        drop(input_tx);
        // Let queued keystrokes drain; the writer ends once the queue is empty.
        if let Err(e) = writer.await {
            warn!(session_id = %session_id, error = %e, "input writer task failed");
        }
        websocket::ws_close(&mut conn.ws_stream).await;
        info!(session_id = %session_id, remote = %remote, "viewer detached");
        result
    }

    /// Request/response loop of the control channel.
    async fn control_loop(&self, conn: &mut WebSocketConnection) -> WebtermResult<()> {
        let remote = conn.remote_addr;
        debug!(remote = %remote, "control client connected");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                inbound = websocket::ws_recv(&mut conn.ws_stream) => {
                    match inbound? {
                        Some(Inbound::Text(text)) => {
                            let response = match decode_message::<ControlRequest>(&text) {
                                Ok(request) => self.dispatch_control(request).await,
                                Err(e) => ControlResponse::Error { message: e.to_string() },
                            };
                            websocket::ws_send_text(&mut conn.ws_stream, encode_message(&response)?).await?;
                        }
                        Some(Inbound::Heartbeat) => {}
                        None => break,
                    }
                }
            }
        }

        websocket::ws_close(&mut conn.ws_stream).await;
        debug!(remote = %remote, "control client disconnected");
        Ok(())
    }

    /// Execute one control request. Failures become `error` responses.
    pub async fn dispatch_control(&self, request: ControlRequest) -> ControlResponse {
        match self.try_dispatch(request).await {
            Ok(response) => response,
            Err(e) => ControlResponse::Error { message: e.to_string() },
        }
    }

    async fn try_dispatch(&self, request: ControlRequest) -> WebtermResult<ControlResponse> {
        let registry = &self.registry;
        Ok(match request {
            ControlRequest::ListProfiles => ControlResponse::Profiles {
                profiles: registry.profiles().list(),
            },
            ControlRequest::Create { profile_id, quantity } => {
                let mut created = registry.create_many(&profile_id, quantity).await?;
                if created.len() == 1 {
                    let runtime = created.remove(0);
                    ControlResponse::Session {
                        session: runtime.summary(),
                    }
                } else {
                    ControlResponse::Sessions {
                        sessions: created.iter().map(|r| r.summary()).collect(),
                    }
                }
            }
            ControlRequest::List => ControlResponse::Sessions {
                sessions: registry.list().await,
            },
            ControlRequest::Get { session_id } => ControlResponse::Session {
                session: registry.get(&session_id).await?.summary(),
            },
            ControlRequest::Delete { session_id } => {
                registry.delete(&session_id).await?;
                ControlResponse::Deleted { session_id }
            }
            ControlRequest::Stop { session_id } => {
                let stopped = registry.stop(&session_id).await?;
                ControlResponse::Stopped { session_id, stopped }
            }
            ControlRequest::Log { session_id } => {
                let runtime = registry.get(&session_id).await?;
                let content = runtime.log().await?;
                ControlResponse::Log {
                    historical: !runtime.is_live(),
                    session_id,
                    content,
                }
            }
            ControlRequest::ClearLog { session_id } => {
                registry.get(&session_id).await?.clear_log().await?;
                ControlResponse::LogCleared { session_id }
            }
            ControlRequest::GitChanges { session_id } => {
                let runtime = registry.get(&session_id).await?;
                match runtime.git_changes().await {
                    Some((status, diff_stat)) => ControlResponse::GitChanges {
                        git: true,
                        message: None,
                        status: Some(status),
                        diff_stat,
                    },
                    None => ControlResponse::GitChanges {
                        git: false,
                        message: Some("working directory is not a git repository".into()),
                        status: None,
                        diff_stat: None,
                    },
                }
            }
            ControlRequest::Ping => ControlResponse::Pong,
        })
    }
}

/// Apply one client frame. Returns a direct reply, if any.
async fn handle_client_frame(
    runtime: &SessionRuntime,
    input_tx: &mpsc::Sender<String>,
    text: &str,
    raw: bool,
) -> Option<ServerMessage> {
    let message = match decode_message::<ClientMessage>(text) {
        Ok(message) => message,
        // Raw viewers may send plain keystrokes.
        Err(_) if raw => ClientMessage::Input { data: text.to_string() },
        Err(e) => return Some(ServerMessage::Error { message: e.to_string() }),
    };
    match message {
        ClientMessage::Input { data } => {
            if !runtime.is_live() {
                return Some(ServerMessage::Error {
                    message: WebtermError::ProcessExited(runtime.id().to_string()).to_string(),
                });
            }
            if input_tx.send(data).await.is_err() {
                return Some(ServerMessage::Error {
                    message: "input writer is gone".into(),
                });
            }
            None
        }
        ClientMessage::Resize { cols, rows } => runtime
            .resize(cols, rows)
            .err()
            .map(|e| ServerMessage::Error { message: e.to_string() }),
        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}

async fn send_message(ws: &mut WebSocketStream<TcpStream>, message: &ServerMessage) -> WebtermResult<()> {
    websocket::ws_send_text(ws, encode_message(message)?).await
}

/// Render one broadcaster item onto the wire.
async fn send_received(ws: &mut WebSocketStream<TcpStream>, item: Received, raw: bool) -> WebtermResult<()> {
    match item {
        Received::Replay(events) => {
            for event in events {
                send_payload(ws, event.payload, raw).await?;
            }
            Ok(())
        }
        Received::Event(event) => send_payload(ws, event.payload, raw).await,
        Received::Status(update) => {
            send_message(
                ws,
                &ServerMessage::Status {
                    status: update.status,
                    exit_code: update.exit_code,
                },
            )
            .await
        }
        Received::Gap { missed } => send_message(ws, &ServerMessage::Gap { missed }).await,
    }
}

async fn send_payload(ws: &mut WebSocketStream<TcpStream>, payload: EventPayload, raw: bool) -> WebtermResult<()> {
    match (payload, raw) {
        (EventPayload::Output(text), true) => websocket::ws_send_text(ws, text.to_string()).await,
        (EventPayload::Output(text), false) => {
            send_message(ws, &ServerMessage::Output { data: text.to_string() }).await
        }
        (EventPayload::GitDelta(delta), true) => websocket::ws_send_text(ws, format!("{}\r\n", delta.render())).await,
        (EventPayload::GitDelta(delta), false) => send_message(ws, &ServerMessage::GitDelta((*delta).clone())).await,
    }
}
