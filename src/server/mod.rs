//! Broker network surface.
//!
//! Two listeners: a plaintext TCP listener ghosts dial into (each
//! accepted socket becomes a [`ConnServer`]), and a thin axum front-end
//! exposing the operator contract: agent listing, terminal/shell/logcat/
//! forward WebSockets, file download, and the fleet upgrade trigger.
//! Operator authentication is assumed to happen upstream.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::conn::{ConnPolicy, ConnServer};
use crate::registry::{DownloadHandle, GhostRegistry, RegistryError};
use crate::ws::{self, OperatorPeer, WsMessage};

/// A running broker: both listeners bound, accept loops spawned.
pub struct BrokerHandle {
    ghost_addr: SocketAddr,
    http_addr: SocketAddr,
    registry: Arc<GhostRegistry>,
    shutdown_tx: watch::Sender<bool>,
    http_task: JoinHandle<Result<(), io::Error>>,
    ghost_task: JoinHandle<()>,
}

impl BrokerHandle {
    /// Address ghosts connect to (useful when binding to port 0).
    pub fn ghost_addr(&self) -> SocketAddr {
        self.ghost_addr
    }

    /// Address of the operator front-end.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// `http://ip:port` base URL of the operator front-end.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.http_addr)
    }

    pub fn registry(&self) -> &Arc<GhostRegistry> {
        &self.registry
    }

    /// Stop both listeners and await their tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(Duration::from_secs(5), self.http_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => error!(error = %err, "http server task failed"),
            Ok(Err(err)) => error!(error = %err, "http server task panicked"),
            Err(_) => warn!("http server task did not finish within 5s"),
        }
        if tokio::time::timeout(Duration::from_secs(5), self.ghost_task)
            .await
            .is_err()
        {
            warn!("ghost accept loop did not finish within 5s");
        }
    }
}

/// Bind both listeners and start serving.
pub async fn run_broker(config: BrokerConfig) -> Result<BrokerHandle, Box<dyn std::error::Error>> {
    config.validate()?;
    let registry = Arc::new(GhostRegistry::new(
        config.target_ssh_port_start,
        config.target_ssh_port_end,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ghost_listener = TcpListener::bind(config.ghost_bind).await?;
    let ghost_addr = ghost_listener.local_addr()?;
    let ghost_task = tokio::spawn(ghost_accept_loop(
        ghost_listener,
        registry.clone(),
        config.conn_policy(),
        shutdown_rx.clone(),
    ));

    let http_listener = TcpListener::bind(config.http_bind).await?;
    let http_addr = http_listener.local_addr()?;
    let app = router(registry.clone());
    let mut shutdown_watch = shutdown_rx;
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown_watch.borrow() {
                        break;
                    }
                    if shutdown_watch.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    });

    info!(ghost = %ghost_addr, http = %http_addr, "overlord listening");
    Ok(BrokerHandle {
        ghost_addr,
        http_addr,
        registry,
        shutdown_tx,
        http_task,
        ghost_task,
    })
}

async fn ghost_accept_loop(
    listener: TcpListener,
    registry: Arc<GhostRegistry>,
    policy: ConnPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "ghost connected");
                    match ConnServer::from_stream(stream, registry.clone(), policy.clone()) {
                        Ok(conn) => {
                            tokio::spawn(conn.serve());
                        }
                        Err(err) => warn!(error = %err, "failed to take ghost connection"),
                    }
                }
                Err(err) => warn!(error = %err, "ghost accept failed"),
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

fn router(registry: Arc<GhostRegistry>) -> Router {
    Router::new()
        .route("/api/agents", get(list_agents_handler))
        .route("/api/agents/upgrade", post(upgrade_handler))
        .route("/api/agents/:mid/tty", get(tty_handler))
        .route("/api/agents/:mid/shell", get(shell_handler))
        .route("/api/agents/:mid/logcat", get(logcat_handler))
        .route("/api/agents/:mid/forward", get(forward_handler))
        .route("/api/agents/:mid/download", get(download_handler))
        .with_state(registry)
}

async fn list_agents_handler(State(registry): State<Arc<GhostRegistry>>) -> impl IntoResponse {
    Json(json!({ "agents": registry.list_agents() }))
}

async fn upgrade_handler(State(registry): State<Arc<GhostRegistry>>) -> impl IntoResponse {
    Json(json!({ "notified": registry.upgrade_all() }))
}

#[derive(Deserialize)]
struct TtyQuery {
    tty_device: Option<String>,
}

async fn tty_handler(
    upgrade: WebSocketUpgrade,
    Path(mid): Path<String>,
    Query(query): Query<TtyQuery>,
    State(registry): State<Arc<GhostRegistry>>,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let (handle, peer) = ws::channel();
        match registry
            .request_terminal(&mid, query.tty_device, handle)
            .await
        {
            Ok(sid) => {
                debug!(mid = %mid, sid = %sid, "terminal session opened");
                pump_operator_socket(socket, peer).await;
            }
            Err(err) => close_with_error(socket, &err).await,
        }
    })
}

#[derive(Deserialize)]
struct ShellQuery {
    command: String,
}

async fn shell_handler(
    upgrade: WebSocketUpgrade,
    Path(mid): Path<String>,
    Query(query): Query<ShellQuery>,
    State(registry): State<Arc<GhostRegistry>>,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let (handle, peer) = ws::channel();
        match registry.request_shell(&mid, query.command, handle).await {
            Ok(sid) => {
                debug!(mid = %mid, sid = %sid, "shell session opened");
                pump_operator_socket(socket, peer).await;
            }
            Err(err) => close_with_error(socket, &err).await,
        }
    })
}

async fn logcat_handler(
    upgrade: WebSocketUpgrade,
    Path(mid): Path<String>,
    State(registry): State<Arc<GhostRegistry>>,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let (handle, peer) = ws::channel();
        registry.connect_logcat(&mid, handle);
        pump_operator_socket(socket, peer).await;
    })
}

#[derive(Deserialize)]
struct ForwardQuery {
    port: u16,
}

async fn forward_handler(
    upgrade: WebSocketUpgrade,
    Path(mid): Path<String>,
    Query(query): Query<ForwardQuery>,
    State(registry): State<Arc<GhostRegistry>>,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let (handle, peer) = ws::channel();
        match registry.request_forward(&mid, query.port, handle).await {
            Ok(sid) => {
                debug!(mid = %mid, sid = %sid, port = query.port, "forward session opened");
                pump_operator_socket(socket, peer).await;
            }
            Err(err) => close_with_error(socket, &err).await,
        }
    })
}

#[derive(Deserialize)]
struct DownloadQuery {
    filename: String,
}

async fn download_handler(
    Path(mid): Path<String>,
    Query(query): Query<DownloadQuery>,
    State(registry): State<Arc<GhostRegistry>>,
) -> Response {
    match registry.request_file_download(&mid, query.filename).await {
        Ok(handle) => {
            let DownloadHandle { filename, data, .. } = handle;
            // Stream chunks until the end-of-stream sentinel (or the
            // connection dying, which ends the body early).
            let body = axum::body::Body::from_stream(futures_util::stream::unfold(
                data,
                |mut data| async move {
                    match data.recv().await {
                        Some(Some(chunk)) => Some((Ok::<_, io::Error>(chunk), data)),
                        _ => None,
                    }
                },
            ));
            Response::builder()
                .header("content-type", "application/octet-stream")
                .header(
                    "content-disposition",
                    format!("attachment; filename=\"{filename}\""),
                )
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &RegistryError) -> Response {
    let status = match err {
        RegistryError::UnknownAgent(_) => StatusCode::NOT_FOUND,
        RegistryError::DownloadTimeout | RegistryError::UploadTimeout => {
            StatusCode::GATEWAY_TIMEOUT
        }
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string()).into_response()
}

async fn close_with_error(mut socket: WebSocket, err: &RegistryError) {
    warn!(error = %err, "operator session failed");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1011,
            reason: err.to_string().into(),
        })))
        .await;
}

/// Bridge a live operator WebSocket onto its channel pair: frames queued
/// by the connection go to the browser, browser frames go back, and a
/// close from either side ends both.
async fn pump_operator_socket(socket: WebSocket, mut peer: OperatorPeer) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = peer.rx.recv() => match frame {
                Some(WsMessage::Binary(data)) => {
                    if sender.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Some(WsMessage::Text(text)) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(WsMessage::Close) | None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if peer.tx.send(WsMessage::Binary(data)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if peer.tx.send(WsMessage::Text(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = peer.tx.send(WsMessage::Close);
                    break;
                }
                // Ping/pong is handled by axum itself.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "operator websocket read failed");
                    let _ = peer.tx.send(WsMessage::Close);
                    break;
                }
            },
        }
    }
}
