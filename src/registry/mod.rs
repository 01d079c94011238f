//! Broker-wide ghost registry.
//!
//! Tracks every registered connection, pairs incoming stream-mode ghosts
//! with the operators waiting for them, allocates target SSH forwarding
//! ports, and brokers the file-transfer handoffs. Connections hold a
//! non-owning [`Registry`] handle injected at construction; the registry
//! owns nothing about a connection beyond its command/response channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conn::{Command, FileAction};
use crate::proto::Mode;
use crate::ws::OperatorWs;

/// How long the operator side waits for a spawned FILE ghost to hand
/// over its download context.
const DOWNLOAD_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the operator side waits for an upload ghost to signal
/// `clear_to_upload`.
const UPLOAD_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate machine ID: {0}")]
    DuplicateMid(String),
    #[error("unknown registration mode")]
    UnknownMode,
    #[error("no operator waiting for session {0}")]
    NoOperatorWaiting(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("agent connection lost")]
    AgentGone,
    #[error("{0}")]
    CommandFailed(String),
    #[error("target SSH port range exhausted")]
    PortExhausted,
    #[error("timed out waiting for download handoff")]
    DownloadTimeout,
    #[error("timed out waiting for upload handoff")]
    UploadTimeout,
}

/// What a successful registration pairs the connection with.
pub enum Pairing {
    /// Nothing to pair (AGENT and FILE modes).
    None,
    /// The single operator WebSocket waiting for this session.
    Operator(OperatorWs),
    /// Viewers already waiting for this machine's log stream.
    Viewers(Vec<OperatorWs>),
}

/// Everything the registry needs to track a registering connection.
pub struct RegisteredConn {
    pub sid: String,
    pub mid: String,
    pub mode: Mode,
    pub properties: Map<String, Value>,
    pub commands: mpsc::UnboundedSender<Command>,
    pub responses: Option<mpsc::UnboundedReceiver<String>>,
}

/// Download context handed from a FILE connection to the operator side.
/// `data` yields chunks until the `None` end-of-stream sentinel.
pub struct DownloadHandle {
    pub filename: String,
    pub size: i64,
    pub terminal_sid: String,
    pub data: mpsc::Receiver<Option<Vec<u8>>>,
}

/// The contract a connection consumes. See `GhostRegistry` for the
/// broker's implementation.
pub trait Registry: Send + Sync {
    /// Pair a registering connection. Errors are surfaced to the ghost as
    /// the response status and abort the connection.
    fn register(&self, conn: RegisteredConn) -> Result<Pairing, RegistryError>;

    /// Remove a connection. Idempotent.
    fn unregister(&self, mode: Mode, sid: &str, mid: &str);

    /// Pick an unused port in the target SSH forwarding range.
    fn suggest_target_ssh_port(&self) -> Result<u16, RegistryError>;

    /// Record (or clear, with `None`) the port a machine has claimed.
    fn set_target_ssh_port(&self, mid: &str, port: Option<u16>);

    /// Hand a FILE connection's download context to the operator side.
    fn register_download_request(&self, sid: &str, download: DownloadHandle);

    /// Signal that an upload ghost is ready to receive file bytes.
    fn register_upload_request(&self, sid: &str, terminal_sid: &str);
}

/// A registered AGENT connection as seen from the operator side.
pub struct AgentEntry {
    pub mid: String,
    pub sid: String,
    pub properties: Map<String, Value>,
    pub connected_at_ms: u64,
    commands: mpsc::UnboundedSender<Command>,
    responses: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

/// Serialized agent listing for the front-end.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub mid: String,
    pub sid: String,
    pub properties: Map<String, Value>,
    pub connected_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_ssh_port: Option<u16>,
}

#[derive(Default)]
struct RegistryInner {
    /// mid -> live AGENT connection.
    agents: HashMap<String, Arc<AgentEntry>>,
    /// sid -> operator waiting for a TERMINAL/SHELL/FORWARD ghost.
    sessions: HashMap<String, OperatorWs>,
    /// mid -> live LOGCAT connection command channel.
    logcats: HashMap<String, mpsc::UnboundedSender<Command>>,
    /// mid -> viewers waiting for a LOGCAT ghost to register.
    logcat_waiters: HashMap<String, Vec<OperatorWs>>,
    /// sid -> live FILE connection command channel.
    files: HashMap<String, mpsc::UnboundedSender<Command>>,
    /// sid -> download context not yet claimed by an operator.
    downloads: HashMap<String, DownloadHandle>,
    /// sid -> operator waiting for the download context.
    download_waiters: HashMap<String, oneshot::Sender<DownloadHandle>>,
    /// sid -> operator waiting for the upload-ready signal.
    upload_waiters: HashMap<String, oneshot::Sender<String>>,
    /// mid -> registered target SSH forwarding port.
    ssh_ports: HashMap<String, u16>,
}

/// In-memory broker registry: one mutex over the interior maps, safe to
/// call from every connection loop concurrently.
pub struct GhostRegistry {
    inner: Mutex<RegistryInner>,
    ssh_port_start: u16,
    ssh_port_end: u16,
}

impl GhostRegistry {
    pub fn new(ssh_port_start: u16, ssh_port_end: u16) -> GhostRegistry {
        GhostRegistry {
            inner: Mutex::new(RegistryInner::default()),
            ssh_port_start,
            ssh_port_end,
        }
    }

    /// All registered agents, newest first.
    pub fn list_agents(&self) -> Vec<AgentSummary> {
        let inner = self.inner.lock();
        let mut agents: Vec<AgentSummary> = inner
            .agents
            .values()
            .map(|agent| AgentSummary {
                mid: agent.mid.clone(),
                sid: agent.sid.clone(),
                properties: agent.properties.clone(),
                connected_at_ms: agent.connected_at_ms,
                target_ssh_port: inner.ssh_ports.get(&agent.mid).copied(),
            })
            .collect();
        agents.sort_by(|a, b| b.connected_at_ms.cmp(&a.connected_at_ms));
        agents
    }

    fn agent(&self, mid: &str) -> Result<Arc<AgentEntry>, RegistryError> {
        self.inner
            .lock()
            .agents
            .get(mid)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAgent(mid.to_string()))
    }

    /// Send a command to an agent and wait for its ack on the shared
    /// response channel. An empty ack string means success.
    async fn dispatch(&self, agent: &AgentEntry, cmd: Command) -> Result<(), RegistryError> {
        agent.commands.send(cmd).map_err(|_| RegistryError::AgentGone)?;
        let mut responses = agent.responses.lock().await;
        match responses.recv().await {
            Some(ack) if ack.is_empty() => Ok(()),
            Some(err) => Err(RegistryError::CommandFailed(err)),
            None => Err(RegistryError::AgentGone),
        }
    }

    /// Park the operator under a fresh sid, ask the agent to spawn the
    /// session, and hand back the sid once the agent acks.
    async fn spawn_session(
        &self,
        mid: &str,
        ws: OperatorWs,
        make_cmd: impl FnOnce(String) -> Command,
    ) -> Result<String, RegistryError> {
        let agent = self.agent(mid)?;
        let sid = Uuid::new_v4().to_string();
        self.inner.lock().sessions.insert(sid.clone(), ws);

        let result = self.dispatch(&agent, make_cmd(sid.clone())).await;
        if result.is_err() {
            self.inner.lock().sessions.remove(&sid);
        }
        result.map(|()| sid)
    }

    /// Open an interactive terminal on `mid`. The operator WebSocket is
    /// paired once the spawned ghost registers with the returned sid.
    pub async fn request_terminal(
        &self,
        mid: &str,
        tty_device: Option<String>,
        ws: OperatorWs,
    ) -> Result<String, RegistryError> {
        self.spawn_session(mid, ws, |sid| Command::SpawnTerminal { sid, tty_device })
            .await
    }

    /// Run `command` in a shell on `mid`, streaming to the operator.
    pub async fn request_shell(
        &self,
        mid: &str,
        command: String,
        ws: OperatorWs,
    ) -> Result<String, RegistryError> {
        self.spawn_session(mid, ws, |sid| Command::SpawnShell { sid, command })
            .await
    }

    /// Tunnel a TCP port on `mid`'s host to the operator.
    pub async fn request_forward(
        &self,
        mid: &str,
        port: u16,
        ws: OperatorWs,
    ) -> Result<String, RegistryError> {
        self.spawn_session(mid, ws, |sid| Command::SpawnForwarder { sid, port })
            .await
    }

    /// Attach a viewer to `mid`'s log stream. If the logcat connection is
    /// live the viewer joins immediately (history replay first);
    /// otherwise it waits for the ghost to register.
    pub fn connect_logcat(&self, mid: &str, ws: OperatorWs) {
        let mut inner = self.inner.lock();
        if let Some(commands) = inner.logcats.get(mid) {
            match commands.send(Command::ConnectLogcat { ws }) {
                Ok(()) => return,
                // Connection died under us; fall through and wait for the
                // next registration.
                Err(mpsc::error::SendError(Command::ConnectLogcat { ws })) => {
                    inner.logcats.remove(mid);
                    inner.logcat_waiters.entry(mid.to_string()).or_default().push(ws);
                    return;
                }
                Err(_) => unreachable!("send returns the command it was given"),
            }
        }
        inner.logcat_waiters.entry(mid.to_string()).or_default().push(ws);
    }

    /// Fetch a file from `mid`: spawn a FILE ghost, wait for it to hand
    /// over the download context, then clear it to stream.
    pub async fn request_file_download(
        &self,
        mid: &str,
        filename: String,
    ) -> Result<DownloadHandle, RegistryError> {
        let agent = self.agent(mid)?;
        let sid = Uuid::new_v4().to_string();
        self.dispatch(
            &agent,
            Command::SpawnFileServer {
                sid: sid.clone(),
                terminal_sid: String::new(),
                action: FileAction::Download,
                filename,
            },
        )
        .await?;

        let handle = self.wait_download(&sid).await?;
        self.clear_to_download(&sid);
        Ok(handle)
    }

    /// Prepare an upload into the working directory of `terminal_sid` on
    /// `mid`. Resolves with the upload session sid once the FILE ghost
    /// signals `clear_to_upload`. The byte pump itself is driven by the
    /// operator side.
    pub async fn request_file_upload(
        &self,
        mid: &str,
        terminal_sid: String,
        filename: String,
    ) -> Result<String, RegistryError> {
        let agent = self.agent(mid)?;
        let sid = Uuid::new_v4().to_string();
        let ready = {
            let (tx, rx) = oneshot::channel();
            self.inner.lock().upload_waiters.insert(sid.clone(), tx);
            rx
        };

        let spawned = self
            .dispatch(
                &agent,
                Command::SpawnFileServer {
                    sid: sid.clone(),
                    terminal_sid,
                    action: FileAction::Upload,
                    filename,
                },
            )
            .await;
        if let Err(err) = spawned {
            self.inner.lock().upload_waiters.remove(&sid);
            return Err(err);
        }

        match tokio::time::timeout(UPLOAD_WAIT_TIMEOUT, ready).await {
            Ok(Ok(_terminal_sid)) => Ok(sid),
            _ => {
                self.inner.lock().upload_waiters.remove(&sid);
                Err(RegistryError::UploadTimeout)
            }
        }
    }

    /// Fire an `upgrade` request at every registered agent.
    pub fn upgrade_all(&self) -> usize {
        let inner = self.inner.lock();
        let mut notified = 0;
        for agent in inner.agents.values() {
            if agent.commands.send(Command::Upgrade).is_ok() {
                notified += 1;
            }
        }
        info!(count = notified, "sent upgrade request to agents");
        notified
    }

    async fn wait_download(&self, sid: &str) -> Result<DownloadHandle, RegistryError> {
        let pending = {
            let mut inner = self.inner.lock();
            if let Some(handle) = inner.downloads.remove(sid) {
                return Ok(handle);
            }
            let (tx, rx) = oneshot::channel();
            inner.download_waiters.insert(sid.to_string(), tx);
            rx
        };
        match tokio::time::timeout(DOWNLOAD_WAIT_TIMEOUT, pending).await {
            Ok(Ok(handle)) => Ok(handle),
            _ => {
                self.inner.lock().download_waiters.remove(sid);
                Err(RegistryError::DownloadTimeout)
            }
        }
    }

    fn clear_to_download(&self, sid: &str) {
        let inner = self.inner.lock();
        if let Some(commands) = inner.files.get(sid) {
            let _ = commands.send(Command::ClearToDownload);
        }
    }
}

impl Registry for GhostRegistry {
    fn register(&self, conn: RegisteredConn) -> Result<Pairing, RegistryError> {
        let mut inner = self.inner.lock();
        match conn.mode {
            Mode::Agent => {
                if inner.agents.contains_key(&conn.mid) {
                    return Err(RegistryError::DuplicateMid(conn.mid));
                }
                let responses = conn
                    .responses
                    .ok_or_else(|| RegistryError::CommandFailed("already registered".to_string()))?;
                info!(mid = %conn.mid, "agent registered");
                inner.agents.insert(
                    conn.mid.clone(),
                    Arc::new(AgentEntry {
                        mid: conn.mid,
                        sid: conn.sid,
                        properties: conn.properties,
                        connected_at_ms: now_ms(),
                        commands: conn.commands,
                        responses: tokio::sync::Mutex::new(responses),
                    }),
                );
                Ok(Pairing::None)
            }
            Mode::Terminal | Mode::Shell | Mode::Forward => {
                let ws = inner
                    .sessions
                    .remove(&conn.sid)
                    .ok_or_else(|| RegistryError::NoOperatorWaiting(conn.sid.clone()))?;
                debug!(sid = %conn.sid, mode = ?conn.mode, "session paired");
                Ok(Pairing::Operator(ws))
            }
            Mode::Logcat => {
                inner.logcats.insert(conn.mid.clone(), conn.commands);
                let viewers = inner.logcat_waiters.remove(&conn.mid).unwrap_or_default();
                debug!(mid = %conn.mid, viewers = viewers.len(), "logcat registered");
                Ok(Pairing::Viewers(viewers))
            }
            Mode::File => {
                inner.files.insert(conn.sid, conn.commands);
                Ok(Pairing::None)
            }
            Mode::None => Err(RegistryError::UnknownMode),
        }
    }

    fn unregister(&self, mode: Mode, sid: &str, mid: &str) {
        let mut inner = self.inner.lock();
        match mode {
            Mode::Agent => {
                if inner.agents.remove(mid).is_some() {
                    info!(mid = %mid, "agent unregistered");
                }
                inner.ssh_ports.remove(mid);
            }
            Mode::Logcat => {
                inner.logcats.remove(mid);
            }
            Mode::File => {
                inner.files.remove(sid);
                inner.downloads.remove(sid);
            }
            Mode::Terminal | Mode::Shell | Mode::Forward => {
                inner.sessions.remove(sid);
            }
            Mode::None => {}
        }
    }

    fn suggest_target_ssh_port(&self) -> Result<u16, RegistryError> {
        let inner = self.inner.lock();
        for port in self.ssh_port_start..=self.ssh_port_end {
            if !inner.ssh_ports.values().any(|&used| used == port) {
                return Ok(port);
            }
        }
        warn!("target SSH port range exhausted");
        Err(RegistryError::PortExhausted)
    }

    fn set_target_ssh_port(&self, mid: &str, port: Option<u16>) {
        let mut inner = self.inner.lock();
        match port {
            Some(port) => {
                inner.ssh_ports.insert(mid.to_string(), port);
            }
            None => {
                inner.ssh_ports.remove(mid);
            }
        }
    }

    fn register_download_request(&self, sid: &str, download: DownloadHandle) {
        let mut inner = self.inner.lock();
        if let Some(waiter) = inner.download_waiters.remove(sid) {
            if let Err(download) = waiter.send(download) {
                inner.downloads.insert(sid.to_string(), download);
            }
        } else {
            inner.downloads.insert(sid.to_string(), download);
        }
    }

    fn register_upload_request(&self, sid: &str, terminal_sid: &str) {
        let mut inner = self.inner.lock();
        if let Some(waiter) = inner.upload_waiters.remove(sid) {
            let _ = waiter.send(terminal_sid.to_string());
        } else {
            debug!(sid = %sid, "upload-ready signal with no waiter, dropped");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
