//! Per-connection ghost server.
//!
//! One [`ConnServer`] owns one TCP connection from a ghost. It starts in
//! RPC mode, negotiates a role through the `register` handshake, and for
//! the streaming modes demotes the socket to a raw byte pipe wired
//! to one or more operator WebSockets. All connection state is owned by
//! the event-loop task; the reader, writer and WS input pump communicate
//! with it only through channels, so nothing here takes a lock.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::proto::{to_vt_newline, LogFormat, Mode, Request, Response, TerminalControl};
use crate::registry::{DownloadHandle, Pairing, RegisteredConn, Registry};
use crate::rpc::{self, FramingError, ResponseHandler, RpcCore};
use crate::ws::{OperatorWs, WsMessage};

#[cfg(test)]
mod tests;

/// Upper bound on the logcat history buffer; oldest bytes evicted first.
pub const LOG_BUFSIZ: usize = 16 * 1024;

/// Timeouts and limits for one connection. Defaults match the wire
/// contract; tests shrink them.
#[derive(Debug, Clone)]
pub struct ConnPolicy {
    /// Default deadline for broker-to-ghost requests.
    pub rpc_timeout: Duration,
    /// Supervisor tick driving the timeout sweep and ping check.
    pub timeout_check_interval: Duration,
    /// Expected ghost ping cadence. A ghost silent for twice this long
    /// is considered gone.
    pub ping_timeout: Duration,
    /// Inclusive target SSH forwarding port range.
    pub ssh_port_start: u16,
    pub ssh_port_end: u16,
}

impl Default for ConnPolicy {
    fn default() -> Self {
        ConnPolicy {
            rpc_timeout: Duration::from_secs(5),
            timeout_check_interval: Duration::from_secs(3),
            ping_timeout: Duration::from_secs(10),
            ssh_port_start: 50000,
            ssh_port_end: 50999,
        }
    }
}

/// Broker-to-connection commands, delivered on the command channel and
/// marshalled into outbound RPC requests (except `ConnectLogcat`, which
/// joins a viewer directly).
#[derive(Debug)]
pub enum Command {
    SpawnTerminal {
        sid: String,
        tty_device: Option<String>,
    },
    SpawnShell {
        sid: String,
        command: String,
    },
    SpawnFileServer {
        sid: String,
        terminal_sid: String,
        action: FileAction,
        filename: String,
    },
    SpawnForwarder {
        sid: String,
        port: u16,
    },
    ConnectLogcat {
        ws: OperatorWs,
    },
    Upgrade,
    ClearToDownload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Download,
    Upload,
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("registration failed: {0}")]
    RegistrationFailed(String),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("invalid request params: {0}")]
    BadParams(#[from] serde_json::Error),
}

#[derive(Default)]
struct LogcatContext {
    format: LogFormat,
    ws_conns: Vec<OperatorWs>,
    history: Vec<u8>,
}

struct FileDownloadContext {
    name: String,
    size: i64,
    ready: bool,
    data_tx: mpsc::Sender<Option<Vec<u8>>>,
    data_rx: Option<mpsc::Receiver<Option<Vec<u8>>>>,
}

impl FileDownloadContext {
    fn new() -> FileDownloadContext {
        let (data_tx, data_rx) = mpsc::channel(1);
        FileDownloadContext {
            name: String::new(),
            size: 0,
            ready: false,
            data_tx,
            data_rx: Some(data_rx),
        }
    }
}

/// Server side of one ghost connection.
pub struct ConnServer {
    rpc: RpcCore,
    policy: ConnPolicy,
    registry: Arc<dyn Registry>,

    mode: Mode,
    sid: String,
    mid: String,
    terminal_sid: String,
    properties: Map<String, Value>,
    target_ssh_port: u16,
    registered: bool,
    last_ping: Option<Instant>,
    peer_ip: IpAddr,

    ws: Option<OperatorWs>,
    logcat: LogcatContext,
    download: FileDownloadContext,

    read_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    err_rx: mpsc::UnboundedReceiver<std::io::Error>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    response_tx: mpsc::UnboundedSender<String>,
    response_rx: Option<mpsc::UnboundedReceiver<String>>,
    stop_tx: mpsc::Sender<bool>,
    stop_rx: mpsc::Receiver<bool>,
}

impl ConnServer {
    /// Build a server over an accepted ghost socket.
    pub fn from_stream(
        stream: TcpStream,
        registry: Arc<dyn Registry>,
        policy: ConnPolicy,
    ) -> std::io::Result<ConnServer> {
        let peer_ip = stream.peer_addr()?.ip();
        let (read_half, write_half) = stream.into_split();
        Ok(ConnServer::new(read_half, write_half, peer_ip, registry, policy))
    }

    /// Build a server over any byte stream. Spawns the reader and writer
    /// tasks immediately; the event loop runs once [`serve`] is awaited.
    pub fn new<R, W>(
        reader: R,
        writer: W,
        peer_ip: IpAddr,
        registry: Arc<dyn Registry>,
        policy: ConnPolicy,
    ) -> ConnServer
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (read_rx, err_rx) = rpc::spawn_reader(reader);
        let write_tx = rpc::spawn_writer(writer, stop_tx.clone());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        ConnServer {
            rpc: RpcCore::new(write_tx.clone(), policy.rpc_timeout),
            policy,
            registry,
            mode: Mode::None,
            sid: String::new(),
            mid: String::new(),
            terminal_sid: String::new(),
            properties: Map::new(),
            target_ssh_port: 0,
            registered: false,
            last_ping: None,
            peer_ip,
            ws: None,
            logcat: LogcatContext::default(),
            download: FileDownloadContext::new(),
            read_rx,
            err_rx,
            write_tx,
            command_tx,
            command_rx,
            response_tx,
            response_rx: Some(response_rx),
            stop_tx,
            stop_rx,
        }
    }

    /// Run the connection to completion. Teardown (unregister, socket
    /// close, WS close frames) happens on every exit path.
    pub async fn serve(mut self) {
        self.run().await;
        self.terminate();
    }

    async fn run(&mut self) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.policy.timeout_check_interval,
            self.policy.timeout_check_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                chunk = self.read_rx.recv() => {
                    let Some(chunk) = chunk else {
                        // Reader task is gone; surface its terminating
                        // condition even if the error arm lost the race.
                        let err = self.err_rx.recv().await;
                        self.handle_read_error(err).await;
                        return;
                    };
                    match self.dispatch_chunk(chunk).await {
                        Ok(()) => {}
                        Err(err) => {
                            warn!(sid = %self.sid, error = %err, "closing connection");
                            return;
                        }
                    }
                }
                err = self.err_rx.recv() => {
                    self.handle_read_error(err).await;
                    return;
                }
                cmd = self.command_rx.recv() => {
                    if let Some(cmd) = cmd {
                        self.handle_command(cmd);
                    }
                }
                _ = ticker.tick() => {
                    if self.supervise() {
                        return;
                    }
                }
                stop = self.stop_rx.recv() => {
                    if stop == Some(true) {
                        return;
                    }
                }
            }
        }
    }

    /// Route one reader chunk by mode. Streaming modes bypass the RPC
    /// framer entirely; everything else is parsed for requests.
    async fn dispatch_chunk(&mut self, chunk: Vec<u8>) -> Result<(), ConnError> {
        match self.mode {
            Mode::Terminal | Mode::Forward => {
                self.forward_ws_output(&chunk);
                return Ok(());
            }
            Mode::Shell => {
                self.forward_shell_output(&chunk);
                return Ok(());
            }
            Mode::Logcat => {
                self.forward_logcat_output(&chunk);
                return Ok(());
            }
            Mode::File if self.download.ready => {
                self.forward_download_data(Some(chunk)).await;
                return Ok(());
            }
            _ => {}
        }

        // Parse only the first frame until registered: a logcat ghost
        // streams immediately after its register frame without waiting
        // for the ack, and the tail must reach the fan-out path intact.
        let requests = self.rpc.parse_requests(&chunk, !self.registered)?;
        self.process_requests(requests)?;

        // A mode change here means the batch contained the registration.
        match self.mode {
            Mode::Terminal | Mode::Forward => self.spawn_ws_input_pump(true),
            Mode::Shell => self.spawn_ws_input_pump(false),
            Mode::Logcat => {
                let leftover = self.rpc.take_leftover();
                if !leftover.is_empty() {
                    self.forward_logcat_output(&leftover);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn process_requests(&mut self, requests: Vec<Request>) -> Result<(), ConnError> {
        for req in requests {
            if let Err(err) = self.handle_request(&req) {
                if matches!(err, ConnError::RegistrationFailed(_)) {
                    return Err(err);
                }
                warn!(sid = %self.sid, name = %req.name, error = %err, "request failed");
                break;
            }
        }
        Ok(())
    }

    fn handle_request(&mut self, req: &Request) -> Result<(), ConnError> {
        match req.name.as_str() {
            "ping" => self.handle_ping(req),
            "register" => self.handle_register(req),
            "request_to_download" => self.handle_download_request(req),
            "clear_to_upload" => self.handle_clear_to_upload(req),
            "request_target_ssh_port" => self.handle_request_target_ssh_port(req),
            "register_target_ssh_port" => self.handle_register_target_ssh_port(req),
            // Unknown verbs are ignored without a response so older
            // brokers stay compatible with newer ghosts.
            _ => Ok(()),
        }
    }

    async fn handle_read_error(&mut self, err: Option<std::io::Error>) {
        match err {
            Some(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                if self.download.ready {
                    // End-of-stream sentinel; the consumer drains then stops.
                    self.forward_download_data(None).await;
                } else {
                    info!(sid = %self.sid, "connection dropped");
                }
            }
            Some(err) => warn!(sid = %self.sid, error = %err, "network error"),
            None => {}
        }
    }

    fn supervise(&mut self) -> bool {
        self.rpc.scan_for_timeouts();
        if self.mode == Mode::Agent {
            if let Some(last_ping) = self.last_ping {
                if last_ping.elapsed() > self.policy.ping_timeout * 2 {
                    warn!(mid = %self.mid, "ghost ping timeout");
                    return true;
                }
            }
        }
        false
    }

    fn terminate(&mut self) {
        if self.registered {
            self.registry.unregister(self.mode, &self.sid, &self.mid);
        }
        if let Some(ws) = self.ws.take() {
            ws.close();
        }
        for ws in self.logcat.ws_conns.drain(..) {
            ws.close();
        }
        // The socket halves close as the reader and writer tasks wind
        // down with their channels.
    }

    // ------------------------------------------------------------------
    // Mode pipes
    // ------------------------------------------------------------------

    /// Shared log writer. The CRLF rewrite applies to logcat TEXT streams
    /// only; shell output always passes through untouched.
    fn write_log_to_ws(&self, ws: &OperatorWs, buf: &[u8]) -> Result<(), crate::ws::WsClosed> {
        if self.mode == Mode::Logcat && self.logcat.format == LogFormat::Text {
            ws.send_binary(to_vt_newline(buf))
        } else {
            ws.send_binary(buf.to_vec())
        }
    }

    fn forward_ws_output(&mut self, buf: &[u8]) {
        let alive = match &self.ws {
            Some(ws) => ws.send_binary(buf.to_vec()).is_ok(),
            None => false,
        };
        if !alive {
            let _ = self.stop_tx.try_send(true);
        }
    }

    fn forward_shell_output(&mut self, buf: &[u8]) {
        let alive = match &self.ws {
            Some(ws) => self.write_log_to_ws(ws, buf).is_ok(),
            None => false,
        };
        if !alive {
            let _ = self.stop_tx.try_send(true);
        }
    }

    /// Fan one chunk out to every subscriber, pruning the ones whose
    /// writes fail. TEXT streams are rewritten once here, so the history
    /// holds exactly the bytes subscribers were sent.
    fn forward_logcat_output(&mut self, buf: &[u8]) {
        let buf = if self.logcat.format == LogFormat::Text {
            to_vt_newline(buf)
        } else {
            buf.to_vec()
        };

        self.logcat.history.extend_from_slice(&buf);
        if self.logcat.history.len() > LOG_BUFSIZ {
            let excess = self.logcat.history.len() - LOG_BUFSIZ;
            self.logcat.history.drain(..excess);
        }

        self.logcat.ws_conns.retain(|ws| {
            if ws.send_binary(buf.clone()).is_ok() {
                true
            } else {
                ws.close();
                false
            }
        });
    }

    /// Join a new logcat viewer: replay the whole history in one write,
    /// then subscribe it for live chunks.
    fn connect_logcat(&mut self, ws: OperatorWs) {
        if !self.logcat.history.is_empty()
            && ws.send_binary(self.logcat.history.clone()).is_err()
        {
            ws.close();
            return;
        }
        self.logcat.ws_conns.push(ws);
    }

    async fn forward_download_data(&mut self, chunk: Option<Vec<u8>>) {
        if self.download.data_tx.send(chunk).await.is_err() {
            debug!(sid = %self.sid, "download consumer gone");
            let _ = self.stop_tx.try_send(true);
        }
    }

    /// Pump operator WebSocket input into the ghost socket. Binary frames
    /// are forwarded only where the stream is expected to be raw bytes;
    /// shell stdin accepts text alone.
    fn spawn_ws_input_pump(&mut self, allow_binary: bool) {
        let Some(ws) = self.ws.as_mut() else { return };
        // Second take returns None, so a pump is spawned at most once.
        let Some(mut input) = ws.take_input() else { return };
        let write_tx = self.write_tx.clone();
        let stop_tx = self.stop_tx.clone();
        tokio::spawn(async move {
            loop {
                match input.recv().await {
                    Some(WsMessage::Binary(data)) => {
                        if !allow_binary {
                            warn!(len = data.len(), "ignoring binary message on shell input");
                            continue;
                        }
                        if write_tx.send(data).is_err() {
                            break;
                        }
                    }
                    Some(WsMessage::Text(text)) => {
                        if write_tx.send(text.into_bytes()).is_err() {
                            break;
                        }
                    }
                    Some(WsMessage::Close) | None => {
                        debug!("operator websocket input closed");
                        break;
                    }
                }
            }
            let _ = stop_tx.try_send(true);
        });
    }

    // ------------------------------------------------------------------
    // Ghost request handlers
    // ------------------------------------------------------------------

    fn handle_ping(&mut self, req: &Request) -> Result<(), ConnError> {
        self.last_ping = Some(Instant::now());
        self.rpc
            .send_response(&Response::new(&req.rid, "pong", Value::Null))?;
        Ok(())
    }

    fn handle_register(&mut self, req: &Request) -> Result<(), ConnError> {
        #[derive(Deserialize)]
        struct RegisterArgs {
            #[serde(default)]
            sid: String,
            #[serde(default)]
            mid: String,
            #[serde(default)]
            mode: i64,
            #[serde(default)]
            format: i64,
            #[serde(default)]
            properties: Option<Map<String, Value>>,
        }

        let args: RegisterArgs = match serde_json::from_value(req.params.clone()) {
            Ok(args) => args,
            Err(err) => return self.fail_registration(req, &format!("register: {err}")),
        };
        if args.mid.is_empty() {
            return self.fail_registration(req, "register: empty machine ID");
        }
        if args.sid.is_empty() {
            return self.fail_registration(req, "register: empty session ID");
        }
        let Some(mode) = Mode::from_wire(args.mode) else {
            return self.fail_registration(req, "register: unknown mode");
        };
        if mode == Mode::None {
            return self.fail_registration(req, "register: unknown mode");
        }

        self.sid = args.sid;
        self.mid = args.mid;
        self.mode = mode;
        // An unrecognized format value streams untouched, like VT100.
        self.logcat.format = LogFormat::from_wire(args.format).unwrap_or(LogFormat::Vt100);
        self.set_properties(args.properties);

        let pairing = self.registry.register(RegisteredConn {
            sid: self.sid.clone(),
            mid: self.mid.clone(),
            mode,
            properties: self.properties.clone(),
            commands: self.command_tx.clone(),
            responses: self.response_rx.take(),
        });
        let pairing = match pairing {
            Ok(pairing) => pairing,
            Err(err) => return self.fail_registration(req, &err.to_string()),
        };

        match pairing {
            Pairing::None => {}
            Pairing::Operator(ws) => {
                // Announce the session id so the operator can wire file
                // uploads to this terminal.
                if self.mode == Mode::Terminal {
                    match serde_json::to_string(&TerminalControl::sid(&self.sid)) {
                        Ok(msg) => {
                            let _ = ws.send_text(msg);
                        }
                        Err(err) => warn!(error = %err, "failed to format sid control frame"),
                    }
                }
                self.ws = Some(ws);
            }
            Pairing::Viewers(viewers) => {
                for ws in viewers {
                    self.connect_logcat(ws);
                }
            }
        }

        info!(mid = %self.mid, sid = %self.sid, mode = ?self.mode, "ghost registered");
        self.registered = true;
        self.last_ping = Some(Instant::now());
        self.rpc
            .send_response(&Response::success(&req.rid, Value::Null))?;
        Ok(())
    }

    fn fail_registration(&mut self, req: &Request, message: &str) -> Result<(), ConnError> {
        let _ = self
            .rpc
            .send_response(&Response::new(&req.rid, message, Value::Null));
        Err(ConnError::RegistrationFailed(message.to_string()))
    }

    fn set_properties(&mut self, properties: Option<Map<String, Value>>) {
        if let Some(properties) = properties {
            self.properties = properties;
        }
        self.properties
            .insert("ip".to_string(), Value::String(self.peer_ip.to_string()));
    }

    fn handle_download_request(&mut self, req: &Request) -> Result<(), ConnError> {
        #[derive(Deserialize)]
        struct DownloadArgs {
            #[serde(default)]
            terminal_sid: String,
            filename: String,
            #[serde(default)]
            size: i64,
        }

        let args: DownloadArgs = serde_json::from_value(req.params.clone())?;
        self.download.ready = true;
        self.terminal_sid = args.terminal_sid.clone();
        self.download.name = args.filename.clone();
        self.download.size = args.size;

        if let Some(data) = self.download.data_rx.take() {
            self.registry.register_download_request(
                &self.sid,
                DownloadHandle {
                    filename: args.filename,
                    size: args.size,
                    terminal_sid: args.terminal_sid,
                    data,
                },
            );
        }

        self.rpc
            .send_response(&Response::success(&req.rid, Value::Null))?;
        Ok(())
    }

    fn handle_clear_to_upload(&mut self, _req: &Request) -> Result<(), ConnError> {
        self.registry
            .register_upload_request(&self.sid, &self.terminal_sid);
        Ok(())
    }

    fn handle_request_target_ssh_port(&mut self, req: &Request) -> Result<(), ConnError> {
        // Asking for a new port means the old one is no longer in use.
        self.target_ssh_port = 0;
        self.registry.set_target_ssh_port(&self.mid, None);

        match self.registry.suggest_target_ssh_port() {
            Ok(port) => {
                info!(mid = %self.mid, port, "offering target SSH port");
                self.rpc
                    .send_response(&Response::success(&req.rid, json!({ "port": port })))?;
            }
            Err(err) => {
                self.rpc
                    .send_response(&Response::new(&req.rid, &err.to_string(), Value::Null))?;
            }
        }
        Ok(())
    }

    fn handle_register_target_ssh_port(&mut self, req: &Request) -> Result<(), ConnError> {
        #[derive(Deserialize)]
        struct PortArgs {
            port: i64,
        }

        let args: PortArgs = serde_json::from_value(req.params.clone())?;
        let (start, end) = (self.policy.ssh_port_start, self.policy.ssh_port_end);
        if args.port < i64::from(start) || args.port > i64::from(end) {
            let message = format!(
                "registered port {} must be between {} and {} inclusive",
                args.port, start, end
            );
            self.rpc
                .send_response(&Response::new(&req.rid, &message, Value::Null))?;
            return Ok(());
        }

        info!(mid = %self.mid, port = args.port, "registering target SSH port");
        self.target_ssh_port = args.port as u16;
        self.registry
            .set_target_ssh_port(&self.mid, Some(self.target_ssh_port));
        self.rpc
            .send_response(&Response::success(&req.rid, Value::Null))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Broker command marshalling
    // ------------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SpawnTerminal { sid, tty_device } => {
                self.send_command_request(
                    "terminal",
                    Request::new("terminal", json!({ "sid": sid, "tty_device": tty_device })),
                );
            }
            Command::SpawnShell { sid, command } => {
                self.send_command_request(
                    "shell",
                    Request::new("shell", json!({ "sid": sid, "command": command })),
                );
            }
            Command::SpawnFileServer {
                sid,
                terminal_sid,
                action,
                filename,
            } => {
                let req = match action {
                    FileAction::Download => Request::new(
                        "file_download",
                        json!({ "sid": sid, "filename": filename }),
                    ),
                    FileAction::Upload => Request::new(
                        "file_upload",
                        json!({
                            "sid": sid,
                            "terminal_sid": terminal_sid,
                            "filename": filename,
                        }),
                    ),
                };
                self.send_command_request("file", req);
            }
            Command::SpawnForwarder { sid, port } => {
                self.send_command_request(
                    "forward",
                    Request::new("forward", json!({ "sid": sid, "port": port })),
                );
            }
            Command::ConnectLogcat { ws } => self.connect_logcat(ws),
            Command::Upgrade => self.send_fire_and_forget(Request::new("upgrade", Value::Null)),
            Command::ClearToDownload => {
                self.send_fire_and_forget(Request::new("clear_to_download", Value::Null));
            }
        }
    }

    /// Marshal a broker command into an RPC request whose ack lands on
    /// the response channel: empty string for success, the error message
    /// (or "command timeout") otherwise.
    fn send_command_request(&mut self, label: &'static str, req: Request) {
        let response_tx = self.response_tx.clone();
        let handler: ResponseHandler = Box::new(move |res| {
            let ack = match res {
                None => "command timeout".to_string(),
                Some(res) if !res.is_success() => res.response,
                Some(_) => String::new(),
            };
            if !ack.is_empty() {
                warn!(command = label, error = %ack, "ghost command failed");
            }
            let _ = response_tx.send(ack);
        });
        if let Err(err) = self.rpc.send_request(req, None, Some(handler)) {
            warn!(command = label, error = %err, "failed to send ghost command");
            let _ = self.stop_tx.try_send(true);
        }
    }

    fn send_fire_and_forget(&mut self, req: Request) {
        if self.rpc.send_request(req, None, None).is_err() {
            let _ = self.stop_tx.try_send(true);
        }
    }
}
