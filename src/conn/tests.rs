use super::*;

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

use crate::registry::RegistryError;
use crate::ws::{self, OperatorPeer};

const PEER_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7));

/// Scripted registry: hands out pre-arranged pairings and records every
/// contract call for assertions.
#[derive(Default)]
struct StubRegistry {
    pairings: Mutex<VecDeque<Result<Pairing, RegistryError>>>,
    registered: Mutex<Vec<RegisteredConn>>,
    unregistered: Mutex<Vec<(Mode, String, String)>>,
    downloads: Mutex<Vec<DownloadHandle>>,
    uploads: Mutex<Vec<(String, String)>>,
    port_updates: Mutex<Vec<(String, Option<u16>)>>,
    suggested_port: u16,
}

impl StubRegistry {
    fn new() -> Arc<StubRegistry> {
        Arc::new(StubRegistry {
            suggested_port: 50000,
            ..StubRegistry::default()
        })
    }

    fn with_pairing(pairing: Result<Pairing, RegistryError>) -> Arc<StubRegistry> {
        let stub = StubRegistry::new();
        stub.pairings.lock().push_back(pairing);
        stub
    }

    fn unregister_count(&self) -> usize {
        self.unregistered.lock().len()
    }

    fn take_responses(&self) -> mpsc::UnboundedReceiver<String> {
        self.registered
            .lock()
            .first_mut()
            .expect("no registration recorded")
            .responses
            .take()
            .expect("responses already taken")
    }
}

impl Registry for StubRegistry {
    fn register(&self, conn: RegisteredConn) -> Result<Pairing, RegistryError> {
        let pairing = self
            .pairings
            .lock()
            .pop_front()
            .unwrap_or(Ok(Pairing::None));
        self.registered.lock().push(conn);
        pairing
    }

    fn unregister(&self, mode: Mode, sid: &str, mid: &str) {
        self.unregistered
            .lock()
            .push((mode, sid.to_string(), mid.to_string()));
    }

    fn suggest_target_ssh_port(&self) -> Result<u16, RegistryError> {
        Ok(self.suggested_port)
    }

    fn set_target_ssh_port(&self, mid: &str, port: Option<u16>) {
        self.port_updates.lock().push((mid.to_string(), port));
    }

    fn register_download_request(&self, _sid: &str, download: DownloadHandle) {
        self.downloads.lock().push(download);
    }

    fn register_upload_request(&self, sid: &str, terminal_sid: &str) {
        self.uploads
            .lock()
            .push((sid.to_string(), terminal_sid.to_string()));
    }
}

fn test_policy() -> ConnPolicy {
    ConnPolicy {
        rpc_timeout: Duration::from_millis(50),
        timeout_check_interval: Duration::from_millis(50),
        ping_timeout: Duration::from_millis(200),
        ..ConnPolicy::default()
    }
}

fn make_conn(registry: Arc<StubRegistry>) -> (ConnServer, DuplexStream) {
    make_conn_with(registry, test_policy())
}

fn make_conn_with(registry: Arc<StubRegistry>, policy: ConnPolicy) -> (ConnServer, DuplexStream) {
    let (client, server) = tokio::io::duplex(4096);
    let (read_half, write_half) = tokio::io::split(server);
    let conn = ConnServer::new(read_half, write_half, PEER_IP, registry, policy);
    (conn, client)
}

fn register_frame(rid: &str, sid: &str, mid: &str, mode: Mode, format: LogFormat) -> Vec<u8> {
    let format_wire = match format {
        LogFormat::Text => 0,
        LogFormat::Vt100 => 1,
    };
    let params = json!({
        "sid": sid,
        "mid": mid,
        "mode": mode.as_wire(),
        "format": format_wire,
        "properties": {},
    });
    frame(&json!({"rid": rid, "name": "register", "params": params}))
}

fn frame(value: &Value) -> Vec<u8> {
    let mut buf = serde_json::to_vec(value).unwrap();
    buf.push(b'\n');
    buf
}

/// Read one newline-terminated JSON frame off the ghost side.
async fn read_frame(client: &mut DuplexStream) -> Value {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = timeout(Duration::from_secs(2), client.read(&mut byte))
            .await
            .expect("timed out waiting for frame")
            .expect("read failed");
        assert!(n > 0, "eof while waiting for frame");
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    serde_json::from_slice(&line).expect("frame is not valid json")
}

async fn read_bytes(client: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .expect("timed out waiting for bytes")
        .expect("read failed");
    buf
}

async fn recv_ws(peer: &mut OperatorPeer) -> WsMessage {
    timeout(Duration::from_secs(2), peer.rx.recv())
        .await
        .expect("timed out waiting for ws message")
        .expect("ws channel closed")
}

fn assert_ws_idle(peer: &mut OperatorPeer) {
    assert!(
        peer.rx.try_recv().is_err(),
        "unexpected ws message queued"
    );
}

// ---------------------------------------------------------------------------
// Registration and ping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_register_as_agent_then_ping() {
    let stub = StubRegistry::new();
    let (mut conn, mut client) = make_conn(stub.clone());

    conn.dispatch_chunk(register_frame("r1", "s1", "m1", Mode::Agent, LogFormat::Text))
        .await
        .unwrap();
    let res = read_frame(&mut client).await;
    assert_eq!(res["rid"], "r1");
    assert_eq!(res["response"], "success");

    assert!(conn.registered);
    assert_eq!(conn.mode, Mode::Agent);
    assert_eq!(conn.properties["ip"], "192.168.1.7");
    assert!(conn.last_ping.is_some());

    let recorded = stub.registered.lock();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].mid, "m1");
    assert_eq!(recorded[0].properties["ip"], "192.168.1.7");
    drop(recorded);

    conn.dispatch_chunk(frame(&json!({"rid": "r2", "name": "ping", "params": null})))
        .await
        .unwrap();
    let res = read_frame(&mut client).await;
    assert_eq!(res["rid"], "r2");
    assert_eq!(res["response"], "pong");
}

#[tokio::test]
async fn test_register_with_empty_mid_is_fatal() {
    let stub = StubRegistry::new();
    let (mut conn, mut client) = make_conn(stub.clone());

    let err = conn
        .dispatch_chunk(register_frame("r1", "s1", "", Mode::Agent, LogFormat::Text))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnError::RegistrationFailed(_)));

    let res = read_frame(&mut client).await;
    assert_eq!(res["rid"], "r1");
    assert_ne!(res["response"], "success");
    // The registry was never consulted.
    assert!(stub.registered.lock().is_empty());
}

#[tokio::test]
async fn test_register_refused_by_registry_is_fatal() {
    let stub = StubRegistry::with_pairing(Err(RegistryError::DuplicateMid("m1".to_string())));
    let (mut conn, mut client) = make_conn(stub);

    let err = conn
        .dispatch_chunk(register_frame("r1", "s1", "m1", Mode::Agent, LogFormat::Text))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnError::RegistrationFailed(_)));

    let res = read_frame(&mut client).await;
    assert_eq!(res["response"], "duplicate machine ID: m1");
}

#[tokio::test]
async fn test_unknown_request_is_silently_ignored() {
    let stub = StubRegistry::new();
    let (mut conn, mut client) = make_conn(stub);

    conn.dispatch_chunk(frame(
        &json!({"rid": "r9", "name": "flux_capacitor", "params": null}),
    ))
    .await
    .unwrap();

    let mut byte = [0u8; 1];
    let idle = timeout(Duration::from_millis(100), client.read(&mut byte)).await;
    assert!(idle.is_err(), "no response expected for unknown verbs");
}

#[tokio::test]
async fn test_malformed_frame_closes_connection() {
    let stub = StubRegistry::new();
    let (mut conn, _client) = make_conn(stub);

    let err = conn.dispatch_chunk(b"{]garbage\n".to_vec()).await.unwrap_err();
    assert!(matches!(err, ConnError::Framing(_)));
}

// ---------------------------------------------------------------------------
// Logcat fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_logcat_residual_tail_reaches_early_and_late_viewers() {
    let (ws1, mut peer1) = ws::channel();
    let stub = StubRegistry::with_pairing(Ok(Pairing::Viewers(vec![ws1])));
    let (mut conn, mut client) = make_conn(stub);

    // The register frame and the first stream bytes arrive in one chunk;
    // logcat ghosts do not wait for the ack.
    let mut chunk = register_frame("r1", "s1", "m1", Mode::Logcat, LogFormat::Vt100);
    chunk.extend_from_slice(b"hello");
    conn.dispatch_chunk(chunk).await.unwrap();

    let res = read_frame(&mut client).await;
    assert_eq!(res["response"], "success");

    // Viewer present at registration sees the tail live.
    assert_eq!(recv_ws(&mut peer1).await, WsMessage::Binary(b"hello".to_vec()));

    // A viewer joining later replays the history exactly once.
    let (ws2, mut peer2) = ws::channel();
    conn.handle_command(Command::ConnectLogcat { ws: ws2 });
    assert_eq!(recv_ws(&mut peer2).await, WsMessage::Binary(b"hello".to_vec()));
    assert_ws_idle(&mut peer2);

    // Live chunks reach both, in order, with no duplicates.
    conn.dispatch_chunk(b" again".to_vec()).await.unwrap();
    assert_eq!(recv_ws(&mut peer1).await, WsMessage::Binary(b" again".to_vec()));
    assert_eq!(recv_ws(&mut peer2).await, WsMessage::Binary(b" again".to_vec()));
    assert_ws_idle(&mut peer1);
    assert_ws_idle(&mut peer2);
}

#[tokio::test]
async fn test_logcat_text_mode_rewrites_newlines() {
    let (ws, mut peer) = ws::channel();
    let stub = StubRegistry::with_pairing(Ok(Pairing::Viewers(vec![ws])));
    let (mut conn, mut client) = make_conn(stub);

    conn.dispatch_chunk(register_frame("r1", "s1", "m1", Mode::Logcat, LogFormat::Text))
        .await
        .unwrap();
    read_frame(&mut client).await;

    conn.dispatch_chunk(b"a\nb".to_vec()).await.unwrap();
    assert_eq!(recv_ws(&mut peer).await, WsMessage::Binary(b"a\r\nb".to_vec()));
    // History holds the rewritten bytes, so replay never rewrites twice.
    assert_eq!(conn.logcat.history, b"a\r\nb");
}

#[tokio::test]
async fn test_logcat_history_keeps_last_16k() {
    let stub = StubRegistry::with_pairing(Ok(Pairing::Viewers(Vec::new())));
    let (mut conn, mut client) = make_conn(stub);

    conn.dispatch_chunk(register_frame("r1", "s1", "m1", Mode::Logcat, LogFormat::Vt100))
        .await
        .unwrap();
    read_frame(&mut client).await;

    let mut expected = Vec::new();
    for i in 0u8..3 {
        let chunk = vec![i; 8 * 1024];
        expected.extend_from_slice(&chunk);
        conn.dispatch_chunk(chunk).await.unwrap();
    }

    assert_eq!(conn.logcat.history.len(), LOG_BUFSIZ);
    assert_eq!(conn.logcat.history, expected[expected.len() - LOG_BUFSIZ..]);
}

#[tokio::test]
async fn test_logcat_dead_viewer_is_pruned_others_keep_streaming() {
    let (ws1, mut peer1) = ws::channel();
    let (ws2, peer2) = ws::channel();
    let stub = StubRegistry::with_pairing(Ok(Pairing::Viewers(vec![ws1, ws2])));
    let (mut conn, mut client) = make_conn(stub);

    conn.dispatch_chunk(register_frame("r1", "s1", "m1", Mode::Logcat, LogFormat::Vt100))
        .await
        .unwrap();
    read_frame(&mut client).await;
    assert_eq!(conn.logcat.ws_conns.len(), 2);

    drop(peer2);
    conn.dispatch_chunk(b"first".to_vec()).await.unwrap();
    assert_eq!(recv_ws(&mut peer1).await, WsMessage::Binary(b"first".to_vec()));
    assert_eq!(conn.logcat.ws_conns.len(), 1);

    conn.dispatch_chunk(b"second".to_vec()).await.unwrap();
    assert_eq!(recv_ws(&mut peer1).await, WsMessage::Binary(b"second".to_vec()));
}

// ---------------------------------------------------------------------------
// Target SSH port negotiation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ssh_port_suggest_then_register() {
    let stub = StubRegistry::new();
    let (mut conn, mut client) = make_conn(stub.clone());

    conn.dispatch_chunk(register_frame("r1", "s1", "m1", Mode::Agent, LogFormat::Text))
        .await
        .unwrap();
    read_frame(&mut client).await;

    conn.dispatch_chunk(frame(
        &json!({"rid": "r2", "name": "request_target_ssh_port", "params": null}),
    ))
    .await
    .unwrap();
    let res = read_frame(&mut client).await;
    assert_eq!(res["response"], "success");
    assert_eq!(res["params"]["port"], 50000);
    assert_eq!(conn.target_ssh_port, 0);
    // The old claim was released before the suggestion.
    assert_eq!(*stub.port_updates.lock(), vec![("m1".to_string(), None)]);

    conn.dispatch_chunk(frame(
        &json!({"rid": "r3", "name": "register_target_ssh_port", "params": {"port": 50000}}),
    ))
    .await
    .unwrap();
    let res = read_frame(&mut client).await;
    assert_eq!(res["response"], "success");
    assert_eq!(conn.target_ssh_port, 50000);
    assert_eq!(
        stub.port_updates.lock().last().unwrap(),
        &("m1".to_string(), Some(50000))
    );
}

#[tokio::test]
async fn test_ssh_port_out_of_range_is_rejected() {
    let stub = StubRegistry::new();
    let (mut conn, mut client) = make_conn(stub);

    conn.dispatch_chunk(register_frame("r1", "s1", "m1", Mode::Agent, LogFormat::Text))
        .await
        .unwrap();
    read_frame(&mut client).await;

    conn.target_ssh_port = 50123;
    conn.dispatch_chunk(frame(
        &json!({"rid": "r2", "name": "register_target_ssh_port", "params": {"port": 49999}}),
    ))
    .await
    .unwrap();
    let res = read_frame(&mut client).await;
    assert_ne!(res["response"], "success");
    assert_eq!(conn.target_ssh_port, 50123);
}

// ---------------------------------------------------------------------------
// Broker command marshalling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_commands_marshal_and_ack_on_response_channel() {
    let stub = StubRegistry::new();
    let (mut conn, mut client) = make_conn(stub.clone());

    conn.dispatch_chunk(register_frame("r1", "s1", "m1", Mode::Agent, LogFormat::Text))
        .await
        .unwrap();
    read_frame(&mut client).await;
    let mut responses = stub.take_responses();

    // Success ack arrives as an empty string.
    conn.handle_command(Command::SpawnShell {
        sid: "sh-1".to_string(),
        command: "uname -a".to_string(),
    });
    let req = read_frame(&mut client).await;
    assert_eq!(req["name"], "shell");
    assert_eq!(req["params"]["sid"], "sh-1");
    assert_eq!(req["params"]["command"], "uname -a");

    let rid = req["rid"].as_str().unwrap();
    conn.dispatch_chunk(frame(
        &json!({"rid": rid, "response": "success", "params": null}),
    ))
    .await
    .unwrap();
    assert_eq!(responses.recv().await.unwrap(), "");

    // Failure acks carry the ghost's error string.
    conn.handle_command(Command::SpawnTerminal {
        sid: "t-1".to_string(),
        tty_device: None,
    });
    let req = read_frame(&mut client).await;
    assert_eq!(req["name"], "terminal");
    assert!(req["params"]["tty_device"].is_null());

    let rid = req["rid"].as_str().unwrap();
    conn.dispatch_chunk(frame(
        &json!({"rid": rid, "response": "no pty available", "params": null}),
    ))
    .await
    .unwrap();
    assert_eq!(responses.recv().await.unwrap(), "no pty available");
}

#[tokio::test]
async fn test_unanswered_command_times_out() {
    let stub = StubRegistry::new();
    // Ping supervision must not interfere with this test's sleeps.
    let policy = ConnPolicy {
        rpc_timeout: Duration::from_millis(50),
        ping_timeout: Duration::from_secs(60),
        ..ConnPolicy::default()
    };
    let (mut conn, mut client) = make_conn_with(stub.clone(), policy);

    conn.dispatch_chunk(register_frame("r1", "s1", "m1", Mode::Agent, LogFormat::Text))
        .await
        .unwrap();
    read_frame(&mut client).await;
    let mut responses = stub.take_responses();

    conn.handle_command(Command::SpawnForwarder {
        sid: "f-1".to_string(),
        port: 8022,
    });
    read_frame(&mut client).await;

    // Let the deadline pass, then run the supervisor sweep.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!conn.supervise());
    assert_eq!(responses.recv().await.unwrap(), "command timeout");
}

#[tokio::test]
async fn test_upgrade_is_fire_and_forget() {
    let stub = StubRegistry::new();
    let (mut conn, mut client) = make_conn(stub);

    conn.dispatch_chunk(register_frame("r1", "s1", "m1", Mode::Agent, LogFormat::Text))
        .await
        .unwrap();
    read_frame(&mut client).await;

    conn.handle_command(Command::Upgrade);
    let req = read_frame(&mut client).await;
    assert_eq!(req["name"], "upgrade");
    assert!(req["params"].is_null());
}

// ---------------------------------------------------------------------------
// Terminal, forward, and shell pipes (full event loop)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_terminal_duplex_pipe_and_teardown() {
    let (ws, mut peer) = ws::channel();
    let stub = StubRegistry::with_pairing(Ok(Pairing::Operator(ws)));
    let (conn, mut client) = make_conn(stub.clone());
    let server = tokio::spawn(conn.serve());

    client
        .write_all(&register_frame("r1", "s1", "m1", Mode::Terminal, LogFormat::Text))
        .await
        .unwrap();

    // The operator learns the session id first, as a text control frame.
    match recv_ws(&mut peer).await {
        WsMessage::Text(text) => {
            let ctl: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(ctl["type"], "sid");
            assert_eq!(ctl["data"], "s1");
        }
        other => panic!("expected sid control frame, got {other:?}"),
    }
    let res = read_frame(&mut client).await;
    assert_eq!(res["response"], "success");

    // Ghost output goes to the operator verbatim.
    client.write_all(b"pty says hi").await.unwrap();
    assert_eq!(recv_ws(&mut peer).await, WsMessage::Binary(b"pty says hi".to_vec()));

    // Operator input, text and binary both, reaches the ghost.
    peer.tx.send(WsMessage::Text("ls\n".to_string())).unwrap();
    assert_eq!(read_bytes(&mut client, 3).await, b"ls\n");
    peer.tx.send(WsMessage::Binary(vec![0x1b, 0x5b, 0x41])).unwrap();
    assert_eq!(read_bytes(&mut client, 3).await, [0x1b, 0x5b, 0x41]);

    // Operator hangup tears the connection down.
    peer.tx.send(WsMessage::Close).unwrap();
    server.await.unwrap();
    assert_eq!(stub.unregister_count(), 1);

    // The paired socket got a close frame and the ghost socket is closed.
    loop {
        match timeout(Duration::from_secs(2), peer.rx.recv()).await.unwrap() {
            Some(WsMessage::Close) | None => break,
            Some(_) => {}
        }
    }
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "ghost socket should be closed");
}

#[tokio::test]
async fn test_forward_duplex_pipe_is_verbatim() {
    let (ws, mut peer) = ws::channel();
    let stub = StubRegistry::with_pairing(Ok(Pairing::Operator(ws)));
    let (conn, mut client) = make_conn(stub.clone());
    let server = tokio::spawn(conn.serve());

    client
        .write_all(&register_frame("r1", "s1", "m1", Mode::Forward, LogFormat::Text))
        .await
        .unwrap();
    let res = read_frame(&mut client).await;
    assert_eq!(res["response"], "success");

    // A raw tunnel carries bytes untouched in both directions; newlines
    // are never rewritten even with a TEXT format on the registration.
    client.write_all(b"GET / HTTP/1.0\n\n").await.unwrap();
    assert_eq!(
        recv_ws(&mut peer).await,
        WsMessage::Binary(b"GET / HTTP/1.0\n\n".to_vec())
    );

    // Unlike shell input, binary operator frames are forwarded.
    peer.tx.send(WsMessage::Binary(vec![0x00, 0xff, 0x10])).unwrap();
    assert_eq!(read_bytes(&mut client, 3).await, [0x00, 0xff, 0x10]);
    peer.tx.send(WsMessage::Text("plain\n".to_string())).unwrap();
    assert_eq!(read_bytes(&mut client, 6).await, b"plain\n");

    // Operator hangup tears the tunnel down.
    peer.tx.send(WsMessage::Close).unwrap();
    server.await.unwrap();
    assert_eq!(stub.unregister_count(), 1);
}

#[tokio::test]
async fn test_shell_drops_binary_operator_input() {
    let (ws, mut peer) = ws::channel();
    let stub = StubRegistry::with_pairing(Ok(Pairing::Operator(ws)));
    let (conn, mut client) = make_conn(stub);
    let _server = tokio::spawn(conn.serve());

    client
        .write_all(&register_frame("r1", "s1", "m1", Mode::Shell, LogFormat::Text))
        .await
        .unwrap();
    let res = read_frame(&mut client).await;
    assert_eq!(res["response"], "success");

    // Shell output is never newline-rewritten, whatever the format says.
    client.write_all(b"line1\nline2").await.unwrap();
    assert_eq!(recv_ws(&mut peer).await, WsMessage::Binary(b"line1\nline2".to_vec()));

    // Binary input is dropped; the following text frame is what arrives.
    peer.tx.send(WsMessage::Binary(vec![0xde, 0xad])).unwrap();
    peer.tx.send(WsMessage::Text("y\n".to_string())).unwrap();
    assert_eq!(read_bytes(&mut client, 2).await, b"y\n");
}

// ---------------------------------------------------------------------------
// File download (full event loop)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_download_streams_and_ends_with_sentinel() {
    let stub = StubRegistry::new();
    let (conn, mut client) = make_conn(stub.clone());
    let server = tokio::spawn(conn.serve());

    client
        .write_all(&register_frame("r1", "s-dl", "m1", Mode::File, LogFormat::Text))
        .await
        .unwrap();
    read_frame(&mut client).await;

    client
        .write_all(&frame(&json!({
            "rid": "r2",
            "name": "request_to_download",
            "params": {"terminal_sid": "t-1", "filename": "core.tgz", "size": 11},
        })))
        .await
        .unwrap();
    let res = read_frame(&mut client).await;
    assert_eq!(res["response"], "success");

    let mut handle = {
        let mut downloads = stub.downloads.lock();
        assert_eq!(downloads.len(), 1);
        downloads.pop().unwrap()
    };
    assert_eq!(handle.filename, "core.tgz");
    assert_eq!(handle.size, 11);
    assert_eq!(handle.terminal_sid, "t-1");

    // Every byte after ready=true flows to the download channel.
    client.write_all(b"hello").await.unwrap();
    assert_eq!(handle.data.recv().await.unwrap(), Some(b"hello".to_vec()));
    client.write_all(b" world").await.unwrap();
    assert_eq!(handle.data.recv().await.unwrap(), Some(b" world".to_vec()));

    // EOF pushes the end-of-stream sentinel and terminates.
    drop(client);
    assert_eq!(handle.data.recv().await.unwrap(), None);
    server.await.unwrap();
    assert_eq!(stub.unregister_count(), 1);
}

// ---------------------------------------------------------------------------
// Upload handoff
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_clear_to_upload_hands_off_without_reply() {
    let stub = StubRegistry::new();
    let (mut conn, mut client) = make_conn(stub.clone());

    conn.dispatch_chunk(register_frame("r1", "s-up", "m1", Mode::File, LogFormat::Text))
        .await
        .unwrap();
    read_frame(&mut client).await;

    conn.dispatch_chunk(frame(
        &json!({"rid": "r2", "name": "clear_to_upload", "params": null}),
    ))
    .await
    .unwrap();
    assert_eq!(*stub.uploads.lock(), vec![("s-up".to_string(), String::new())]);

    // No response frame for clear_to_upload.
    let mut byte = [0u8; 1];
    let idle = timeout(Duration::from_millis(100), client.read(&mut byte)).await;
    assert!(idle.is_err());
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_agent_ping_timeout_terminates() {
    let stub = StubRegistry::new();
    let (conn, mut client) = make_conn(stub.clone());
    let server = tokio::spawn(conn.serve());

    client
        .write_all(&register_frame("r1", "s1", "m1", Mode::Agent, LogFormat::Text))
        .await
        .unwrap();
    let res = read_frame(&mut client).await;
    assert_eq!(res["response"], "success");

    // Stay silent past 2x the ping timeout.
    timeout(Duration::from_secs(2), server)
        .await
        .expect("connection did not time out")
        .unwrap();
    assert_eq!(stub.unregister_count(), 1);

    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_pings_keep_agent_alive() {
    let stub = StubRegistry::new();
    let (conn, mut client) = make_conn(stub.clone());
    let server = tokio::spawn(conn.serve());

    client
        .write_all(&register_frame("r1", "s1", "m1", Mode::Agent, LogFormat::Text))
        .await
        .unwrap();
    read_frame(&mut client).await;

    // Ping well inside the timeout for a few rounds; the supervisor must
    // not fire.
    for i in 0..4 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client
            .write_all(&frame(&json!({"rid": format!("p{i}"), "name": "ping", "params": null})))
            .await
            .unwrap();
        let res = read_frame(&mut client).await;
        assert_eq!(res["response"], "pong");
    }
    assert_eq!(stub.unregister_count(), 0);

    drop(client);
    server.await.unwrap();
    assert_eq!(stub.unregister_count(), 1);
}
