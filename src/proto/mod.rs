//! Ghost wire protocol types.
//!
//! Ghosts speak newline-terminated JSON frames over a plaintext TCP
//! socket. A frame is either a request (`rid` + `name` + `params`) or a
//! response (`rid` + `response` + `params`); the `rid` correlates the two.
//! The integer mode and format discriminants are part of the wire contract
//! and must stay stable across ghost versions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Response status string meaning the request succeeded. Any other status
/// is a human-readable error message.
pub const SUCCESS: &str = "success";

/// Frames are separated by a single newline byte.
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Operating mode of a ghost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    None,
    Agent,
    Terminal,
    Shell,
    Logcat,
    File,
    Forward,
}

impl Mode {
    /// Decode the wire discriminant sent in `register` params.
    pub fn from_wire(value: i64) -> Option<Mode> {
        match value {
            0 => Some(Mode::None),
            1 => Some(Mode::Agent),
            2 => Some(Mode::Terminal),
            3 => Some(Mode::Shell),
            4 => Some(Mode::Logcat),
            5 => Some(Mode::File),
            6 => Some(Mode::Forward),
            _ => None,
        }
    }

    pub fn as_wire(self) -> i64 {
        match self {
            Mode::None => 0,
            Mode::Agent => 1,
            Mode::Terminal => 2,
            Mode::Shell => 3,
            Mode::Logcat => 4,
            Mode::File => 5,
            Mode::Forward => 6,
        }
    }
}

/// Log stream format declared at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain text; bare LF is rewritten to CRLF for browser terminals.
    #[default]
    Text,
    /// VT100 escape stream; passed through untouched.
    Vt100,
}

impl LogFormat {
    pub fn from_wire(value: i64) -> Option<LogFormat> {
        match value {
            0 => Some(LogFormat::Text),
            1 => Some(LogFormat::Vt100),
            _ => None,
        }
    }
}

/// An RPC request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub rid: String,
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Build a request with a fresh rid.
    pub fn new(name: &str, params: Value) -> Request {
        Request {
            rid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            params,
        }
    }
}

/// An RPC response frame. `response` is [`SUCCESS`] or an error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub rid: String,
    pub response: String,
    #[serde(default)]
    pub params: Value,
}

impl Response {
    pub fn new(rid: &str, status: &str, params: Value) -> Response {
        Response {
            rid: rid.to_string(),
            response: status.to_string(),
            params,
        }
    }

    pub fn success(rid: &str, params: Value) -> Response {
        Response::new(rid, SUCCESS, params)
    }

    pub fn is_success(&self) -> bool {
        self.response == SUCCESS
    }
}

/// Either side of the RPC conversation, as read off the wire.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

/// Control frame announcing the terminal session id to the operator.
/// Sent as the only text WebSocket message the broker originates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalControl {
    #[serde(rename = "type")]
    pub control_type: String,
    pub data: String,
}

impl TerminalControl {
    pub fn sid(sid: &str) -> TerminalControl {
        TerminalControl {
            control_type: "sid".to_string(),
            data: sid.to_string(),
        }
    }
}

/// Rewrite bare LF to CRLF, the VT100 newline convention browser terminal
/// emulators expect.
pub fn to_vt_newline(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len() + buf.len() / 8);
    for &b in buf {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }
    out
}
