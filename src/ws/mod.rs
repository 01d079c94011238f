//! Operator WebSocket plumbing.
//!
//! The connection core never touches a real WebSocket. An operator peer is
//! a pair of unbounded channels: frames the broker wants the browser to
//! see, and frames the browser sent. The front-end bridges a live axum
//! socket onto the peer half; tests drive the peer half directly.

use thiserror::Error;
use tokio::sync::mpsc;

/// A WebSocket frame as the connection core sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Binary(Vec<u8>),
    Text(String),
    Close,
}

/// The far side of the operator channel pair has gone away.
#[derive(Debug, Error)]
#[error("operator websocket closed")]
pub struct WsClosed;

/// Broker-side handle to one operator WebSocket.
#[derive(Debug)]
pub struct OperatorWs {
    out_tx: mpsc::UnboundedSender<WsMessage>,
    in_rx: Option<mpsc::UnboundedReceiver<WsMessage>>,
}

/// Front-end side of the pair: what [`OperatorWs`] sends shows up on
/// `rx`; whatever the browser sends is pushed into `tx`.
#[derive(Debug)]
pub struct OperatorPeer {
    pub rx: mpsc::UnboundedReceiver<WsMessage>,
    pub tx: mpsc::UnboundedSender<WsMessage>,
}

/// Create a connected handle/peer pair.
pub fn channel() -> (OperatorWs, OperatorPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        OperatorWs {
            out_tx,
            in_rx: Some(in_rx),
        },
        OperatorPeer {
            rx: out_rx,
            tx: in_tx,
        },
    )
}

impl OperatorWs {
    /// Queue a binary frame for the operator.
    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), WsClosed> {
        self.out_tx
            .send(WsMessage::Binary(data))
            .map_err(|_| WsClosed)
    }

    /// Queue a text frame for the operator.
    pub fn send_text(&self, text: String) -> Result<(), WsClosed> {
        self.out_tx
            .send(WsMessage::Text(text))
            .map_err(|_| WsClosed)
    }

    /// Ask the front-end to send a close frame and hang up.
    pub fn close(&self) {
        let _ = self.out_tx.send(WsMessage::Close);
    }

    /// Take the inbound frame receiver. The first caller (the WS input
    /// pump) gets it; subsequent calls return `None`.
    pub fn take_input(&mut self) -> Option<mpsc::UnboundedReceiver<WsMessage>> {
        self.in_rx.take()
    }
}
