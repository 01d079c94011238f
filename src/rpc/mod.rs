//! RPC framing core shared by every ghost connection.
//!
//! Outbound frames are serialized and queued on a writer task; inbound
//! bytes are chopped at newline boundaries and discriminated into
//! requests (returned to the caller) and responses (dispatched against
//! the pending-request table). Timeouts are swept periodically by the
//! supervisor tick rather than armed per request, which keeps the task
//! count per connection constant.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::proto::{Frame, Request, Response, FRAME_TERMINATOR};

/// Socket read size for the reader task.
const READ_CHUNK_SIZE: usize = 8192;

/// Invoked with the matched response, or `None` when the request timed
/// out before a reply arrived.
pub type ResponseHandler = Box<dyn FnOnce(Option<Response>) + Send>;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("connection writer closed")]
    WriterClosed,
}

struct PendingRequest {
    name: String,
    deadline: Instant,
    handler: ResponseHandler,
}

/// Per-connection framing state: the write queue, the partial-frame
/// buffer, and the table of requests awaiting replies.
pub struct RpcCore {
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    read_buffer: Vec<u8>,
    pending: HashMap<String, PendingRequest>,
    default_timeout: Duration,
}

impl RpcCore {
    pub fn new(write_tx: mpsc::UnboundedSender<Vec<u8>>, default_timeout: Duration) -> RpcCore {
        RpcCore {
            write_tx,
            read_buffer: Vec::new(),
            pending: HashMap::new(),
            default_timeout,
        }
    }

    /// Serialize and queue a request frame. When `on_reply` is given the
    /// request is recorded in the pending table and the handler fires
    /// exactly once, with the response or with `None` on timeout. Without
    /// a handler the request is fire-and-forget and no reply is expected.
    pub fn send_request(
        &mut self,
        req: Request,
        timeout: Option<Duration>,
        on_reply: Option<ResponseHandler>,
    ) -> Result<(), FramingError> {
        self.write_frame(&serde_json::to_vec(&req)?)?;
        if let Some(handler) = on_reply {
            let deadline = Instant::now() + timeout.unwrap_or(self.default_timeout);
            self.pending.insert(
                req.rid.clone(),
                PendingRequest {
                    name: req.name,
                    deadline,
                    handler,
                },
            );
        }
        Ok(())
    }

    /// Serialize and queue a response frame. Fire-and-forget.
    pub fn send_response(&mut self, res: &Response) -> Result<(), FramingError> {
        self.write_frame(&serde_json::to_vec(res)?)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), FramingError> {
        let mut line = Vec::with_capacity(frame.len() + 1);
        line.extend_from_slice(frame);
        line.push(FRAME_TERMINATOR);
        self.write_tx
            .send(line)
            .map_err(|_| FramingError::WriterClosed)
    }

    /// Consume a chunk of socket bytes and return the complete request
    /// frames it yields. Responses found along the way are dispatched to
    /// their pending handlers; replies with an unknown rid are dropped.
    ///
    /// With `single_frame_only` set, parsing stops after the first
    /// request and the remaining bytes stay buffered. Registration uses
    /// this so that stream bytes trailing the `register` frame (logcat
    /// ghosts do not wait for the ack) survive for the mode pipe.
    pub fn parse_requests(
        &mut self,
        chunk: &[u8],
        single_frame_only: bool,
    ) -> Result<Vec<Request>, FramingError> {
        self.read_buffer.extend_from_slice(chunk);

        let mut requests = Vec::new();
        while let Some(pos) = self.read_buffer.iter().position(|&b| b == FRAME_TERMINATOR) {
            let line: Vec<u8> = self.read_buffer.drain(..=pos).take(pos).collect();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Frame>(&line)? {
                Frame::Request(req) => {
                    requests.push(req);
                    if single_frame_only {
                        break;
                    }
                }
                Frame::Response(res) => self.dispatch_response(res),
            }
        }
        Ok(requests)
    }

    fn dispatch_response(&mut self, res: Response) {
        match self.pending.remove(&res.rid) {
            Some(entry) => (entry.handler)(Some(res)),
            None => trace!(rid = %res.rid, "reply for unknown rid, dropped"),
        }
    }

    /// Expire pending requests whose deadline has passed, invoking each
    /// handler with `None`.
    pub fn scan_for_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(rid, _)| rid.clone())
            .collect();
        for rid in expired {
            if let Some(entry) = self.pending.remove(&rid) {
                warn!(rid = %rid, name = %entry.name, "request timed out");
                (entry.handler)(None);
            }
        }
    }

    /// Take whatever partial-frame bytes are still buffered. Used to
    /// drain the residual tail after a logcat registration.
    pub fn take_leftover(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.read_buffer)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Spawn the reader task: forwards every socket read as a raw chunk on
/// the returned data channel and reports the terminating I/O condition
/// (EOF included) on the error channel.
pub fn spawn_reader<R>(
    mut reader: R,
) -> (mpsc::UnboundedReceiver<Vec<u8>>, mpsc::UnboundedReceiver<io::Error>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (read_tx, read_rx) = mpsc::unbounded_channel();
    let (err_tx, err_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = err_tx.send(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
                    return;
                }
                Ok(n) => {
                    if read_tx.send(buf[..n].to_vec()).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = err_tx.send(err);
                    return;
                }
            }
        }
    });
    (read_rx, err_rx)
}

/// Spawn the writer task: drains queued frames onto the socket. A write
/// failure signals the stop channel so the event loop tears down.
pub fn spawn_writer<W>(mut writer: W, stop_tx: mpsc::Sender<bool>) -> mpsc::UnboundedSender<Vec<u8>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(data) = write_rx.recv().await {
            if let Err(err) = writer.write_all(&data).await {
                debug!(error = %err, "socket write failed");
                let _ = stop_tx.try_send(true);
                return;
            }
        }
        let _ = writer.shutdown().await;
    });
    write_tx
}
