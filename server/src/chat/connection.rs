//! Transport-facing connection handle.
//!
//! The engine never owns a socket. It holds cheap-clone [`Connection`]
//! handles whose writes go through a [`ConnectionSink`]; the production sink
//! (`ws::ChannelSink`) forwards frames to the per-connection writer task, and
//! tests substitute recording or failing sinks.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::chat::{ConnectionId, UserId};

/// Frames the engine can emit towards a client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Ping(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Inbound frames as seen by the engine, after the transport has decoded the
/// WebSocket layer. Control frames (ping/pong/close) stay in the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    FragmentBeginText(Vec<u8>),
    FragmentBeginBinary(Vec<u8>),
    FragmentContinue(Vec<u8>),
    FragmentEnd(Vec<u8>),
}

/// Write submission failure. A broken pipe means the connection is gone and
/// must leave the registry; a transient failure keeps it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WriteError {
    #[error("broken pipe")]
    BrokenPipe,
    #[error("{0}")]
    Transient(String),
}

/// Write half of a connection. `write` is non-blocking submission; the
/// returned byte count is the payload length handed to the transport.
pub trait ConnectionSink: Send + Sync {
    fn write(&self, frame: OutboundFrame) -> Result<usize, WriteError>;
}

/// Shared handle to a live connection. The transport, the registry and any
/// in-flight routing all hold clones; the writer task dies when the last
/// holder drops its sender.
#[derive(Clone)]
pub struct Connection {
    user_id: UserId,
    id: ConnectionId,
    remote_addr: String,
    sink: Arc<dyn ConnectionSink>,
}

impl Connection {
    pub fn new(
        user_id: UserId,
        id: ConnectionId,
        remote_addr: String,
        sink: Arc<dyn ConnectionSink>,
    ) -> Self {
        Self {
            user_id,
            id,
            remote_addr,
            sink,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Process-wide unique id of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn write(&self, frame: OutboundFrame) -> Result<usize, WriteError> {
        self.sink.write(frame)
    }

    /// Best-effort close; a failed close just means the peer is already gone.
    pub fn send_close(&self, code: u16, reason: impl Into<String>) {
        let reason = reason.into();
        if let Err(err) = self.sink.write(OutboundFrame::Close {
            code,
            reason: reason.clone(),
        }) {
            tracing::debug!(
                user_id = self.user_id,
                connection_id = self.id,
                error = %err,
                "close frame not delivered"
            );
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("user_id", &self.user_id)
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every frame; optionally fails each write with a fixed error.
    #[derive(Default)]
    pub struct RecordingSink {
        frames: Mutex<Vec<OutboundFrame>>,
        fail_with: Mutex<Option<WriteError>>,
    }

    impl RecordingSink {
        pub fn failing(error: WriteError) -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                fail_with: Mutex::new(Some(error)),
            }
        }

        pub fn frames(&self) -> Vec<OutboundFrame> {
            self.frames.lock().unwrap().clone()
        }

        pub fn texts(&self) -> Vec<String> {
            self.frames()
                .into_iter()
                .filter_map(|f| match f {
                    OutboundFrame::Text(t) => Some(t),
                    _ => None,
                })
                .collect()
        }

        pub fn closes(&self) -> Vec<(u16, String)> {
            self.frames()
                .into_iter()
                .filter_map(|f| match f {
                    OutboundFrame::Close { code, reason } => Some((code, reason)),
                    _ => None,
                })
                .collect()
        }

        pub fn pings(&self) -> usize {
            self.frames()
                .iter()
                .filter(|f| matches!(f, OutboundFrame::Ping(_)))
                .count()
        }
    }

    impl ConnectionSink for RecordingSink {
        fn write(&self, frame: OutboundFrame) -> Result<usize, WriteError> {
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }
            let len = match &frame {
                OutboundFrame::Text(t) => t.len(),
                OutboundFrame::Ping(p) => p.len(),
                OutboundFrame::Close { .. } => 0,
            };
            self.frames.lock().unwrap().push(frame);
            Ok(len)
        }
    }

    /// Build a connection backed by a recording sink.
    pub fn connection(user_id: UserId, id: ConnectionId) -> (Connection, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let conn = Connection::new(user_id, id, format!("127.0.0.1:{id}"), sink.clone());
        (conn, sink)
    }

    pub fn failing_connection(
        user_id: UserId,
        id: ConnectionId,
        error: WriteError,
    ) -> (Connection, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::failing(error));
        let conn = Connection::new(user_id, id, format!("127.0.0.1:{id}"), sink.clone());
        (conn, sink)
    }
}
