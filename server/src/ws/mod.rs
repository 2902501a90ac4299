pub mod actor;
pub mod handler;

use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{CloseFrame, Message};
use tokio::sync::mpsc;

use crate::chat::connection::{ConnectionSink, OutboundFrame, WriteError};
use crate::chat::ConnectionId;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique connection id.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Production [`ConnectionSink`]: forwards engine frames into the
/// per-connection writer task. A closed channel means the writer task is
/// gone because the socket died, which routing treats as a broken pipe.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }
}

impl ConnectionSink for ChannelSink {
    fn write(&self, frame: OutboundFrame) -> Result<usize, WriteError> {
        let (message, len) = match frame {
            OutboundFrame::Text(text) => {
                let len = text.len();
                (Message::Text(text.into()), len)
            }
            OutboundFrame::Ping(payload) => {
                let len = payload.len();
                (Message::Ping(payload.into()), len)
            }
            OutboundFrame::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                0,
            ),
        };

        self.tx.send(message).map_err(|_| WriteError::BrokenPipe)?;
        Ok(len)
    }
}
