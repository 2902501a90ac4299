use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::chat::connection::{Connection, InboundFrame};
use crate::state::AppState;
use crate::ws::{next_connection_id, ChannelSink};

/// Run the actor for an authenticated connection.
///
/// The socket is split into halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel.
///   Anything holding a [`Connection`] handle (registry, routing, watchdog)
///   writes through that channel.
/// - Reader loop: decodes incoming messages into engine frames.
///
/// The transport (tungstenite underneath axum) reassembles fragmented
/// messages before they surface here, so the reader only ever produces
/// single-frame inputs; the engine's fragment opcodes are fed by transports
/// that expose continuation frames directly.
pub async fn run_connection(
    socket: WebSocket,
    state: AppState,
    user_id: u64,
    addr: SocketAddr,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let conn = Connection::new(
        user_id,
        next_connection_id(),
        addr.to_string(),
        Arc::new(ChannelSink::new(tx.clone())),
    );

    let engine = state.engine.clone();
    engine.register(conn.clone());
    tracing::info!(
        user_id,
        connection_id = conn.id(),
        remote = %addr,
        "websocket connection started"
    );

    // Writer task: forwards mpsc messages to the WebSocket sink.
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    loop {
        match ws_receiver.next().await {
            Some(Ok(message)) => match message {
                Message::Text(text) => {
                    engine.on_frame(&conn, InboundFrame::Text(text.to_string()));
                }
                Message::Binary(data) => {
                    engine.on_frame(&conn, InboundFrame::Binary(data.to_vec()));
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Pong(_) => {
                    engine.on_pong(&conn);
                }
                Message::Close(frame) => {
                    tracing::debug!(
                        user_id,
                        connection_id = conn.id(),
                        reason = ?frame,
                        "client initiated close"
                    );
                    break;
                }
            },
            Some(Err(err)) => {
                engine.on_error(&conn, err);
                break;
            }
            None => {
                // Stream ended, client disconnected.
                break;
            }
        }
    }

    writer_handle.abort();
    engine.on_close(&conn);
    tracing::info!(
        user_id,
        connection_id = conn.id(),
        remote = %addr,
        "websocket connection closed"
    );
}

/// Writer task: receives messages from the mpsc channel and forwards them to
/// the WebSocket sink until either side goes away.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if ws_sender.send(message).await.is_err() {
            // Send failed, the connection is broken.
            break;
        }
    }
}
