use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::Response,
};

use crate::auth::ConnectRequest;
use crate::state::AppState;
use crate::ws::actor;

/// WebSocket upgrade endpoint. Identity comes from the `?id=` query
/// parameter; the configured authenticator sees all query parameters and
/// headers. On rejection the socket is upgraded and immediately closed with
/// an application close code, so clients get a reason instead of a bare
/// HTTP error.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let request = ConnectRequest::new(params, header_map(&headers));

    match state.engine.authorize(&request) {
        Ok(user_id) => {
            tracing::debug!(user_id, remote = %addr, "connection authorized");
            // Transport-level cap on single frames; reassembled fragment
            // totals are bounded separately by the engine.
            ws.max_message_size(state.engine.max_message_size())
                .on_upgrade(move |socket| actor::run_connection(socket, state, user_id, addr))
        }
        Err(err) => {
            let code = err.close_code();
            let reason = err.to_string();
            tracing::warn!(code, reason = %reason, remote = %addr, "connection rejected");
            ws.on_upgrade(move |mut socket| async move {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
            })
        }
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
