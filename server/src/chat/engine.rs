//! Message routing engine and connection lifecycle policy.
//!
//! The transport (ws::actor / ws::handler) owns sockets and tasks; the
//! engine owns every decision: who may connect, where a payload goes, what
//! happens when a write fails, and when an idle connection dies. All entry
//! points are callback-safe — they log instead of propagating errors back
//! into the I/O pool.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::auth::{Authenticator, ConnectRequest};
use crate::chat::connection::{Connection, InboundFrame, OutboundFrame, WriteError};
use crate::chat::payload::MessagePayload;
use crate::chat::reassembly::FrameReassembler;
use crate::chat::registry::{ConnectionNotFound, ConnectionRegistry};
use crate::chat::stats::Statistics;
use crate::chat::undelivered::UndeliveredQueue;
use crate::chat::{
    UserId, CLOSE_INVALID_MESSAGE_PAYLOAD, CLOSE_INVALID_QUERY_PARAMS,
    CLOSE_INACTIVE_CONNECTION, CLOSE_MESSAGE_TOO_BIG, CLOSE_UNAUTHORIZED,
};
use crate::config::Config;
use crate::helpers::{format_size, parse_size, SizeParseError};

/// Watchdog ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Grace window between the ping round and the missed-pong sweep.
const PONG_GRACE: Duration = Duration::from_secs(2);

/// Out-of-band consumer of every routed payload (bots, webhooks).
pub type OnMessageListener = Box<dyn Fn(&MessagePayload) + Send + Sync>;

/// Invoked once when the server stops.
pub type OnStopListener = Box<dyn Fn() + Send + Sync>;

/// Why a connection attempt was rejected, mapped to a close code by the
/// transport.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    InvalidQueryParams(String),
}

impl ConnectError {
    pub fn close_code(&self) -> u16 {
        match self {
            ConnectError::Unauthorized => CLOSE_UNAUTHORIZED,
            ConnectError::InvalidQueryParams(_) => CLOSE_INVALID_QUERY_PARAMS,
        }
    }
}

/// Immutable routing policy, extracted from [`Config`] at startup. The
/// engine never consults global state after construction.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub max_message_size: usize,
    pub enable_delivery_status: bool,
    pub enable_undelivered_queue: bool,
    pub undelivered_queue_cap: usize,
    pub enable_send_back: bool,
    pub ignore_types_send_back: Vec<String>,
    pub watchdog_enabled: bool,
    pub connection_lifetime_secs: u64,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Result<Self, SizeParseError> {
        Ok(Self {
            max_message_size: parse_size(&config.max_message_size)? as usize,
            enable_delivery_status: config.enable_delivery_status,
            enable_undelivered_queue: config.enable_undelivered_queue,
            undelivered_queue_cap: config.undelivered_queue_cap,
            enable_send_back: config.enable_send_back,
            ignore_types_send_back: config.ignore_types_send_back.clone(),
            watchdog_enabled: config.watchdog_enabled,
            connection_lifetime_secs: config.connection_lifetime_secs,
        })
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024,
            enable_delivery_status: false,
            enable_undelivered_queue: true,
            undelivered_queue_cap: 1024,
            enable_send_back: false,
            ignore_types_send_back: Vec::new(),
            watchdog_enabled: false,
            connection_lifetime_secs: 600,
        }
    }
}

pub struct ChatEngine {
    settings: ChatSettings,
    auth: Arc<dyn Authenticator>,
    registry: ConnectionRegistry,
    reassembler: FrameReassembler,
    undelivered: UndeliveredQueue,
    stats: DashMap<UserId, Statistics>,
    message_listeners: RwLock<Vec<OnMessageListener>>,
    stop_listeners: RwLock<Vec<OnStopListener>>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl ChatEngine {
    pub fn new(settings: ChatSettings, auth: Arc<dyn Authenticator>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let undelivered = UndeliveredQueue::new(settings.undelivered_queue_cap);
        Self {
            settings,
            auth,
            registry: ConnectionRegistry::new(),
            reassembler: FrameReassembler::new(),
            undelivered,
            stats: DashMap::new(),
            message_listeners: RwLock::new(Vec::new()),
            stop_listeners: RwLock::new(Vec::new()),
            shutdown,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn max_message_size(&self) -> usize {
        self.settings.max_message_size
    }

    pub fn watchdog_enabled(&self) -> bool {
        self.settings.watchdog_enabled
    }

    pub fn undelivered_count(&self, user_id: UserId) -> usize {
        self.undelivered.len(user_id)
    }

    pub fn stat_snapshot(&self, user_id: UserId) -> Option<Statistics> {
        self.stats.get(&user_id).map(|stats| stats.clone())
    }

    // --- Connection lifecycle -------------------------------------------

    /// Decide whether an upgrade request may become a chat connection and
    /// which user it belongs to.
    pub fn authorize(&self, request: &ConnectRequest) -> Result<UserId, ConnectError> {
        if !self.auth.validate(request) {
            return Err(ConnectError::Unauthorized);
        }

        if !request.has_params() {
            return Err(ConnectError::InvalidQueryParams("Invalid request".to_string()));
        }

        let raw = request.param("id").unwrap_or_default();
        if raw.is_empty() {
            return Err(ConnectError::InvalidQueryParams(
                "Id required in query parameter: ?id={id}".to_string(),
            ));
        }

        raw.parse::<UserId>().map_err(|err| {
            ConnectError::InvalidQueryParams(format!("Passed invalid id: id={raw}. {err}"))
        })
    }

    /// Register an authenticated connection, then flush anything queued for
    /// the user. Redelivery runs after the add on purpose: payloads that
    /// still fail simply re-enqueue.
    pub fn register(&self, conn: Connection) {
        let user_id = conn.user_id();
        tracing::debug!(
            user_id,
            connection_id = conn.id(),
            remote = %conn.remote_addr(),
            "user connected"
        );
        self.registry.add(user_id, conn);
        self.stat(user_id).add_connection();
        self.redeliver_messages_to(user_id);
    }

    pub fn on_close(&self, conn: &Connection) {
        // Already removed by a sweep or a broken-pipe write.
        if !self.registry.exists(conn.id()) {
            return;
        }
        tracing::debug!(
            user_id = conn.user_id(),
            connection_id = conn.id(),
            "user disconnected"
        );
        self.stat(conn.user_id()).add_disconnection();
        self.registry.remove_connection(conn);
    }

    pub fn on_error(&self, conn: &Connection, error: impl std::fmt::Display) {
        tracing::warn!(
            user_id = conn.user_id(),
            connection_id = conn.id(),
            error = %error,
            "connection error"
        );
    }

    pub fn on_pong(&self, conn: &Connection) {
        self.registry.mark_pong_received(conn);
        self.stat(conn.user_id()).mark_active();
    }

    // --- Inbound frames -------------------------------------------------

    /// Demultiplex one inbound frame: single frames deliver directly,
    /// fragment frames drive the per-sender reassembly buffer.
    pub fn on_frame(&self, conn: &Connection, frame: InboundFrame) {
        let sender = conn.user_id();
        let data = match frame {
            InboundFrame::Text(text) => text.into_bytes(),
            InboundFrame::Binary(data) => data,
            InboundFrame::FragmentBeginText(data) | InboundFrame::FragmentBeginBinary(data) => {
                tracing::debug!(user_id = sender, "fragmented message begin");
                self.reassembler.begin(sender, &data);
                return;
            }
            InboundFrame::FragmentContinue(data) => {
                self.reassembler.append(sender, &data);
                return;
            }
            InboundFrame::FragmentEnd(data) => {
                tracing::debug!(user_id = sender, "fragmented message end");
                let assembled = self.reassembler.finish(sender, &data);
                if assembled.len() > self.settings.max_message_size {
                    conn.send_close(
                        CLOSE_MESSAGE_TOO_BIG,
                        format!(
                            "Message too big. Maximum size: {}",
                            format_size(self.settings.max_message_size as u64)
                        ),
                    );
                    return;
                }
                assembled
            }
        };

        let payload = match MessagePayload::from_slice(&data) {
            Ok(payload) => payload,
            Err(err) => {
                conn.send_close(
                    CLOSE_INVALID_MESSAGE_PAYLOAD,
                    format!("Invalid payload. {err}"),
                );
                return;
            }
        };

        if self.settings.enable_send_back && !payload.is_for_bot() {
            let ignored = self
                .settings
                .ignore_types_send_back
                .iter()
                .any(|t| t.eq_ignore_ascii_case(payload.message_type()));
            if !ignored {
                self.send_to(payload.sender(), &payload);
            }
        }

        self.send(&payload);
    }

    // --- Routing --------------------------------------------------------

    /// Route a payload: listeners always see it first; bot payloads stop
    /// there, everything else fans out to each non-zero recipient.
    pub fn send(&self, payload: &MessagePayload) {
        self.call_message_listeners(payload);

        if payload.is_for_bot() {
            tracing::debug!(sender = payload.sender(), "bot message served by listeners");
            return;
        }

        for &recipient in payload.recipients() {
            if recipient == 0 {
                continue;
            }
            self.send_to(recipient, payload);
        }
    }

    /// Deliver to every live connection of one recipient, falling back to
    /// the undelivered queue.
    pub fn send_to(&self, recipient: UserId, payload: &MessagePayload) {
        let json = match payload.to_json() {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(recipient, error = %err, "payload serialization failed");
                return;
            }
        };
        let payload_size = json.len();

        if self.registry.size(recipient) == 0 {
            self.handle_undeliverable(recipient, payload);
            self.on_message_sent(payload.clone().with_recipient(recipient), payload_size, false);
            return;
        }

        match self.registry.get(recipient) {
            Ok(connections) => {
                for (connection_id, conn) in connections {
                    match conn.write(OutboundFrame::Text(json.clone())) {
                        Ok(bytes) => {
                            tracing::debug!(
                                recipient,
                                connection_id,
                                bytes,
                                "message delivered"
                            );
                            self.on_message_sent(
                                payload.clone().with_recipient(recipient),
                                bytes,
                                true,
                            );
                        }
                        Err(WriteError::BrokenPipe) => {
                            tracing::debug!(
                                recipient,
                                connection_id,
                                "broken pipe, dropping connection"
                            );
                            self.registry.remove(recipient, connection_id);
                            self.handle_undeliverable(recipient, payload);
                        }
                        Err(WriteError::Transient(err)) => {
                            tracing::debug!(
                                recipient,
                                connection_id,
                                error = %err,
                                "transient write failure"
                            );
                            self.handle_undeliverable(recipient, payload);
                        }
                    }
                }
            }
            // Raced with a close between the size check and the snapshot.
            Err(ConnectionNotFound(_)) => {
                self.handle_undeliverable(recipient, payload);
            }
        }
    }

    fn handle_undeliverable(&self, recipient: UserId, payload: &MessagePayload) {
        if !self.settings.enable_undelivered_queue {
            tracing::debug!(recipient, "recipient unavailable, skipping message");
            return;
        }
        self.undelivered
            .push(recipient, payload.clone().with_recipient(recipient));
        tracing::debug!(recipient, "recipient unavailable, message queued");
    }

    /// Delivery bookkeeping after a write attempt. Receipts themselves are
    /// excluded so a send-status can never trigger another send-status.
    fn on_message_sent(&self, payload: MessagePayload, bytes: usize, has_sent: bool) {
        if payload.is_type_of_sent_status() {
            return;
        }

        self.stat(payload.sender())
            .add_sent_message()
            .add_bytes_transferred(bytes as u64);

        for &recipient in payload.recipients() {
            if has_sent {
                self.stat(recipient)
                    .add_received_message()
                    .add_bytes_transferred(bytes as u64);
            }
        }

        if self.settings.enable_delivery_status && has_sent {
            let status = MessagePayload::create_send_status(&payload);
            self.send(&status);
        }
    }

    /// Flush the user's undelivered queue in FIFO order. Returns the number
    /// of payloads replayed.
    pub fn redeliver_messages_to(&self, recipient: UserId) -> usize {
        if !self.settings.enable_undelivered_queue {
            return 0;
        }

        let queued = self.undelivered.pop_all(recipient);
        if queued.is_empty() {
            return 0;
        }

        tracing::debug!(
            user_id = recipient,
            count = queued.len(),
            "redelivering queued messages"
        );
        let count = queued.len();
        for payload in queued {
            self.send(&payload);
        }
        count
    }

    // --- Listener fan-out -----------------------------------------------

    pub fn add_message_listener(&self, listener: OnMessageListener) {
        self.message_listeners_lock().push(listener);
    }

    pub fn add_stop_listener(&self, listener: OnStopListener) {
        self.stop_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn call_message_listeners(&self, payload: &MessagePayload) {
        let listeners = self
            .message_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for (index, listener) in listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
                tracing::warn!(listener = index, "message listener panicked");
            }
        }
    }

    fn message_listeners_lock(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, Vec<OnMessageListener>> {
        self.message_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // --- Shutdown -------------------------------------------------------

    /// Stop the engine: fire stop listeners once and interrupt the
    /// watchdog. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners = self
            .stop_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for (index, listener) in listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                tracing::warn!(listener = index, "stop listener panicked");
            }
        }
        let _ = self.shutdown.send(true);
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    // --- Watchdog internals ---------------------------------------------

    /// One ping round: close connections past the inactivity threshold,
    /// ping the rest. Removal of closed connections is left to the
    /// transport close callback.
    fn watchdog_sweep(&self) {
        let lifetime = self.settings.connection_lifetime_secs;
        self.registry.for_each(|user_id, connections| {
            let inactive = self
                .stats
                .get(&user_id)
                .map(|stats| stats.inactive_secs())
                .unwrap_or(0);

            for (connection_id, conn) in connections {
                if inactive >= lifetime {
                    conn.send_close(
                        CLOSE_INACTIVE_CONNECTION,
                        format!("Inactive more than {lifetime} seconds ({inactive})"),
                    );
                } else {
                    match conn.write(OutboundFrame::Ping(b".".to_vec())) {
                        Ok(_) => self.registry.mark_pong_wait(conn),
                        Err(_) => {
                            // Ping not even submittable: the connection is bad.
                            self.registry.remove(user_id, *connection_id);
                        }
                    }
                }
            }
        });
    }

    fn stat(&self, user_id: UserId) -> dashmap::mapref::one::RefMut<'_, UserId, Statistics> {
        self.stats
            .entry(user_id)
            .or_insert_with(|| Statistics::new(user_id))
    }
}

/// Liveness watchdog loop: ping round, pong grace window, sweep. Runs until
/// the engine's shutdown signal fires.
pub async fn run_watchdog(engine: Arc<ChatEngine>) {
    let mut shutdown = engine.subscribe_shutdown();
    tracing::info!(
        lifetime_secs = engine.settings.connection_lifetime_secs,
        "watchdog started with interval of 1 minute"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(PING_INTERVAL) => {}
        }

        engine.watchdog_sweep();

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(PONG_GRACE) => {}
        }

        let disconnected = engine.registry.disconnect_without_pong();
        if disconnected > 0 {
            tracing::debug!(disconnected, "dropped dangling connections");
        }
    }

    tracing::info!("watchdog stopping");
}
