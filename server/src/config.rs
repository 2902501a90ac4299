use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// wsrelay chat server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "wsrelay-server", version, about = "Multi-user WebSocket chat relay")]
pub struct Config {
    /// Bind address
    #[arg(long, env = "WSRELAY_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Port to listen on
    #[arg(long, env = "WSRELAY_PORT", default_value = "8085")]
    pub port: u16,

    /// WebSocket endpoint path
    #[arg(long, env = "WSRELAY_ENDPOINT", default_value = "/chat")]
    pub endpoint: String,

    /// Runtime worker threads (0 = available parallelism)
    #[arg(long, env = "WSRELAY_WORKERS", default_value = "0")]
    pub workers: usize,

    /// Enable the liveness watchdog
    #[arg(long, env = "WSRELAY_WATCHDOG_ENABLED")]
    pub watchdog_enabled: bool,

    /// Watchdog inactivity threshold in seconds
    #[arg(long, env = "WSRELAY_CONNECTION_LIFETIME_SECS", default_value = "600")]
    pub connection_lifetime_secs: u64,

    /// Serve wss:// with rustls
    #[arg(long, env = "WSRELAY_TLS_ENABLED")]
    pub tls_enabled: bool,

    /// PEM certificate path (required when TLS is enabled)
    #[arg(long, env = "WSRELAY_TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// PEM private key path (required when TLS is enabled)
    #[arg(long, env = "WSRELAY_TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    /// Maximum message size, human readable (e.g. 10M, 512K)
    #[arg(long, env = "WSRELAY_MAX_MESSAGE_SIZE", default_value = "10M")]
    pub max_message_size: String,

    /// Emit send-status delivery receipts
    #[arg(long, env = "WSRELAY_ENABLE_DELIVERY_STATUS")]
    pub enable_delivery_status: bool,

    /// Queue messages for offline recipients
    #[arg(
        long,
        env = "WSRELAY_ENABLE_UNDELIVERED_QUEUE",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub enable_undelivered_queue: bool,

    /// Per-user bound of the undelivered queue (drop-oldest)
    #[arg(long, env = "WSRELAY_UNDELIVERED_QUEUE_CAP", default_value = "1024")]
    pub undelivered_queue_cap: usize,

    /// Echo each message back to its sender
    #[arg(long, env = "WSRELAY_ENABLE_SEND_BACK")]
    pub enable_send_back: bool,

    /// Message types excluded from send-back, comma separated
    #[arg(long, env = "WSRELAY_IGNORE_TYPES_SEND_BACK", value_delimiter = ',')]
    pub ignore_types_send_back: Vec<String>,

    /// Authentication type: noauth, basic or bearer
    #[arg(long, env = "WSRELAY_AUTH_TYPE", default_value = "noauth")]
    pub auth_type: String,

    /// Username for basic auth
    #[arg(long, env = "WSRELAY_AUTH_BASIC_USERNAME")]
    pub auth_basic_username: Option<String>,

    /// Password for basic auth
    #[arg(long, env = "WSRELAY_AUTH_BASIC_PASSWORD")]
    pub auth_basic_password: Option<String>,

    /// Token for bearer auth
    #[arg(long, env = "WSRELAY_AUTH_BEARER_TOKEN")]
    pub auth_bearer_token: Option<String>,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "WSRELAY_JSON_LOGS")]
    pub json_logs: bool,

    /// Path to TOML config file
    #[arg(long, default_value = "./wsrelay.toml")]
    pub config: String,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8085,
            endpoint: "/chat".to_string(),
            workers: 0,
            watchdog_enabled: false,
            connection_lifetime_secs: 600,
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            max_message_size: "10M".to_string(),
            enable_delivery_status: false,
            enable_undelivered_queue: true,
            undelivered_queue_cap: 1024,
            enable_send_back: false,
            ignore_types_send_back: Vec::new(),
            auth_type: "noauth".to_string(),
            auth_basic_username: None,
            auth_basic_password: None,
            auth_bearer_token: None,
            json_logs: false,
            config: "./wsrelay.toml".to_string(),
            generate_config: false,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (WSRELAY_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("WSRELAY_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# wsrelay chat server configuration
# Place this file at ./wsrelay.toml or specify with --config <path>
# All settings can be overridden via environment variables (WSRELAY_PORT, etc.)
# or CLI flags (--port, etc.)

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Listen port (default: 8085)
# port = 8085

# WebSocket endpoint path (default: /chat)
# endpoint = "/chat"

# Runtime worker threads, 0 = available parallelism
# workers = 0

# Liveness watchdog: pings idle connections every minute and drops
# connections inactive longer than connection_lifetime_secs
# watchdog_enabled = false
# connection_lifetime_secs = 600

# TLS (wss://). Both paths are required when enabled.
# tls_enabled = false
# tls_cert_path = "/etc/wsrelay/server.crt"
# tls_key_path = "/etc/wsrelay/server.key"

# Maximum message size after reassembly, human readable
# max_message_size = "10M"

# Emit send-status delivery receipts to senders
# enable_delivery_status = false

# Queue messages for offline recipients, redelivered on reconnect.
# Each user's queue is bounded; the oldest message is dropped at the cap.
# enable_undelivered_queue = true
# undelivered_queue_cap = 1024

# Echo each non-bot message back to its sender, except the listed types
# enable_send_back = false
# ignore_types_send_back = ["notification"]

# Authentication: "noauth", "basic" or "bearer"
# auth_type = "noauth"
# auth_basic_username = "relay"
# auth_basic_password = "secret"
# auth_bearer_token = "token"

# Enable structured JSON logging for Docker/production
# json_logs = false
"#
    .to_string()
}
