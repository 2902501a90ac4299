mod auth;
mod chat;
mod config;
mod helpers;
mod routes;
mod state;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use chat::engine::{run_watchdog, ChatEngine, ChatSettings};
use config::{generate_config_template, Config};
use state::AppState;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "wsrelay_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "wsrelay_server=info".parse().unwrap()),
            )
            .init();
    }

    // The worker count mirrors the transport thread pool size: 0 = one
    // worker per available core.
    let workers = if config.workers == 0 {
        std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(2)
    } else {
        config.workers
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("wsrelay server v{} starting", env!("CARGO_PKG_VERSION"));

    let settings = ChatSettings::from_config(&config)?;
    let authenticator = auth::create_from_config(&config);
    let engine = Arc::new(ChatEngine::new(settings, authenticator));

    let state = AppState {
        engine: engine.clone(),
    };
    let app = routes::build_router(state, &config.endpoint);

    let watchdog = if engine.watchdog_enabled() {
        Some(tokio::spawn(run_watchdog(engine.clone())))
    } else {
        None
    };

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port).parse()?;
    let proto = if config.tls_enabled { "wss" } else { "ws" };
    tracing::info!("Listening at {}://{}{}", proto, addr, config.endpoint);

    if config.tls_enabled {
        let cert = config
            .tls_cert_path
            .as_deref()
            .ok_or("tls_cert_path is required when TLS is enabled")?;
        let key = config
            .tls_key_path
            .as_deref()
            .ok_or("tls_key_path is required when TLS is enabled")?;
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;
    } else {
        let listener = TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    }

    tracing::info!("shutting down");
    engine.stop();
    if let Some(handle) = watchdog {
        let _ = handle.await;
    }

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
