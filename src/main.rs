use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

mod chunker;
mod config;
mod embedder;
mod error;
mod index;
mod kronos;
mod persist;
mod replica;
mod retrieval;
mod routes;
mod server;
mod state;
mod vault;
mod vaults;

#[tokio::main]
async fn main() -> Result<()> {
    // Resolve log directory (same parent as data_dir or from env)
    let log_dir = std::env::var("MEMVAULT_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("memvault-backend").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".memvault-data/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    // File appender: daily rotated log files
    let file_appender = tracing_appender::rolling::daily(&log_dir, "memvault-backend.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Build tracing subscriber with both stdout + file output using layers
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "memvault_backend=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Install panic hook that logs before aborting
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "memvault_backend::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    routes::health::init_start_time();

    let config = config::AppConfig::from_env();
    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        default_embedding_dims = config.default_embedding_dims,
        hot_window_hours = config.hot_window_hours,
        working_window_days = config.working_window_days,
        longterm_window_days = config.longterm_window_days,
        race_timeout_ms = config.race_timeout_ms,
        replica_max_chunks = config.replica_max_chunks,
        hibernate_secs = config.hibernate_secs,
        log_dir = %log_dir,
        "memvault backend starting"
    );

    let app_state = state::AppState::new(config).await?;

    routes::health::init_shutdown_notify();

    // Hibernation sweeper: drop in-memory vault state after the idle TTL.
    // Persistence survives; the next call re-hydrates.
    let sweeper_state = app_state.clone();
    let ttl = Duration::from_secs(app_state.config.hibernate_secs);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(ttl.max(Duration::from_secs(30)) / 2);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            sweeper_state.vaults.evict_idle(ttl);
        }
    });

    let app = server::create_app(app_state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("memvault backend listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("memvault backend shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install secondary Ctrl+C handler");
    };

    // Also wait for HTTP-based shutdown request (for supervisors without signals)
    let http_shutdown = routes::health::wait_for_shutdown();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("Received terminate signal, initiating shutdown"); },
        _ = http_shutdown => { info!("Received HTTP shutdown request, initiating shutdown"); },
    }

    info!("Shutdown signal received");
}
