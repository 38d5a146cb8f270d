//! linger-server: persistent process session host.
//!
//! Spawns processes on pseudo-terminals, keeps their output in logs and
//! terminal buffers, and lets any number of clients attach and detach over
//! HTTP + SSE while the processes keep running.

use clap::Parser;
use linger_core::{StatePaths, SystemProbe};
use linger_server::{router, Overrides, ServerConfig, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// linger-server: persistent process session host
#[derive(Parser, Debug)]
#[command(name = "linger-server", version, about = "Persistent process session host")]
struct Cli {
    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path [default: <state dir>/config.toml]
    #[arg(long)]
    config: Option<String>,

    /// State directory (registry and logs)
    #[arg(long)]
    state_dir: Option<String>,

    /// Remove sessions idle for this many seconds (0 disables)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Maximum concurrent live sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = match &cli.config {
        Some(path) => PathBuf::from(path),
        None => match &cli.state_dir {
            Some(dir) => StatePaths::new(linger_core::paths::expand_tilde(dir)).config_file(),
            None => StatePaths::default_location().config_file(),
        },
    };
    let overrides = Overrides {
        host: cli.host,
        port: cli.port,
        state_dir: cli.state_dir,
        idle_timeout: cli.idle_timeout,
        max_sessions: cli.max_sessions,
    };
    let config = match ServerConfig::load(&config_path, overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr(),
        state_dir = %config.sessions.paths.root().display(),
        "starting linger-server"
    );

    let manager = Arc::new(SessionManager::new(
        config.sessions.clone(),
        Arc::new(SystemProbe),
    ));
    if let Err(e) = manager.reconcile().await {
        error!(error = %e, "failed to read session registry");
        std::process::exit(1);
    }

    let sweeper = tokio::spawn(sweep_loop(manager.clone(), config.sweep_interval));

    let listener = match tokio::net::TcpListener::bind(config.bind_addr()).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %config.bind_addr(), "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %config.bind_addr(), "listening");

    // Sessions are stopped as soon as the signal arrives: open streams end
    // with their exit event, which lets the graceful shutdown complete.
    let stopping = manager.clone();
    let served = axum::serve(listener, router(manager.clone()))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            if let Err(e) = stopping.shutdown().await {
                warn!(error = %e, "failed to persist session state");
            }
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "server error");
    }

    sweeper.abort();
    if let Err(e) = manager.flush().await {
        warn!(error = %e, "failed to persist session state");
    }
    info!("linger-server stopped");
}

/// Periodically sweep idle sessions and persist activity timestamps.
async fn sweep_loop(manager: Arc<SessionManager>, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(e) = manager.sweep(linger_core::now_ms()).await {
            warn!(error = %e, "idle sweep failed");
        }
        if let Err(e) = manager.flush().await {
            warn!(error = %e, "activity flush failed");
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
