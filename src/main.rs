#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # silcd
//!
//! Daemon for SILC ("Shared Interactive Linked CMD"): networked, shareable
//! PTY sessions. Each session gets its own HTTP/WebSocket endpoint; a single
//! management endpoint on a well-known port handles session lifecycle.
//!
//! ## Subcommands
//!
//! - `silcd serve` (default) — run the daemon. Resurrection of a prior run's
//!   `sessions.json` happens automatically on startup and is also available
//!   on a running daemon via `POST /resurrect` on the management endpoint —
//!   there is no separate CLI subcommand for it.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use silc::{daemon::Daemon, management, Config};

#[derive(Parser)]
#[command(name = "silcd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default when no subcommand given).
    Serve {
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => {
            let args: Vec<String> = std::env::args().collect();
            args.windows(2).find(|w| w[0] == "--config").map(|w| w[1].clone())
        }
    };

    let code = run(config_path.as_deref()).await;
    std::process::exit(code);
}

async fn run(config_path: Option<&str>) -> i32 {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.log_level.clone());
    let log_dir = std::path::PathBuf::from(&config.paths.log_dir);
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log directory {}: {e}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::never(&log_dir, "daemon.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_filter))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    info!("silcd v{} starting", env!("CARGO_PKG_VERSION"));

    let daemon = Daemon::new(Arc::new(config));

    if let Err(e) = daemon.check_not_already_running() {
        error!(error = %e, "refusing to start");
        return 1;
    }
    if let Err(e) = daemon.write_pidfile() {
        error!(error = %e, "failed to write pid file");
        return 1;
    }

    let daemon_port = daemon.config.ports.daemon_start;
    let listener = match TcpListener::bind(("127.0.0.1", daemon_port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(port = daemon_port, error = %e, "failed to bind management port");
            daemon.remove_pidfile();
            return 1;
        }
    };
    info!(port = daemon_port, "management endpoint listening");

    let (restored, failed) = daemon.resurrect().await;
    if !restored.is_empty() {
        info!(count = restored.len(), "resurrected sessions from prior run");
    }
    for (name, reason) in &failed {
        warn!(name = %name, reason = %reason, "failed to resurrect session");
    }

    let gc_interval = Duration::from_secs(daemon.config.sessions.gc_interval);
    let gc_daemon = daemon.clone();
    let gc_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(gc_interval);
        loop {
            ticker.tick().await;
            gc_daemon.gc_tick().await;
        }
    });

    let mut management_task = spawn_management(daemon.clone(), listener);

    let shutdown_signal = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("shutting down");
                break;
            }
            _ = daemon.wait_for_management_restart() => {
                management_task.abort();
                match TcpListener::bind(("127.0.0.1", daemon_port)).await {
                    Ok(new_listener) => {
                        info!(port = daemon_port, "management endpoint rebound");
                        management_task = spawn_management(daemon.clone(), new_listener);
                    }
                    Err(e) => {
                        error!(port = daemon_port, error = %e, "failed to rebind management port, sessions unaffected");
                        return 2;
                    }
                }
            }
        }
    }

    gc_task.abort();
    management_task.abort();
    daemon.shutdown(Duration::from_secs(30)).await;

    info!("goodbye");
    0
}

fn spawn_management(daemon: Arc<Daemon>, listener: TcpListener) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        management::serve(daemon, listener).await;
    })
}
