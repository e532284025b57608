//! Hearthamp Server - standalone daemon binding the controller to hardware
//! and HTTP.
//!
//! Wires up [`hearthamp_core::bootstrap`], serves the HTTP control surface,
//! and drives shutdown on `Ctrl+C`/`SIGTERM`.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use hearthamp_core::api::{AppState, create_router};
use hearthamp_core::Config;
use tokio::signal;

/// Hearthamp Server - multi-zone amplifier control daemon.
#[derive(Parser, Debug)]
#[command(name = "hearthamp-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Use the simulated hardware bus instead of the real I2C/serial device.
    #[arg(long)]
    mock: bool,

    /// HTTP bind address.
    #[arg(long, default_value = "0.0.0.0:80", env = "HEARTHAMP_ADDR")]
    addr: String,

    /// Directory for persisted configuration.
    #[arg(long, env = "HEARTHAMP_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Verbose logging (equivalent to `RUST_LOG=debug`).
    #[arg(long)]
    debug: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value = "pretty", env = "HEARTHAMP_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

fn init_logging(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let env = env_logger::Env::default().filter_or("RUST_LOG", default_level);
    let mut builder = env_logger::Builder::from_env(env);
    if let Ok(filters) = std::env::var("HEARTHAMP_LOG") {
        builder.parse_filters(&filters);
    }

    match args.log_format {
        LogFormat::Pretty => {
            builder.format_timestamp_millis();
        }
        LogFormat::Json => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{{\"ts\":\"{}\",\"level\":\"{}\",\"target\":\"{}\",\"message\":\"{}\"}}",
                    buf.timestamp_millis(),
                    record.level(),
                    record.target(),
                    record.args()
                )
            });
        }
    }

    builder.init();
}

fn default_config_dir() -> PathBuf {
    dirs_config_dir().join("hearthamp")
}

/// Minimal `~/.config` resolution without pulling in the `dirs` crate: honors
/// `XDG_CONFIG_HOME`, falls back to `$HOME/.config`.
fn dirs_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    log::info!("Hearthamp Server v{}", env!("CARGO_PKG_VERSION"));

    let config_dir = args.config_dir.clone().unwrap_or_else(default_config_dir);
    log::info!("[Server] config_dir={}, mock={}", config_dir.display(), args.mock);

    let addr: SocketAddr = match args.addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            log::error!("[Server] invalid --addr {:?}: {}", args.addr, err);
            std::process::exit(1);
        }
    };

    let services = match hearthamp_core::bootstrap::bootstrap_with_defaults(&config_dir, Config::default(), args.mock).await {
        Ok(services) => services,
        Err(err) => {
            log::error!("[Server] bootstrap failed: {}", err);
            std::process::exit(1);
        }
    };
    log::info!("[Server] services bootstrapped");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("[Server] failed to bind {}: {}", addr, err);
            std::process::exit(1);
        }
    };
    log::info!("[Server] listening on http://{}", addr);

    let app_state = AppState {
        controller: services.controller.clone(),
        event_bus: services.event_bus.clone(),
    };
    let app = create_router(app_state);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let server_task = tokio::spawn(server);

    shutdown_signal().await;
    log::info!("[Server] shutdown signal received");

    let _ = shutdown_tx.send(());
    services.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(15), server_task).await {
        Ok(Ok(Ok(()))) => log::info!("[Server] HTTP server stopped cleanly"),
        Ok(Ok(Err(err))) => log::error!("[Server] HTTP server error: {}", err),
        Ok(Err(err)) => log::error!("[Server] HTTP server task panicked: {}", err),
        Err(_) => log::warn!("[Server] HTTP server did not stop within the 15s grace period, exiting anyway"),
    }

    log::info!("[Server] shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
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
