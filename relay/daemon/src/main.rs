//! Relay Daemon - Background Request and Stream Proxy
//!
//! The long-lived process every UI surface talks to. It owns the credential
//! store, proxies one-shot requests and relays streaming responses. Surfaces
//! connect over a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! relay-daemon
//!
//! # Custom socket path and API server
//! relay-daemon --socket-path /tmp/relay.sock --base-url https://chat.example.com
//!
//! # With config file
//! relay-daemon --config ~/.config/relay/relay.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown (open streams end with `done`, `stopped: true`)

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_core::{load_config_from_path, ConfigOverrides, Gateway};

use server::DaemonServer;

/// Relay Daemon - proxies remote API traffic for every UI surface
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for surface connections
    #[arg(short = 's', long, env = "RELAY_SOCKET", value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Remote API base URL
    #[arg(short = 'u', long, value_name = "URL")]
    base_url: Option<String>,

    /// Credential file path
    #[arg(long, value_name = "FILE")]
    credentials: Option<PathBuf>,

    /// PID file path
    #[arg(long, env = "RELAY_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            socket_path: self.socket_path.clone(),
            base_url: self.base_url.clone(),
            credentials_path: self.credentials.clone(),
        }
    }
}

/// PID file next to the socket
fn default_pid_path(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("pid")
}

fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {}", parent.display()))?;
    }

    let pid = std::process::id();
    let mut file = fs::File::create(path)
        .with_context(|| format!("Failed to create PID file: {}", path.display()))?;
    writeln!(file, "{pid}")?;

    info!(pid, path = %path.display(), "PID file created");
    Ok(())
}

fn remove_pid_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "PID file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = %path.display(), "Failed to remove PID file"),
    }
}

/// Refuse to start when the PID file names a live process
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {}", pid_path.display()))?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in file")?;

    // SAFETY: signal 0 only checks that the process exists.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another relay-daemon is already running (PID: {pid}). \
             Stop it first or remove {} if it's stale.",
            pid_path.display()
        );
    }

    warn!(pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Cancel `shutdown` on SIGTERM or SIGINT
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "Relay daemon starting"
    );

    let config_path = args.config.clone().or_else(relay_core::default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        socket_path = %config.socket_path.display(),
        base_url = %config.base_url,
        source = %config.source(),
        "Configuration resolved"
    );

    let pid_path = args
        .pid_file
        .clone()
        .unwrap_or_else(|| default_pid_path(&config.socket_path));
    check_existing_daemon(&pid_path)?;
    write_pid_file(&pid_path)?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let result = match Gateway::from_config(&config) {
        Ok(gateway) => DaemonServer::new(&config, gateway).run(shutdown).await,
        Err(e) => Err(e).context("Failed to set up gateway"),
    };

    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
