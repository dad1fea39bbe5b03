//! Mediacodec Host - standalone process serving codec sessions.
//!
//! Each client connection gets its own codec session. The parent process
//! reads the bound port from stdout.

use anyhow::{Context, Result};
use clap::Parser;
use mediacodec_core::{EngineConfig, IpcServer, ServerOptions};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "mediacodec-host")]
#[command(about = "Hosts media codec sessions for out-of-process clients")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Missing fields fall back to their defaults.
fn load_engine_config(path: &Path) -> Result<EngineConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading engine config {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("parsing engine config {}", path.display()))
}

/// `RUST_LOG` wins over `--debug` when it parses.
fn log_filter(debug: bool, directives: Option<&str>) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let builder = FmtSubscriber::builder()
        .with_env_filter(log_filter(args.debug, directives.as_deref()))
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);
    if args.log_json {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    info!("Starting codec host");

    let engine = match &args.config {
        Some(path) => load_engine_config(path)?,
        None => EngineConfig::default(),
    };
    info!("Shared memory directory: {}", engine.shm_dir().display());

    let options = ServerOptions {
        engine,
        ..ServerOptions::default()
    };
    let handle = IpcServer::start_on(SocketAddr::new(args.host, args.port), options)
        .await
        .context("starting codec server")?;

    // Print port for the parent process to read (intentional stdout for IPC)
    println!("MEDIACODEC_PORT={}", handle.port);

    info!("Codec host running on {}", handle.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    drop(handle);
    Ok(())
}
