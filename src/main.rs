//! GDB Bridge
//!
//! Connects an IDE debug front end to a GDB/MI debugger that drives a
//! JTAG/SWD probe server. The IDE talks `<sep>`-framed JSON over TCP; the
//! bridge turns each request into debugger commands and streams typed
//! responses back.
//!
//! Usage:
//!   gdb-bridge --listen 127.0.0.1:1122 --gdb arm-none-eabi-gdb --remote localhost:2331

mod bridge;
mod gdb;

use crate::bridge::BridgeConfig;
use crate::gdb::{GdbConfig, RemoteTargetConfig, RepeatPolicy};
use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(version, about)]
struct Args {
    /// Address the IDE connects to
    #[clap(long, default_value = bridge::server::DEFAULT_LISTEN)]
    listen: String,

    /// Debugger executable
    #[clap(long)]
    gdb: Option<String>,

    /// Debugger argument, repeatable; replaces the default `--interpreter mi`
    #[clap(long = "gdb-arg", allow_hyphen_values = true)]
    gdb_args: Vec<String>,

    /// Probe server as `host:port`, or a serial device path
    #[clap(long)]
    remote: Option<RemoteTargetConfig>,

    /// How long to wait for the debugger's first prompt
    #[clap(long, default_value_t = 10_000)]
    startup_timeout_ms: u64,

    /// Keep `<repeats N times>` runs as annotated strings instead of unfolding them
    #[clap(long)]
    keep_repeats: bool,
}

impl Args {
    fn into_config(self) -> BridgeConfig {
        let mut gdb = GdbConfig::default();
        if let Some(path) = self.gdb {
            gdb.gdb_path = path;
        }
        if !self.gdb_args.is_empty() {
            gdb.gdb_args = self.gdb_args;
        }
        if self.keep_repeats {
            gdb.repeat_policy = RepeatPolicy::Annotate;
        }

        BridgeConfig {
            listen: self.listen,
            gdb,
            remote: self.remote.unwrap_or_default(),
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Args::parse().into_config();
    info!("Starting GDB Bridge v{}", env!("CARGO_PKG_VERSION"));

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;
    info!(
        "Listening on {} (gdb: {}, remote: {})",
        config.listen,
        config.gdb.gdb_path,
        config.remote.to_target_string()
    );

    bridge::serve(listener, config).await?;

    info!("GDB Bridge shutting down");
    Ok(())
}
