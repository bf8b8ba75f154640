//! Standalone relay server binary.
//!
//! Usage:
//!   cargo run -p relay_server -- [--addr 0.0.0.0:2021]
//!
//! The server accepts client connections, relays control and status
//! traffic between scene peers, and hands out UDP channels on demand.
//! SIGTERM/SIGINT trigger a graceful stop.

use std::env;

use anyhow::Context;
use relay_server::RelayServer;
use relay_shared::config::RelayConfig;
use tracing::info;

fn parse_args() -> RelayConfig {
    let mut cfg = RelayConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("install ctrl-c handler")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("install ctrl-c handler")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(addr = %cfg.server_addr, "Starting relay server");

    let mut server = RelayServer::bind(cfg).await.context("bind relay")?;
    server.start()?;
    info!(addr = %server.local_addr(), "Relay ready");

    wait_for_shutdown().await?;
    info!("Shutdown signal received");
    server.stop().await;
    Ok(())
}
