//! negotiatord — rendezvous server for TCP hole punching.
//!
//! Peers register a name and their private address; the negotiator records
//! the public address it observes and introduces peers to each other on
//! request.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use punch_core::config::PunchConfig;
use punch_services::{Registry, RendezvousServer};

#[derive(Parser, Debug)]
#[command(name = "negotiatord", version, about = "TCP hole-punch negotiator")]
struct Args {
    /// Address to listen on (overrides config)
    #[arg(short, long)]
    addr: Option<SocketAddr>,

    /// Write a default config file if none exists, then continue
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // Load config
    if args.init_config {
        if let Err(e) = PunchConfig::write_default_if_missing(&PunchConfig::file_path()) {
            tracing::warn!(error = %e, "failed to write default config");
        }
    }
    let config = PunchConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PunchConfig::default()
    });

    let addr = match args.addr {
        Some(addr) => addr,
        None => config
            .negotiator
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen_addr {:?}", config.negotiator.listen_addr))?,
    };

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind negotiator on {addr}"))?;
    tracing::info!(%addr, "negotiatord starting");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let server = RendezvousServer::new(listener, Registry::shared(), shutdown_tx.subscribe());
    server.run().await
}
