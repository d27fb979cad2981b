//! punch-peer — register with a negotiator and punch a direct TCP connection.
//!
//! With `--target` the peer asks for that peer and chats over the punched
//! connection. Without it the peer waits for offers and echoes whatever
//! each counterparty sends.

use std::net::{SocketAddr, SocketAddrV4};

use anyhow::{bail, Context, Result};
use clap::Parser;

use punch_core::config::PunchConfig;
use punch_services::{Engine, NegotiatorClient};

mod session;

#[derive(Parser, Debug)]
#[command(name = "punch-peer", version, about = "TCP hole-punching peer")]
struct Args {
    /// Negotiator address, host:port (overrides config)
    #[arg(long)]
    negotiator_addr: Option<String>,

    /// Name other peers use to reach us (overrides config)
    #[arg(long)]
    name: Option<String>,

    /// Peer to connect to; wait for incoming peers when omitted
    #[arg(long)]
    target: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = PunchConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PunchConfig::default()
    });

    let negotiator = args
        .negotiator_addr
        .unwrap_or(config.peer.negotiator_addr.clone());
    if negotiator.is_empty() {
        bail!("--negotiator-addr is required");
    }
    let name = args.name.unwrap_or(config.peer.name.clone());
    if name.is_empty() {
        bail!("--name is required");
    }

    let negotiator = resolve_v4(&negotiator).await?;
    let mut client = NegotiatorClient::connect(negotiator).await?;
    let me = client.register(&name).await.context("registration failed")?;
    println!(
        "registered as {name} from {}, seen as {}",
        client.local_addr(),
        me.remote_addr()
    );

    let engine = Engine::new(client.local_port(), config.establish.clone());

    match args.target {
        Some(target) => {
            let peer = client
                .request_connection(&target)
                .await
                .with_context(|| format!("cannot reach {target}"))?;
            let mut established = engine
                .establish(&peer)
                .await
                .with_context(|| format!("failed to establish connection to {target}"))?;
            tracing::info!(strategy = %established.strategy, "chatting");
            session::chat(&mut established.stream, peer.name(), tokio::io::stdin()).await
        }
        None => {
            println!("waiting for incoming peer requests");
            while let Some(offer) = client.next_offer().await? {
                println!(
                    "connection request from {} (local {}, remote {})",
                    offer.name(),
                    offer.local_addr(),
                    offer.remote_addr()
                );
                let mut established = match engine.establish(&offer).await {
                    Ok(established) => established,
                    Err(e) => {
                        tracing::warn!(peer = %offer.name(), error = %e, "hole punch failed");
                        continue;
                    }
                };
                tokio::spawn(async move {
                    if let Err(e) = session::echo(&mut established.stream, offer.name()).await {
                        tracing::warn!(peer = %offer.name(), error = %e, "echo session ended");
                    }
                });
            }
            tracing::info!("negotiator closed the connection");
            Ok(())
        }
    }
}

/// Resolve `host:port` to the first IPv4 address.
async fn resolve_v4(addr: &str) -> Result<SocketAddrV4> {
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("failed to resolve {addr}"))?
        .find_map(|a| match a {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .with_context(|| format!("{addr} has no IPv4 address"))
}
