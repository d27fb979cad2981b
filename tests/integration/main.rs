//! punch integration test harness.
//!
//! Every test runs an in-process negotiator on a loopback port and talks to
//! it over real TCP sockets, either through the raw framed protocol
//! ([`RawPeer`]) or through [`NegotiatorClient`](punch_services::NegotiatorClient).
//!
//!   cargo test --test integration
//!
//! Each test owns its negotiator; nothing is shared between tests.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use punch_core::frame::{read_message, write_message};
use punch_core::wire::{PeerRecord, Reply, Request};
use punch_services::{Registry, RendezvousServer, SharedRegistry};

mod rendezvous;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for any single protocol step in these tests.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a peer must stay quiet before we call it "nothing relayed".
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// A negotiator running on 127.0.0.1 with an ephemeral port.
pub struct Negotiator {
    pub addr: SocketAddrV4,
    pub registry: SharedRegistry,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl Negotiator {
    pub async fn spawn() -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind test negotiator")?;
        let addr = v4(listener.local_addr()?)?;

        let registry = Registry::shared();
        let (shutdown, _) = broadcast::channel(1);
        let server = RendezvousServer::new(listener, registry.clone(), shutdown.subscribe());
        let task = tokio::spawn(server.run());

        Ok(Self {
            addr,
            registry,
            shutdown,
            task,
        })
    }

    /// Broadcast shutdown and wait for the accept loop to exit.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        tokio::time::timeout(STEP_TIMEOUT, self.task)
            .await
            .context("negotiator did not stop")??
    }
}

/// A peer speaking the framed protocol directly.
pub struct RawPeer {
    pub stream: TcpStream,
    pub local: SocketAddrV4,
}

impl RawPeer {
    pub async fn connect(negotiator: SocketAddrV4) -> Result<Self> {
        let stream = TcpStream::connect(negotiator)
            .await
            .with_context(|| format!("failed to connect to negotiator at {negotiator}"))?;
        let local = v4(stream.local_addr()?)?;
        Ok(Self { stream, local })
    }

    pub async fn send(&mut self, request: &Request) -> Result<()> {
        write_message(&mut self.stream, request).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Reply> {
        let reply = tokio::time::timeout(STEP_TIMEOUT, read_message::<Reply, _>(&mut self.stream))
            .await
            .context("timed out waiting for a reply")??;
        reply.context("negotiator closed the connection")
    }

    /// `None` if nothing arrives within [`QUIET_PERIOD`].
    pub async fn recv_quiet(&mut self) -> Result<Option<Reply>> {
        match tokio::time::timeout(QUIET_PERIOD, read_message::<Reply, _>(&mut self.stream)).await {
            Ok(reply) => Ok(reply?),
            Err(_) => Ok(None),
        }
    }

    pub async fn register(&mut self, name: &str) -> Result<PeerRecord> {
        self.send(&Request::Registration {
            name: name.to_string(),
            local_addr: self.local,
        })
        .await?;
        match self.recv().await? {
            Reply::Peer(record) => Ok(record),
            Reply::Status(status) => bail!("registration answered with status {status}"),
        }
    }

    pub async fn request(&mut self, target: &str, requester: &str) -> Result<Reply> {
        self.send(&Request::Connection {
            target: target.to_string(),
            requester: requester.to_string(),
        })
        .await?;
        self.recv().await
    }
}

pub fn v4(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        other => bail!("expected an IPv4 address, got {other}"),
    }
}

pub fn loopback(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}
