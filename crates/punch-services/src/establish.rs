//! Establishment engine — turns a counterparty's PeerRecord into one live
//! TCP stream by racing a passive listener against active dials.
//!
//! Every socket in the race is bound to the same local port, the one the
//! negotiator observed, so the NAT mapping it created is reused. Strategies:
//!
//!   passive        listen on the port, accept the first inbound connection
//!   active-local   dial the counterparty's private address
//!   active-remote  dial the counterparty's observed public address
//!
//! Active strategies start after a short head start for the listener and
//! retry one attempt at a time, each on a fresh socket. The first strategy to
//! produce a stream wins; everything else is cancelled and its sockets are
//! closed before `establish` returns.

use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;

use punch_core::config::EstablishConfig;
use punch_core::wire::PeerRecord;

use crate::socket::{connect_reusable, listen_reusable, ReusePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Passive,
    ActiveLocal,
    ActiveRemote,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Passive => "passive",
            Strategy::ActiveLocal => "active-local",
            Strategy::ActiveRemote => "active-remote",
        })
    }
}

/// The winning connection.
#[derive(Debug)]
pub struct Established {
    pub stream: TcpStream,
    pub strategy: Strategy,
    pub peer_addr: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("cannot listen on port {port}: {source}")]
    Listen { port: u16, source: io::Error },

    #[error("accept failed: {0}")]
    Accept(io::Error),

    #[error("{attempts} attempts to {target} failed, last: {last}")]
    Exhausted {
        target: SocketAddrV4,
        attempts: u32,
        last: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EstablishError {
    #[error("no connection within {0:?}")]
    Timeout(Duration),

    #[error("every strategy failed ({})", summarize(.0))]
    AllStrategiesFailed(Vec<(Strategy, StrategyError)>),
}

fn summarize(failures: &[(Strategy, StrategyError)]) -> String {
    failures
        .iter()
        .map(|(strategy, e)| format!("{strategy}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

type StrategyOutcome = (Strategy, Result<(TcpStream, SocketAddr), StrategyError>);

pub struct Engine {
    local_port: u16,
    config: EstablishConfig,
}

impl Engine {
    /// `local_port` is the port of the socket that registered with the
    /// negotiator.
    pub fn new(local_port: u16, config: EstablishConfig) -> Self {
        Self { local_port, config }
    }

    /// Race all applicable strategies against `peer`.
    pub async fn establish(&self, peer: &PeerRecord) -> Result<Established, EstablishError> {
        let deadline = self.config.timeout();
        tracing::info!(
            peer = %peer.name(),
            local = %peer.local_addr(),
            remote = %peer.remote_addr(),
            port = self.local_port,
            "starting hole punch"
        );

        let mut tasks = self.launch(peer);
        let outcome = tokio::time::timeout(deadline, first_success(&mut tasks)).await;
        // Losers are cancelled and their sockets dropped before we return.
        tasks.shutdown().await;

        match outcome {
            Ok(Ok(established)) => {
                tracing::info!(
                    peer = %peer.name(),
                    strategy = %established.strategy,
                    addr = %established.peer_addr,
                    "direct connection established"
                );
                Ok(established)
            }
            Ok(Err(failures)) => {
                tracing::warn!(peer = %peer.name(), "every strategy failed");
                Err(EstablishError::AllStrategiesFailed(failures))
            }
            Err(_) => {
                tracing::warn!(peer = %peer.name(), ?deadline, "hole punch timed out");
                Err(EstablishError::Timeout(deadline))
            }
        }
    }

    /// Active targets in launch order. The private address is skipped when
    /// disabled, unspecified, or identical to the public one.
    fn active_targets(&self, peer: &PeerRecord) -> Vec<(Strategy, SocketAddrV4)> {
        let mut targets = Vec::with_capacity(2);
        let local = peer.local_addr();
        if self.config.try_local && !local.ip().is_unspecified() && local != peer.remote_addr() {
            targets.push((Strategy::ActiveLocal, local));
        }
        targets.push((Strategy::ActiveRemote, peer.remote_addr()));
        targets
    }

    fn launch(&self, peer: &PeerRecord) -> JoinSet<StrategyOutcome> {
        let mut tasks = JoinSet::new();

        let port = self.local_port;
        let backlog = self.config.listen_backlog;
        let policy = ReusePolicy::PUNCH;
        tasks.spawn(async move { (Strategy::Passive, passive(port, backlog, policy).await) });

        let head_start = self.config.active_start_delay();
        for (strategy, target) in self.active_targets(peer) {
            let config = self.config.clone();
            tasks.spawn(async move {
                tokio::time::sleep(head_start).await;
                (strategy, active(strategy, port, target, &config, policy).await)
            });
        }
        tasks
    }
}

/// Wait for the first strategy to succeed, collecting failures until none
/// are left running.
async fn first_success(
    tasks: &mut JoinSet<StrategyOutcome>,
) -> Result<Established, Vec<(Strategy, StrategyError)>> {
    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((strategy, Ok((stream, peer_addr)))) => {
                return Ok(Established {
                    stream,
                    strategy,
                    peer_addr,
                })
            }
            Ok((strategy, Err(e))) => {
                tracing::debug!(%strategy, error = %e, "strategy failed");
                failures.push((strategy, e));
            }
            Err(e) => tracing::warn!(error = %e, "strategy task aborted"),
        }
    }
    Err(failures)
}

async fn passive(
    port: u16,
    backlog: i32,
    policy: ReusePolicy,
) -> Result<(TcpStream, SocketAddr), StrategyError> {
    let listener = listen_reusable(port, backlog, policy)
        .map_err(|source| StrategyError::Listen { port, source })?;
    tracing::debug!(port, "listening for inbound peer");
    listener.accept().await.map_err(StrategyError::Accept)
}

/// Sequential connect attempts, each on a fresh socket and bounded by
/// `connect_timeout`, with `retry_delay` between a failure and the next
/// attempt. Every attempt uses the same 4-tuple, so only one may be in
/// flight.
async fn active(
    strategy: Strategy,
    port: u16,
    target: SocketAddrV4,
    config: &EstablishConfig,
    policy: ReusePolicy,
) -> Result<(TcpStream, SocketAddr), StrategyError> {
    let attempts = config.connect_retries.max(1);
    let connect_timeout = config.connect_timeout();
    let mut last = None;

    for n in 1..=attempts {
        if n > 1 {
            tokio::time::sleep(config.retry_delay()).await;
        }
        tracing::debug!(%strategy, %target, attempt = n, "dialing");
        match attempt(port, target, connect_timeout, policy).await {
            Ok(stream) => return Ok((stream, SocketAddr::V4(target))),
            Err(e) => {
                tracing::debug!(%strategy, %target, attempt = n, error = %e, "attempt failed");
                last = Some(e);
            }
        }
    }

    let last = last.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no attempt made"));
    Err(StrategyError::Exhausted {
        target,
        attempts,
        last,
    })
}

async fn attempt(
    port: u16,
    target: SocketAddrV4,
    connect_timeout: Duration,
    policy: ReusePolicy,
) -> io::Result<TcpStream> {
    match tokio::time::timeout(connect_timeout, connect_reusable(port, target, policy)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}
