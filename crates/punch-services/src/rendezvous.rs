//! Rendezvous service — the negotiator's accept loop and per-connection
//! request handling.
//!
//! Each accepted connection gets a reader loop and a writer task. The writer
//! drains an unbounded queue of replies; the connection's own answers and
//! offers relayed from other connections both go through that queue, so
//! every frame on the socket is written whole and in queue order.

use std::collections::HashSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use punch_core::frame::{read_message, write_message, FrameError};
use punch_core::wire::{PeerRecord, Reply, Request, Status, WireError};

use crate::registry::{ConnId, RegistryEntry, RelayClosed, RelayHandle, SharedRegistry};

/// Back-off after a failed accept so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("observed address {0} is not IPv4")]
    NotIpv4(SocketAddr),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    WriterClosed(#[from] RelayClosed),
}

pub struct RendezvousServer {
    listener: TcpListener,
    registry: SharedRegistry,
    next_conn_id: AtomicU64,
    shutdown: broadcast::Receiver<()>,
}

impl RendezvousServer {
    pub fn new(
        listener: TcpListener,
        registry: SharedRegistry,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            registry,
            next_conn_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Accept connections until shutdown. Per-connection failures are logged
    /// and never stop the loop.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "negotiator listening");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("negotiator shutting down");
                    return Ok(());
                }

                result = self.listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };

                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(conn = conn_id, peer = %peer_addr, "accepted connection");
                    tokio::spawn(serve_connection(
                        conn_id,
                        stream,
                        peer_addr,
                        self.registry.clone(),
                    ));
                }
            }
        }
    }
}

/// Unwrap IPv4 and IPv4-mapped IPv6 addresses.
fn observed_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port())),
    }
}

async fn serve_connection(
    conn_id: ConnId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: SharedRegistry,
) {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let relay = RelayHandle::new(conn_id, tx);
    let writer_task = tokio::spawn(write_loop(conn_id, writer, rx));

    let mut registered = HashSet::new();
    let result = read_loop(conn_id, reader, peer_addr, &registry, &relay, &mut registered).await;
    match result {
        Ok(()) => tracing::debug!(conn = conn_id, "connection closed by peer"),
        Err(e) => {
            tracing::warn!(conn = conn_id, peer = %peer_addr, error = %e, "connection terminated")
        }
    }

    for name in registered {
        if registry.evict(&name, conn_id).await {
            tracing::info!(conn = conn_id, name = %name, "peer deregistered");
        }
    }

    // The writer exits once every relay handle for this connection is gone.
    drop(relay);
    join_writer(conn_id, writer_task).await;
}

/// Wait for a connection's writer. Returns false if it panicked or was
/// cancelled.
async fn join_writer(conn_id: ConnId, writer_task: JoinHandle<()>) -> bool {
    match writer_task.await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(conn = conn_id, error = %e, "writer task failed");
            false
        }
    }
}

async fn read_loop(
    conn_id: ConnId,
    mut reader: OwnedReadHalf,
    peer_addr: SocketAddr,
    registry: &SharedRegistry,
    relay: &RelayHandle,
    registered: &mut HashSet<String>,
) -> Result<(), ConnectionError> {
    while let Some(request) = read_message::<Request, _>(&mut reader).await? {
        match request {
            Request::Registration { name, local_addr } => {
                let observed =
                    observed_v4(peer_addr).ok_or(ConnectionError::NotIpv4(peer_addr))?;
                let record = PeerRecord::new(name, local_addr, observed)?;
                tracing::info!(
                    conn = conn_id,
                    name = %record.name(),
                    local = %local_addr,
                    remote = %observed,
                    "peer registered"
                );

                registry
                    .insert_or_replace(RegistryEntry {
                        record: record.clone(),
                        relay: relay.clone(),
                    })
                    .await;
                registered.insert(record.name().to_owned());
                relay.send(Reply::Peer(record))?;
            }

            Request::Connection { target, requester } => {
                tracing::debug!(
                    conn = conn_id,
                    target_peer = %target,
                    %requester,
                    "connection request"
                );
                let reply = introduce(registry, &target, &requester).await;
                relay.send(reply)?;
            }
        }
    }
    Ok(())
}

async fn write_loop(
    conn_id: ConnId,
    mut writer: OwnedWriteHalf,
    mut replies: mpsc::UnboundedReceiver<Reply>,
) {
    while let Some(reply) = replies.recv().await {
        if let Err(e) = write_message(&mut writer, &reply).await {
            tracing::warn!(conn = conn_id, error = %e, "write failed, dropping queued replies");
            return;
        }
    }
}

/// Resolve a connection request into the reply for the requester.
///
/// When both names are registered, the requester's record is queued on the
/// target's registration connection before the target's record is returned.
/// A target whose connection has already gone away is evicted and treated as
/// not found.
pub async fn introduce(registry: &SharedRegistry, target: &str, requester: &str) -> Reply {
    let Some(target_entry) = registry.lookup(target).await else {
        return Reply::Status(Status::TargetNotFound);
    };
    let Some(requester_entry) = registry.lookup(requester).await else {
        return Reply::Status(Status::RequesterNotRegistered);
    };

    let offer = Reply::Peer(requester_entry.record);
    if let Err(e) = target_entry.relay.send(offer) {
        tracing::warn!(target_peer = target, error = %e, "target unreachable, evicting");
        registry.evict(target, target_entry.relay.conn_id()).await;
        return Reply::Status(Status::TargetNotFound);
    }

    tracing::info!(target_peer = target, requester, "offer relayed");
    Reply::Peer(target_entry.record)
}
