//! Peer side of the negotiator protocol.
//!
//! The client's socket is created with the reuse options so the establishment
//! engine can later bind to the same local port. The connection stays open
//! after registration: the negotiator pushes offers from other peers down it.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use punch_core::frame::{read_message, write_message, FrameError};
use punch_core::wire::{PeerRecord, Reply, Request, Status};

use crate::socket::{connect_reusable, ReusePolicy};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot reach negotiator at {addr}: {source}")]
    Connect { addr: SocketAddrV4, source: io::Error },

    #[error("local address {0} is not IPv4")]
    NotIpv4(SocketAddr),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("negotiator refused: {0}")]
    Rejected(Status),

    #[error("unexpected status from negotiator: {0}")]
    UnexpectedStatus(Status),

    #[error("not registered yet")]
    NotRegistered,

    #[error("negotiator closed the connection")]
    Closed,
}

pub struct NegotiatorClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    local_addr: SocketAddrV4,
    name: Option<String>,
    /// Offers that arrived while waiting for a direct reply.
    pending_offers: VecDeque<PeerRecord>,
}

impl NegotiatorClient {
    pub async fn connect(negotiator: SocketAddrV4) -> Result<Self, ClientError> {
        Self::connect_with(negotiator, ReusePolicy::PUNCH).await
    }

    pub async fn connect_with(
        negotiator: SocketAddrV4,
        policy: ReusePolicy,
    ) -> Result<Self, ClientError> {
        let stream = connect_reusable(0, negotiator, policy)
            .await
            .map_err(|source| ClientError::Connect {
                addr: negotiator,
                source,
            })?;
        let local_addr = match stream.local_addr()? {
            SocketAddr::V4(v4) => v4,
            other => return Err(ClientError::NotIpv4(other)),
        };
        tracing::info!(local = %local_addr, %negotiator, "connected to negotiator");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            local_addr,
            name: None,
            pending_offers: VecDeque::new(),
        })
    }

    /// Private address reported at registration.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Port every hole-punch socket must bind to.
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Register under `name`; returns the record the negotiator stored,
    /// including our public address as it observed it.
    pub async fn register(&mut self, name: &str) -> Result<PeerRecord, ClientError> {
        let request = Request::Registration {
            name: name.to_owned(),
            local_addr: self.local_addr,
        };
        write_message(&mut self.writer, &request).await?;

        loop {
            match self.recv().await? {
                Reply::Peer(record) if record.name() == name => {
                    tracing::info!(%name, public = %record.remote_addr(), "registered");
                    self.name = Some(name.to_owned());
                    return Ok(record);
                }
                Reply::Peer(offer) => self.pending_offers.push_back(offer),
                Reply::Status(status) => return Err(ClientError::UnexpectedStatus(status)),
            }
        }
    }

    /// Ask for `target` using our registered name as the requester.
    pub async fn request_connection(&mut self, target: &str) -> Result<PeerRecord, ClientError> {
        let requester = self.name.clone().ok_or(ClientError::NotRegistered)?;
        self.request_connection_as(target, &requester).await
    }

    /// Ask for `target` on behalf of `requester`, which must be registered.
    pub async fn request_connection_as(
        &mut self,
        target: &str,
        requester: &str,
    ) -> Result<PeerRecord, ClientError> {
        let request = Request::Connection {
            target: target.to_owned(),
            requester: requester.to_owned(),
        };
        write_message(&mut self.writer, &request).await?;

        loop {
            match self.recv().await? {
                Reply::Peer(record) if record.name() == target => return Ok(record),
                Reply::Peer(offer) => self.pending_offers.push_back(offer),
                Reply::Status(status) => {
                    tracing::debug!(%target, %status, "connection request refused");
                    return Err(ClientError::Rejected(status));
                }
            }
        }
    }

    /// Wait for another peer's offer. `Ok(None)` once the negotiator hangs up.
    pub async fn next_offer(&mut self) -> Result<Option<PeerRecord>, ClientError> {
        if let Some(offer) = self.pending_offers.pop_front() {
            return Ok(Some(offer));
        }
        match read_message::<Reply, _>(&mut self.reader).await? {
            Some(Reply::Peer(offer)) => Ok(Some(offer)),
            Some(Reply::Status(status)) => Err(ClientError::UnexpectedStatus(status)),
            None => Ok(None),
        }
    }

    async fn recv(&mut self) -> Result<Reply, ClientError> {
        read_message::<Reply, _>(&mut self.reader)
            .await?
            .ok_or(ClientError::Closed)
    }
}
