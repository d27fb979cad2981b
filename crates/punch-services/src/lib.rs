//! punch-services — negotiator and peer runtime pieces.
//!
//! The negotiator runs [`RendezvousServer`] over a [`Registry`]; a peer uses
//! [`NegotiatorClient`] to register and request introductions, then hands the
//! counterparty's record to an [`Engine`] to punch a direct connection.

pub mod client;
pub mod establish;
pub mod registry;
pub mod rendezvous;
pub mod socket;

pub use client::{ClientError, NegotiatorClient};
pub use establish::{Engine, EstablishError, Established, Strategy, StrategyError};
pub use registry::{ConnId, Registry, RegistryEntry, RelayHandle, SharedRegistry};
pub use rendezvous::{introduce, ConnectionError, RendezvousServer};
pub use socket::{bind_reusable, connect_reusable, listen_reusable, ReusePolicy};
