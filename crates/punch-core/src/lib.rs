//! punch-core — wire format, framing, and configuration shared by the
//! negotiator and peers. All other punch crates depend on this one.

pub mod config;
pub mod frame;
pub mod wire;

pub use wire::{PeerRecord, Reply, Request, Status, WireError, WireMessage};
