//! Configuration system for punch.
//!
//! Resolution order: environment variables → config file → defaults.
//! Command-line flags in the binaries override all three.
//!
//! Config file location:
//!   1. $PUNCH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/punch/config.toml
//!   3. ~/.config/punch/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::DEFAULT_NEGOTIATOR_PORT;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PunchConfig {
    pub negotiator: NegotiatorConfig,
    pub peer: PeerConfig,
    pub establish: EstablishConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// Address the negotiator listens on.
    pub listen_addr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Negotiator to register with, `ip:port`. Empty = must be given on the CLI.
    pub negotiator_addr: String,
    /// Name other peers use to reach us. Empty = must be given on the CLI.
    pub name: String,
}

/// Establishment race tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstablishConfig {
    /// Connect attempts per active strategy, each on a fresh socket.
    pub connect_retries: u32,
    /// Delay between launching consecutive attempts.
    pub retry_delay_ms: u64,
    /// Upper bound on a single connect attempt.
    pub connect_timeout_ms: u64,
    /// Head start given to the passive listener before dialing.
    pub active_start_delay_ms: u64,
    /// Overall deadline for the whole race.
    pub timeout_secs: u64,
    /// Also dial the counterparty's private address.
    pub try_local: bool,
    /// Backlog for the passive listener.
    pub listen_backlog: i32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{}", DEFAULT_NEGOTIATOR_PORT),
        }
    }
}

impl Default for EstablishConfig {
    fn default() -> Self {
        Self {
            connect_retries: 3,
            retry_delay_ms: 2_000,
            connect_timeout_ms: 10_000,
            active_start_delay_ms: 1_000,
            timeout_secs: 300,
            try_local: true,
            listen_backlog: 10,
        }
    }
}

impl EstablishConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn active_start_delay(&self) -> Duration {
        Duration::from_millis(self.active_start_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("punch")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PunchConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a config file, or return defaults if it does not exist.
    pub fn load_file(path: &PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(PunchConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PUNCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config to `path` if nothing is there yet.
    pub fn write_default_if_missing(path: &PathBuf) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        let text = toml::to_string_pretty(&PunchConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))
    }

    /// Apply PUNCH_* overrides. `lookup` is `std::env::var` outside tests.
    /// Unparseable numeric values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PUNCH_NEGOTIATOR__LISTEN_ADDR") {
            self.negotiator.listen_addr = v;
        }
        if let Some(v) = lookup("PUNCH_PEER__NEGOTIATOR_ADDR") {
            self.peer.negotiator_addr = v;
        }
        if let Some(v) = lookup("PUNCH_PEER__NAME") {
            self.peer.name = v;
        }
        if let Some(Ok(n)) = lookup("PUNCH_ESTABLISH__CONNECT_RETRIES").map(|v| v.parse()) {
            self.establish.connect_retries = n;
        }
        if let Some(Ok(n)) = lookup("PUNCH_ESTABLISH__RETRY_DELAY_MS").map(|v| v.parse()) {
            self.establish.retry_delay_ms = n;
        }
        if let Some(Ok(n)) = lookup("PUNCH_ESTABLISH__CONNECT_TIMEOUT_MS").map(|v| v.parse()) {
            self.establish.connect_timeout_ms = n;
        }
        if let Some(Ok(n)) = lookup("PUNCH_ESTABLISH__ACTIVE_START_DELAY_MS").map(|v| v.parse()) {
            self.establish.active_start_delay_ms = n;
        }
        if let Some(Ok(n)) = lookup("PUNCH_ESTABLISH__LISTEN_BACKLOG").map(|v| v.parse()) {
            self.establish.listen_backlog = n;
        }
        if let Some(Ok(n)) = lookup("PUNCH_ESTABLISH__TIMEOUT_SECS").map(|v| v.parse()) {
            self.establish.timeout_secs = n;
        }
        if let Some(v) = lookup("PUNCH_ESTABLISH__TRY_LOCAL") {
            self.establish.try_local = v == "true" || v == "1";
        }
    }
}
