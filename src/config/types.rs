//! Configuration type definitions and default values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backend that stores lock records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// A directory on a filesystem shared by every participant.
    File,
    /// A Consul-compatible key-value HTTP API.
    Consul,
}

impl BackendKind {
    /// Parse a backend name (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Some(Self::File),
            "consul" => Some(Self::Consul),
            _ => None,
        }
    }

    /// Canonical backend name, used as the identity prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::File => "file",
            BackendKind::Consul => "consul",
        }
    }
}

/// Timing and retry policy for acquiring, holding and releasing locks.
///
/// The default TTL spans ten heartbeat intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    /// Seconds without a heartbeat after which a lock record is stale.
    pub ttl_secs: u64,

    /// Seconds between heartbeats while a lock is held. Must be below `ttl_secs`.
    pub heartbeat_interval_secs: u64,

    /// Seconds to keep retrying a contended lock before giving up.
    pub acquire_timeout_secs: u64,

    /// Consecutive store failures tolerated during acquire or release.
    pub max_store_retries: u32,

    /// Consecutive failed heartbeats tolerated before the lock counts as lost.
    pub max_heartbeat_misses: u32,

    /// First backoff delay in milliseconds.
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            heartbeat_interval_secs: 30,
            acquire_timeout_secs: 3600,
            max_store_retries: 5,
            max_heartbeat_misses: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 30_000,
        }
    }
}

impl LockPolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

pub(super) fn default_terraform_command() -> String {
    "terraform".to_string()
}

pub(super) fn default_key_prefix() -> String {
    "statelock".to_string()
}
