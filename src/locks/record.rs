//! Lock record structures and utilities.

use super::identity::LockIdentity;
use crate::error::{Result, StateLockError};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock record persisted in the lock store.
///
/// The presence of a record for an identity is the lock itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// The protected resource (primary key).
    pub identity: String,

    /// Unique owner token of the acquiring process (`host:pid:nonce`).
    pub owner: String,

    /// User that started the acquiring process.
    pub username: String,

    /// Host the acquiring process runs on.
    pub hostname: String,

    /// Process ID of the lock holder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// The command being protected (apply/destroy/etc.).
    pub action: String,

    /// When the lock was acquired (RFC3339).
    pub acquired_at: DateTime<Utc>,

    /// Last liveness refresh by the holder (RFC3339).
    pub last_heartbeat_at: DateTime<Utc>,

    /// Seconds without a heartbeat after which the record is stale.
    pub ttl_secs: u64,
}

impl LockRecord {
    /// Create a fresh record for `owner` with the current timestamp.
    pub fn new(identity: &LockIdentity, owner: &str, action: &str, ttl: std::time::Duration) -> Self {
        let now = Utc::now();
        Self {
            identity: identity.as_str().to_string(),
            owner: owner.to_string(),
            username: current_username(),
            hostname: current_hostname(),
            pid: Some(std::process::id()),
            action: action.to_string(),
            acquired_at: now,
            last_heartbeat_at: now,
            ttl_secs: ttl.as_secs().max(1),
        }
    }

    /// Parse a record from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            StateLockError::UserError(format!("failed to parse lock record: {}", e))
        })
    }

    /// Serialize the record to its JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            StateLockError::UserError(format!("failed to serialize lock record: {}", e))
        })
    }

    pub fn ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX / 1000))
    }

    /// Calculate the age of the lock.
    pub fn age(&self) -> Duration {
        Utc::now().signed_duration_since(self.acquired_at)
    }

    /// Time since the holder last proved it is alive.
    pub fn heartbeat_age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_heartbeat_at)
    }

    /// Whether the holder has stopped heartbeating for longer than the TTL.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.heartbeat_age_at(now) > self.ttl()
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    /// Format the age as a human-readable string.
    pub fn age_string(&self) -> String {
        format_duration(self.age())
    }

    /// Short description of the holder for diagnostics.
    pub fn holder_description(&self) -> String {
        match self.pid {
            Some(pid) => format!("{}@{} (pid {}, owner {})", self.username, self.hostname, pid, self.owner),
            None => format!("{}@{} (owner {})", self.username, self.hostname, self.owner),
        }
    }
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (holder: {}, age: {}, last heartbeat: {} ago, action: {}{})",
            self.identity,
            self.holder_description(),
            self.age_string(),
            format_duration(self.heartbeat_age_at(Utc::now())),
            self.action,
            if self.is_stale() { ", STALE" } else { "" }
        )
    }
}

/// Format a duration as `Xd Yh`, `Xh Ym`, `Xm` or `Xs`.
pub(crate) fn format_duration(age: Duration) -> String {
    let seconds = age.num_seconds().max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}d {}h", days, hours % 24)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes % 60)
    } else if minutes > 0 {
        format!("{}m", minutes)
    } else {
        format!("{}s", seconds)
    }
}

/// Generate a unique owner token for this process: `host:pid:nonce`.
///
/// The nonce keeps two coordinators in the same process (or a recycled pid)
/// from ever sharing ownership.
pub fn generate_owner_id() -> String {
    let nonce: u64 = rand::thread_rng().r#gen();
    format!("{}:{}:{:016x}", current_hostname(), std::process::id(), nonce)
}

fn current_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn current_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
