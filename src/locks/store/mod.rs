//! Lock store abstraction.
//!
//! A lock store keeps at most one [`LockRecord`] per identity and offers only
//! conditional mutations: create when absent, update or delete when the
//! caller still owns the record. The mutual-exclusion guarantee of the whole
//! crate rests on these primitives being atomic in the backing store.
//!
//! Backends:
//! - [`FileStore`]: a directory on a filesystem shared by all participants
//! - [`ConsulStore`]: a Consul-compatible key-value HTTP API using check-and-set

mod consul;
mod file;

pub use consul::ConsulStore;
pub use file::FileStore;

use super::identity::LockIdentity;
use super::record::LockRecord;
use crate::config::{BackendKind, Config};
use crate::error::{Result, StateLockError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Failure of a single store primitive.
///
/// Logical conflicts (`AlreadyLocked`, `NotOwner`, `NotFound`, `Changed`) are
/// kept apart from transport problems (`Unavailable`) so callers can retry them
/// differently.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// A record already exists for the identity.
    #[error("lock already held by {}", .0.owner)]
    AlreadyLocked(Box<LockRecord>),

    /// The record exists but belongs to someone else (or has changed).
    #[error("lock is owned by {current_owner}")]
    NotOwner { current_owner: String },

    /// No record exists for the identity.
    #[error("lock record not found")]
    NotFound,

    /// A create found a record that was gone again by the time it was read.
    #[error("lock record changed concurrently")]
    Changed,

    /// The store could not be reached or refused the request.
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Conditional-write key-value store holding lock records.
pub trait LockStore: Send + Sync {
    /// Store `record` only if no record exists for its identity.
    fn create_if_absent(&self, record: &LockRecord) -> StoreResult<()>;

    /// Refresh `last_heartbeat_at` only if `owner` still owns the record.
    fn update_if_owner(
        &self,
        identity: &LockIdentity,
        owner: &str,
        heartbeat_at: DateTime<Utc>,
    ) -> StoreResult<LockRecord>;

    /// Delete the record only if `owner` still owns it.
    fn delete_if_owner(&self, identity: &LockIdentity, owner: &str) -> StoreResult<()>;

    /// Delete the record only if it still has `expected`'s owner and heartbeat.
    ///
    /// Used to evict a stale record without racing other evictors or a
    /// holder that came back to life.
    fn delete_if_unchanged(&self, expected: &LockRecord) -> StoreResult<()>;

    /// Read the current record.
    fn read(&self, identity: &LockIdentity) -> StoreResult<LockRecord>;

    /// Delete the record regardless of owner. Returns whether one existed.
    ///
    /// Only for operator-confirmed release of a lock left by a dead holder.
    fn delete_unconditionally(&self, identity: &LockIdentity) -> StoreResult<bool>;
}

/// Open the store configured in `config.lock`.
pub fn open_store(config: &Config) -> Result<Arc<dyn LockStore>> {
    let lock = &config.lock;
    let backend = BackendKind::from_str(&lock.backend).ok_or_else(|| {
        StateLockError::Configuration(format!("unrecognized lock backend '{}'", lock.backend))
    })?;

    match backend {
        BackendKind::File => {
            let dir = lock.directory.as_deref().ok_or_else(|| {
                StateLockError::Configuration(
                    "lock.directory is required for the 'file' backend".to_string(),
                )
            })?;
            Ok(Arc::new(FileStore::new(dir)))
        }
        BackendKind::Consul => {
            let address = lock.address.as_deref().ok_or_else(|| {
                StateLockError::Configuration(
                    "lock.address is required for the 'consul' backend".to_string(),
                )
            })?;
            Ok(Arc::new(ConsulStore::new(address)?))
        }
    }
}

/// Key under which a backend stores the record for `identity`.
///
/// Everything after the backend location is the `state_file_id` (and, for
/// Consul, the key prefix), which the resolver already restricted to safe
/// characters.
pub(crate) fn storage_key(identity: &LockIdentity) -> String {
    identity
        .as_str()
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}
