//! Lock handle: the in-process proof of holding a lock.

use super::identity::LockIdentity;
use super::record::LockRecord;
use super::store::{LockStore, StoreError};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle of a lock as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Not held (never acquired, or released).
    Idle,
    /// Retrying creation of the lock record.
    Acquiring,
    /// The record exists and belongs to us.
    Held,
    /// Deleting the record.
    Releasing,
    /// Release gave up; the record may still exist.
    Failed,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockState::Idle => "idle",
            LockState::Acquiring => "acquiring",
            LockState::Held => "held",
            LockState::Releasing => "releasing",
            LockState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// RAII handle for an acquired lock.
///
/// Owned by exactly one caller; not `Clone`. Release it through
/// [`LockCoordinator::release`](super::LockCoordinator::release) or let
/// [`LockCoordinator::run_protected`](super::LockCoordinator::run_protected)
/// do it. If the handle is dropped while still held, the record is deleted
/// best-effort (conditionally on ownership) and failures are logged.
pub struct LockHandle {
    identity: LockIdentity,
    record: LockRecord,
    store: Arc<dyn LockStore>,
    state: LockState,
}

impl LockHandle {
    pub(super) fn new(identity: LockIdentity, record: LockRecord, store: Arc<dyn LockStore>) -> Self {
        Self {
            identity,
            record,
            store,
            state: LockState::Held,
        }
    }

    pub fn identity(&self) -> &LockIdentity {
        &self.identity
    }

    pub fn owner(&self) -> &str {
        &self.record.owner
    }

    /// The record as written at acquisition time.
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub(super) fn set_state(&mut self, state: LockState) {
        debug!(identity = %self.identity, from = %self.state, to = %state, "lock state change");
        self.state = state;
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("identity", &self.identity)
            .field("owner", &self.record.owner)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.state == LockState::Idle {
            return;
        }

        match self.store.delete_if_owner(&self.identity, &self.record.owner) {
            Ok(()) => debug!(identity = %self.identity, "released lock on drop"),
            Err(StoreError::NotFound) | Err(StoreError::NotOwner { .. }) => {
                debug!(identity = %self.identity, "lock already gone on drop")
            }
            Err(e) => warn!(
                identity = %self.identity,
                error = %e,
                "failed to release lock on drop; it will expire after its TTL"
            ),
        }
    }
}
