//! Distributed mutual exclusion over a shared state file.
//!
//! Every participant that wants to mutate a state file first creates a lock
//! record for the file's [`LockIdentity`] in a shared [`LockStore`]. The
//! store only offers conditional writes, so at most one record (and thus one
//! holder) exists per identity at any moment.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Acquiring -> Held -> Releasing -> Idle
//!                   \-> Failed (timeout / store down)
//!                               Releasing -> Failed (release gave up)
//! ```
//!
//! While held, a heartbeat refreshes the record so that other participants
//! can tell a live holder from a crashed one. A record whose heartbeat is
//! older than its TTL is stale and may be evicted by the next acquirer.
//!
//! # Example
//!
//! ```ignore
//! let coordinator = LockCoordinator::new(store, LockSettings::from(&config.policy));
//! coordinator.with_lock(&identity, |scope| {
//!     run_terraform(scope)
//! })?;
//! ```

mod backoff;
mod coordinator;
mod handle;
mod heartbeat;
mod identity;
mod record;
mod store;


pub use backoff::Backoff;
pub use coordinator::{ExplicitRelease, LockCoordinator, LockSettings, ReleaseOutcome};
pub use handle::{LockHandle, LockState};
pub use heartbeat::{Heartbeat, LockLoss, ProtectedScope};
pub use identity::{LockIdentity, resolve_identity};
pub use record::{LockRecord, generate_owner_id};
pub(crate) use record::format_duration;
pub use store::{ConsulStore, FileStore, LockStore, StoreError, StoreResult, open_store};
