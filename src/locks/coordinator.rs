//! Lock coordinator: acquire, protect, release.
//!
//! A coordinator represents one participant. It owns a unique owner token,
//! so two coordinators in the same process behave like two processes.

use super::backoff::Backoff;
use super::handle::{LockHandle, LockState};
use super::heartbeat::{Heartbeat, LockLoss, ProtectedScope};
use super::identity::LockIdentity;
use super::record::{LockRecord, format_duration, generate_owner_id};
use super::store::{LockStore, StoreError, StoreResult};
use crate::config::LockPolicy;
use crate::error::{Result, StateLockError};
use chrono::Utc;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Timing knobs used by a coordinator, at full `Duration` resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub ttl: Duration,
    pub heartbeat_interval: Duration,
    pub acquire_timeout: Duration,
    pub max_store_retries: u32,
    pub max_heartbeat_misses: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl From<&LockPolicy> for LockSettings {
    fn from(policy: &LockPolicy) -> Self {
        Self {
            ttl: policy.ttl(),
            heartbeat_interval: policy.heartbeat_interval(),
            acquire_timeout: policy.acquire_timeout(),
            max_store_retries: policy.max_store_retries,
            max_heartbeat_misses: policy.max_heartbeat_misses,
            backoff_base: policy.backoff_base(),
            backoff_max: policy.backoff_max(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::from(&LockPolicy::default())
    }
}

impl LockSettings {
    /// Heartbeat interval, shortened so that every tolerated miss plus the
    /// final one still fits inside the TTL.
    pub(crate) fn effective_heartbeat_interval(&self) -> Duration {
        let attempts = self.max_heartbeat_misses.saturating_add(1);
        let fits = self
            .heartbeat_interval
            .checked_mul(attempts)
            .is_some_and(|detection| detection < self.ttl);

        if self.heartbeat_interval.is_zero() || !fits {
            (self.ttl / attempts.saturating_add(1)).max(Duration::from_millis(1))
        } else {
            self.heartbeat_interval
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_max)
    }
}

/// How a release ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Our record was deleted.
    Released,
    /// The record was already gone or belonged to someone else (it was
    /// evicted as stale). Nothing left to release.
    NotHeld { current_owner: Option<String> },
}

/// Result of an operator-confirmed release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExplicitRelease {
    /// The record shown to the operator was deleted.
    Released(Box<LockRecord>),
    /// There was no record to delete.
    NotLocked,
    /// The operator answered "no".
    Declined,
}

/// Steps of the acquire state machine.
enum AcquireStep {
    TryCreate,
    Inspect(LockRecord),
    Reclaim(LockRecord),
    Wait,
}

/// Why the last acquire attempt did not succeed, for the timeout error.
enum Blocker {
    Holder(String),
    Store(String),
}

/// Coordinates acquisition and release of locks in one lock store.
pub struct LockCoordinator {
    store: Arc<dyn LockStore>,
    settings: LockSettings,
    owner: String,
    action: String,
}

impl LockCoordinator {
    /// Create a coordinator with a freshly generated owner token.
    pub fn new(store: Arc<dyn LockStore>, settings: LockSettings) -> Self {
        Self {
            store,
            settings,
            owner: generate_owner_id(),
            action: "lock".to_string(),
        }
    }

    /// Record `action` (e.g. `apply`) in lock records for diagnostics.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Acquire the lock for `identity`, waiting up to `timeout`.
    ///
    /// Live holders are waited out with jittered exponential backoff.
    /// Stale holders (no heartbeat within their TTL) are evicted with a
    /// conditional delete, so concurrent evictors cannot both succeed.
    ///
    /// # Returns
    ///
    /// * `Ok(LockHandle)` - The lock is held
    /// * `Err(StateLockError::LockTimeout)` - Still held by someone else at the deadline
    /// * `Err(StateLockError::LockAcquisition)` - The store kept failing
    pub fn acquire(&self, identity: &LockIdentity, timeout: Duration) -> Result<LockHandle> {
        let deadline = Instant::now() + timeout;
        let mut backoff = self.settings.backoff();
        let mut store_failures = 0u32;
        let mut blocker: Option<Blocker> = None;
        let mut reported_holder: Option<String> = None;
        let mut step = AcquireStep::TryCreate;

        info!(identity = %identity, owner = %self.owner, state = %LockState::Acquiring, "acquiring lock");

        loop {
            step = match step {
                AcquireStep::TryCreate => {
                    let record =
                        LockRecord::new(identity, &self.owner, &self.action, self.settings.ttl);
                    match self.store.create_if_absent(&record) {
                        Ok(()) => {
                            info!(identity = %identity, state = %LockState::Held, "lock acquired");
                            return Ok(LockHandle::new(
                                identity.clone(),
                                record,
                                Arc::clone(&self.store),
                            ));
                        }
                        Err(StoreError::AlreadyLocked(existing)) => {
                            store_failures = 0;
                            AcquireStep::Inspect(*existing)
                        }
                        Err(StoreError::Changed) => {
                            debug!(identity = %identity, "lock record vanished before it could be read");
                            if Instant::now() < deadline {
                                AcquireStep::TryCreate
                            } else {
                                AcquireStep::Wait
                            }
                        }
                        Err(e) => {
                            self.note_store_failure(identity, &mut store_failures, &e)?;
                            blocker = Some(Blocker::Store(e.to_string()));
                            AcquireStep::Wait
                        }
                    }
                }
                AcquireStep::Inspect(existing) => {
                    if existing.is_stale_at(Utc::now()) {
                        AcquireStep::Reclaim(existing)
                    } else {
                        let holder = existing.holder_description();
                        if reported_holder.as_deref() != Some(holder.as_str()) {
                            info!(
                                identity = %identity,
                                holder = %holder,
                                action = %existing.action,
                                age = %existing.age_string(),
                                "lock is held by another process; waiting"
                            );
                            reported_holder = Some(holder.clone());
                            // A new holder starts a new wait.
                            backoff.reset();
                        }
                        blocker = Some(Blocker::Holder(holder));
                        AcquireStep::Wait
                    }
                }
                AcquireStep::Reclaim(stale) => {
                    warn!(
                        identity = %identity,
                        holder = %stale.holder_description(),
                        last_heartbeat = %format_duration(stale.heartbeat_age_at(Utc::now())),
                        "evicting stale lock"
                    );
                    match self.store.delete_if_unchanged(&stale) {
                        // Evicted, or someone else evicted it first: race to create.
                        Ok(()) | Err(StoreError::NotFound) => AcquireStep::TryCreate,
                        Err(StoreError::NotOwner { current_owner }) => {
                            debug!(identity = %identity, %current_owner, "lost eviction race");
                            blocker = Some(Blocker::Holder(current_owner));
                            AcquireStep::Wait
                        }
                        Err(e) => {
                            self.note_store_failure(identity, &mut store_failures, &e)?;
                            blocker = Some(Blocker::Store(e.to_string()));
                            AcquireStep::Wait
                        }
                    }
                }
                AcquireStep::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.timeout_error(identity, blocker.take()));
                    }
                    let delay = backoff.next_delay().min(deadline - now);
                    debug!(
                        identity = %identity,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "backing off"
                    );
                    thread::sleep(delay);
                    AcquireStep::TryCreate
                }
            };
        }
    }

    fn note_store_failure(
        &self,
        identity: &LockIdentity,
        failures: &mut u32,
        error: &StoreError,
    ) -> Result<()> {
        *failures += 1;
        if *failures > self.settings.max_store_retries {
            error!(identity = %identity, state = %LockState::Failed, error = %error, "giving up on lock store");
            return Err(StateLockError::LockAcquisition {
                identity: identity.to_string(),
                reason: format!("{} (after {} attempts)", error, failures),
            });
        }
        warn!(identity = %identity, attempt = *failures, error = %error, "lock store error; retrying");
        Ok(())
    }

    fn timeout_error(&self, identity: &LockIdentity, blocker: Option<Blocker>) -> StateLockError {
        error!(identity = %identity, state = %LockState::Failed, "timed out acquiring lock");
        match blocker {
            Some(Blocker::Store(reason)) => StateLockError::LockAcquisition {
                identity: identity.to_string(),
                reason: format!("timed out while the lock store was failing: {}", reason),
            },
            Some(Blocker::Holder(holder)) => StateLockError::LockTimeout {
                identity: identity.to_string(),
                holder,
            },
            None => StateLockError::LockTimeout {
                identity: identity.to_string(),
                holder: "unknown".to_string(),
            },
        }
    }

    /// Release a held lock.
    ///
    /// A record that is already gone or owned by someone else means our lock
    /// was evicted as stale; that is reported as [`ReleaseOutcome::NotHeld`]
    /// and logged, not raised. Store failures are retried with backoff.
    pub fn release(&self, handle: &mut LockHandle) -> Result<ReleaseOutcome> {
        if handle.state() == LockState::Idle {
            return Ok(ReleaseOutcome::NotHeld {
                current_owner: None,
            });
        }

        handle.set_state(LockState::Releasing);
        let identity = handle.identity().clone();
        let owner = handle.owner().to_string();

        let result = self.with_store_retries(&identity, "release", || {
            self.store.delete_if_owner(&identity, &owner)
        });

        match result {
            Ok(()) => {
                handle.set_state(LockState::Idle);
                info!(identity = %identity, held_for = %handle.record().age_string(), "lock released");
                Ok(ReleaseOutcome::Released)
            }
            Err(StoreError::NotFound) => {
                handle.set_state(LockState::Idle);
                warn!(identity = %identity, "lock record was already gone; nothing to release");
                Ok(ReleaseOutcome::NotHeld {
                    current_owner: None,
                })
            }
            Err(StoreError::NotOwner { current_owner }) => {
                handle.set_state(LockState::Idle);
                warn!(
                    identity = %identity,
                    %current_owner,
                    "lock was taken over by another process; nothing to release"
                );
                Ok(ReleaseOutcome::NotHeld {
                    current_owner: Some(current_owner),
                })
            }
            Err(e) => {
                handle.set_state(LockState::Failed);
                error!(identity = %identity, error = %e, "failed to release lock");
                Err(StateLockError::LockRelease {
                    identity: identity.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Run `action` while holding `handle`, then release it.
    ///
    /// The heartbeat runs for the duration of the action. Release is
    /// attempted on every exit path: success, error and panic (the panic is
    /// resumed after release). If the lock was lost while the action ran,
    /// the result is [`StateLockError::LockLost`] regardless of what the
    /// action returned.
    pub fn run_protected<T, F>(&self, mut handle: LockHandle, action: F) -> Result<T>
    where
        F: FnOnce(&ProtectedScope) -> Result<T>,
    {
        let identity = handle.identity().clone();
        let loss = Arc::new(LockLoss::new());

        let owner = handle.owner().to_string();
        let heartbeat = self.start_heartbeat_or_release(&mut handle, || {
            Heartbeat::start(
                Arc::clone(&self.store),
                identity.clone(),
                owner,
                self.settings.effective_heartbeat_interval(),
                self.settings.max_heartbeat_misses,
                Arc::clone(&loss),
            )
        })?;

        let scope = ProtectedScope::new(identity.clone(), Arc::clone(&loss));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| action(&scope)));

        heartbeat.stop();
        let released = self.release(&mut handle);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(payload) => {
                if let Err(e) = &released {
                    error!(error = %e, "failed to release lock after panic");
                }
                panic::resume_unwind(payload);
            }
        };

        if loss.is_lost() {
            error!(
                identity = %identity,
                reason = %loss.reason().unwrap_or_default(),
                "lock was lost while the protected action ran"
            );
            return Err(StateLockError::LockLost {
                identity: identity.to_string(),
            });
        }

        match (outcome, released) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(release_err)) => {
                error!(error = %release_err, "failed to release lock after action failure");
                Err(e)
            }
        }
    }

    /// Run `start`; if it fails the lock is released before the error is returned.
    pub(super) fn start_heartbeat_or_release(
        &self,
        handle: &mut LockHandle,
        start: impl FnOnce() -> Result<Heartbeat>,
    ) -> Result<Heartbeat> {
        start().inspect_err(|e| {
            error!(identity = %handle.identity(), error = %e, "failed to start heartbeat");
            if let Err(release_err) = self.release(handle) {
                error!(error = %release_err, "failed to release lock after heartbeat start failure");
            }
        })
    }

    /// Acquire `identity` with the configured timeout and run `action` under it.
    pub fn with_lock<T, F>(&self, identity: &LockIdentity, action: F) -> Result<T>
    where
        F: FnOnce(&ProtectedScope) -> Result<T>,
    {
        let handle = self.acquire(identity, self.settings.acquire_timeout)?;
        self.run_protected(handle, action)
    }

    /// Operator override: delete the lock regardless of who holds it.
    ///
    /// The current record (or `None`) is passed to `confirm`; only a `true`
    /// answer deletes. Meant for clearing locks left by crashed holders.
    pub fn explicit_release<C>(&self, identity: &LockIdentity, confirm: C) -> Result<ExplicitRelease>
    where
        C: FnOnce(Option<&LockRecord>) -> Result<bool>,
    {
        let current = match self.with_store_retries(identity, "read", || self.store.read(identity)) {
            Ok(record) => Some(record),
            Err(StoreError::NotFound) => None,
            Err(e) => {
                return Err(StateLockError::LockRelease {
                    identity: identity.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        if !confirm(current.as_ref())? {
            info!(identity = %identity, "explicit release declined");
            return Ok(ExplicitRelease::Declined);
        }

        let deleted = self
            .with_store_retries(identity, "force release", || {
                self.store.delete_unconditionally(identity)
            })
            .map_err(|e| StateLockError::LockRelease {
                identity: identity.to_string(),
                reason: e.to_string(),
            })?;

        match (deleted, current) {
            (true, Some(record)) => {
                warn!(identity = %identity, holder = %record.holder_description(), "lock forcibly released");
                Ok(ExplicitRelease::Released(Box::new(record)))
            }
            (true, None) => {
                // Appeared between the read and the delete.
                warn!(identity = %identity, "lock forcibly released");
                Ok(ExplicitRelease::NotLocked)
            }
            (false, _) => {
                info!(identity = %identity, "no lock to release");
                Ok(ExplicitRelease::NotLocked)
            }
        }
    }

    /// Current record for `identity`, if any.
    pub fn inspect(&self, identity: &LockIdentity) -> Result<Option<LockRecord>> {
        match self.with_store_retries(identity, "read", || self.store.read(identity)) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(StateLockError::UserError(format!(
                "failed to read lock '{}': {}",
                identity, e
            ))),
        }
    }

    /// Run `op`, retrying `Unavailable` up to `max_store_retries` times.
    fn with_store_retries<T>(
        &self,
        identity: &LockIdentity,
        what: &str,
        mut op: impl FnMut() -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut backoff = self.settings.backoff();
        let mut failures = 0u32;
        loop {
            match op() {
                Err(StoreError::Unavailable(reason)) if failures < self.settings.max_store_retries => {
                    failures += 1;
                    warn!(identity = %identity, operation = what, attempt = failures, error = %reason, "lock store error; retrying");
                    thread::sleep(backoff.next_delay());
                }
                other => return other,
            }
        }
    }
}
