//! Heartbeat and lock-loss detection.
//!
//! While a lock is held, a background thread refreshes the record's
//! `last_heartbeat_at` every interval. Other processes judge staleness from
//! that timestamp (see [`LockRecord::is_stale_at`](super::LockRecord::is_stale_at)),
//! so a holder that stops heartbeating becomes evictable after its TTL.
//!
//! If a refresh finds the record owned by someone else (or gone), the lock was
//! evicted and the holder is running unprotected: the shared [`LockLoss`] flag
//! is raised immediately. Transport failures are tolerated for a bounded
//! number of consecutive attempts before the same flag is raised.

use super::identity::LockIdentity;
use super::store::{LockStore, StoreError};
use crate::error::{Result, StateLockError};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Raised once the lock can no longer be assumed held.
#[derive(Debug, Default)]
pub struct LockLoss {
    lost: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl LockLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    pub(crate) fn mark(&self, reason: impl Into<String>) {
        let mut slot = self
            .reason
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.lost.store(true, Ordering::SeqCst);
    }
}

/// View of the lock handed to a protected action.
///
/// Long-running actions poll [`ProtectedScope::check`] between steps and stop
/// as soon as the lock is lost.
#[derive(Debug, Clone)]
pub struct ProtectedScope {
    identity: LockIdentity,
    loss: Arc<LockLoss>,
}

impl ProtectedScope {
    pub(crate) fn new(identity: LockIdentity, loss: Arc<LockLoss>) -> Self {
        Self { identity, loss }
    }

    pub fn identity(&self) -> &LockIdentity {
        &self.identity
    }

    pub fn is_lost(&self) -> bool {
        self.loss.is_lost()
    }

    /// `Err(LockLost)` once the lock has been lost.
    pub fn check(&self) -> Result<()> {
        if self.is_lost() {
            Err(StateLockError::LockLost {
                identity: self.identity.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Running heartbeat thread. Stops when [`Heartbeat::stop`] is called or on drop.
#[derive(Debug)]
pub struct Heartbeat {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Spawn the heartbeat thread for a held lock.
    pub fn start(
        store: Arc<dyn LockStore>,
        identity: LockIdentity,
        owner: String,
        interval: Duration,
        max_misses: u32,
        loss: Arc<LockLoss>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("statelock-heartbeat".to_string())
            .spawn(move || {
                let mut misses = 0u32;
                loop {
                    // Doubles as the interval sleep and the stop signal.
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }

                    match store.update_if_owner(&identity, &owner, Utc::now()) {
                        Ok(_) => {
                            misses = 0;
                            debug!(identity = %identity, "heartbeat refreshed");
                        }
                        Err(StoreError::NotOwner { current_owner }) => {
                            error!(identity = %identity, %current_owner, "lock was taken over by another process");
                            loss.mark(format!("lock was taken over by {}", current_owner));
                            break;
                        }
                        Err(StoreError::NotFound) => {
                            error!(identity = %identity, "lock record disappeared while held");
                            loss.mark("lock record disappeared while held");
                            break;
                        }
                        Err(e) => {
                            misses += 1;
                            warn!(identity = %identity, misses, max_misses, error = %e, "heartbeat failed");
                            if misses > max_misses {
                                error!(identity = %identity, "too many consecutive heartbeat failures");
                                loss.mark(format!(
                                    "{} consecutive heartbeats failed, last error: {}",
                                    misses, e
                                ));
                                break;
                            }
                        }
                    }
                }
            })
            .map_err(|e| {
                StateLockError::UserError(format!("failed to start heartbeat thread: {}", e))
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stop the heartbeat and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("heartbeat thread panicked");
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.shutdown();
    }
}
