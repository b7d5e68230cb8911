use crate::locks::{LockIdentity, LockRecord, LockStore, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

static CWD_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

pub(crate) struct DirGuard {
    original: PathBuf,
    _lock: MutexGuard<'static, ()>,
}

impl DirGuard {
    pub(crate) fn new(new_dir: &Path) -> Self {
        // Changing the process current working directory is global and not thread-safe.
        // Lock it so tests don't race even if a #[serial] annotation is missed.
        let lock = CWD_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(new_dir).unwrap();
        Self {
            original,
            _lock: lock,
        }
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.original);
    }
}

/// Strongly consistent in-process store: every primitive runs under one mutex.
#[derive(Debug, Default)]
pub(crate) struct InMemoryStore {
    records: Mutex<HashMap<String, LockRecord>>,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, LockRecord>> {
        self.records.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Insert or overwrite a record, bypassing all conditions (test setup only).
    pub(crate) fn put(&self, record: LockRecord) {
        self.records().insert(record.identity.clone(), record);
    }
}

impl LockStore for InMemoryStore {
    fn create_if_absent(&self, record: &LockRecord) -> StoreResult<()> {
        let mut records = self.records();
        if let Some(existing) = records.get(&record.identity) {
            return Err(StoreError::AlreadyLocked(Box::new(existing.clone())));
        }
        records.insert(record.identity.clone(), record.clone());
        Ok(())
    }

    fn update_if_owner(
        &self,
        identity: &LockIdentity,
        owner: &str,
        heartbeat_at: DateTime<Utc>,
    ) -> StoreResult<LockRecord> {
        let mut records = self.records();
        let record = records
            .get_mut(identity.as_str())
            .ok_or(StoreError::NotFound)?;
        if record.owner != owner {
            return Err(StoreError::NotOwner {
                current_owner: record.owner.clone(),
            });
        }
        record.last_heartbeat_at = heartbeat_at;
        Ok(record.clone())
    }

    fn delete_if_owner(&self, identity: &LockIdentity, owner: &str) -> StoreResult<()> {
        let mut records = self.records();
        let record = records.get(identity.as_str()).ok_or(StoreError::NotFound)?;
        if record.owner != owner {
            return Err(StoreError::NotOwner {
                current_owner: record.owner.clone(),
            });
        }
        records.remove(identity.as_str());
        Ok(())
    }

    fn delete_if_unchanged(&self, expected: &LockRecord) -> StoreResult<()> {
        let mut records = self.records();
        let record = records
            .get(&expected.identity)
            .ok_or(StoreError::NotFound)?;
        if record.owner != expected.owner || record.last_heartbeat_at != expected.last_heartbeat_at
        {
            return Err(StoreError::NotOwner {
                current_owner: record.owner.clone(),
            });
        }
        records.remove(&expected.identity);
        Ok(())
    }

    fn read(&self, identity: &LockIdentity) -> StoreResult<LockRecord> {
        self.records()
            .get(identity.as_str())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn delete_unconditionally(&self, identity: &LockIdentity) -> StoreResult<bool> {
        Ok(self.records().remove(identity.as_str()).is_some())
    }
}

/// Wraps a store and fails chosen primitives with `Unavailable`.
pub(crate) struct FlakyStore {
    inner: Arc<dyn LockStore>,
    failing_creates: AtomicUsize,
    churning_creates: AtomicUsize,
    create_calls: AtomicUsize,
    failing_updates: AtomicUsize,
    failing_deletes: AtomicUsize,
    update_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new(inner: Arc<dyn LockStore>) -> Self {
        Self {
            inner,
            failing_creates: AtomicUsize::new(0),
            churning_creates: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            failing_updates: AtomicUsize::new(0),
            failing_deletes: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_next_creates(&self, n: usize) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    /// The next `n` creates report a record that vanished before it was read.
    pub(crate) fn churn_next_creates(&self, n: usize) {
        self.churning_creates.store(n, Ordering::SeqCst);
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    pub(crate) fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn should_fail(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn unavailable() -> StoreError {
    StoreError::Unavailable("injected failure".to_string())
}

impl LockStore for FlakyStore {
    fn create_if_absent(&self, record: &LockRecord) -> StoreResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if Self::should_fail(&self.churning_creates) {
            return Err(StoreError::Changed);
        }
        if Self::should_fail(&self.failing_creates) {
            return Err(unavailable());
        }
        self.inner.create_if_absent(record)
    }

    fn update_if_owner(
        &self,
        identity: &LockIdentity,
        owner: &str,
        heartbeat_at: DateTime<Utc>,
    ) -> StoreResult<LockRecord> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if Self::should_fail(&self.failing_updates) {
            return Err(unavailable());
        }
        self.inner.update_if_owner(identity, owner, heartbeat_at)
    }

    fn delete_if_owner(&self, identity: &LockIdentity, owner: &str) -> StoreResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if Self::should_fail(&self.failing_deletes) {
            return Err(unavailable());
        }
        self.inner.delete_if_owner(identity, owner)
    }

    fn delete_if_unchanged(&self, expected: &LockRecord) -> StoreResult<()> {
        self.inner.delete_if_unchanged(expected)
    }

    fn read(&self, identity: &LockIdentity) -> StoreResult<LockRecord> {
        self.inner.read(identity)
    }

    fn delete_unconditionally(&self, identity: &LockIdentity) -> StoreResult<bool> {
        self.inner.delete_unconditionally(identity)
    }
}
