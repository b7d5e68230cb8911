//! Lock store backed by a shared directory.
//!
//! # Layout
//!
//! Records are named after the `state_file_id` alone, so hosts that mount
//! the shared directory at different paths still meet on the same file.
//! `/` in a state file id is written as `%2F`. For each state file the
//! directory holds:
//! - `{key}.lock.json`: the lock record (its presence is the lock)
//! - `{key}.lock.guard`: short-lived mutation guard, present only while a
//!   conditional update or delete is in progress
//! - `{key}.lock.break`: present only while an abandoned guard is broken
//! - `.{key}.{nonce}.tmp`: temporary files, renamed or linked into place
//!
//! Records read back are reported under this store's identity, whatever
//! path the writer used for the directory.
//!
//! # Atomicity
//!
//! - Create writes the record to a temporary file, syncs it, then
//!   `hard_link`s it to the record path. Linking fails if the record already
//!   exists, so exactly one creator wins and readers never see a partial record.
//! - Conditional update and delete take the mutation guard (exclusive create),
//!   re-read the record, check the precondition and then rename or remove.
//! - A guard older than [`GUARD_STALE_AFTER`] belongs to a crashed process.
//!   It is only removed by the holder of the break file, after checking it is
//!   still abandoned, so two breakers can never remove each other's fresh guard.
//!
//! The directory must live on a filesystem that supports hard links and
//! exclusive create (local disks, NFSv3+ and SMB all do).

use super::{LockStore, StoreError, StoreResult, storage_key};
use crate::locks::identity::{LockIdentity, file_identity_prefix};
use crate::locks::record::LockRecord;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Age after which a mutation guard is considered abandoned.
pub const GUARD_STALE_AFTER: Duration = Duration::from_secs(10);

/// How long to wait for another process's mutation guard.
const GUARD_WAIT: Duration = Duration::from_secs(5);

const GUARD_POLL: Duration = Duration::from_millis(10);

/// Lock store keeping one JSON file per lock in a shared directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
    identity_prefix: String,
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        let identity_prefix = file_identity_prefix(&directory.to_string_lossy());
        Self {
            directory,
            identity_prefix,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File name stem for an identity: its `state_file_id`.
    fn key_for(&self, identity: &str) -> String {
        match identity.strip_prefix(&self.identity_prefix) {
            Some(id) if !id.is_empty() => id.replace('/', "%2F"),
            _ => storage_key(&LockIdentity::from_resolved(identity)),
        }
    }

    fn record_path(&self, identity: &str) -> PathBuf {
        self.directory.join(format!("{}.lock.json", self.key_for(identity)))
    }

    fn guard_path(&self, identity: &str) -> PathBuf {
        self.directory.join(format!("{}.lock.guard", self.key_for(identity)))
    }

    fn break_path(&self, identity: &str) -> PathBuf {
        self.directory.join(format!("{}.lock.break", self.key_for(identity)))
    }

    fn temp_path(&self, identity: &str) -> PathBuf {
        let key = self.key_for(identity);
        let nonce: u64 = rand::thread_rng().r#gen();
        self.directory.join(format!(".{}.{:016x}.tmp", key, nonce))
    }

    fn ensure_directory(&self) -> StoreResult<()> {
        if !self.directory.exists() {
            fs::create_dir_all(&self.directory).map_err(|e| {
                io_unavailable(
                    format!("failed to create lock directory '{}'", self.directory.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    /// Read the record at `path`, reported under `identity`.
    fn read_path(&self, path: &Path, identity: &str) -> StoreResult<LockRecord> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => {
                return Err(io_unavailable(
                    format!("failed to read lock record '{}'", path.display()),
                    e,
                ));
            }
        };

        let mut record = LockRecord::from_json(&content).map_err(|e| {
            StoreError::Unavailable(format!(
                "corrupt lock record '{}': {}",
                path.display(),
                e
            ))
        })?;
        record.identity = identity.to_string();
        Ok(record)
    }

    /// Write `record` to a fresh synced temporary file and return its path.
    fn write_temp(&self, record: &LockRecord) -> StoreResult<PathBuf> {
        let temp_path = self.temp_path(&record.identity);
        let json = record
            .to_json()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let result = File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(json.as_bytes())?;
                file.sync_all()
            });

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(io_unavailable(
                format!("failed to write temporary file '{}'", temp_path.display()),
                e,
            ));
        }

        Ok(temp_path)
    }

    /// Take the mutation guard for `identity`, waiting out other holders.
    fn lock_mutations(&self, identity: &str) -> StoreResult<MutationGuard> {
        self.ensure_directory()?;
        let path = self.guard_path(identity);
        let deadline = Instant::now() + GUARD_WAIT;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(MutationGuard { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_abandoned(&path) && self.break_guard(identity)? {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::Unavailable(format!(
                            "timed out waiting for mutation guard '{}'",
                            path.display()
                        )));
                    }
                    std::thread::sleep(GUARD_POLL);
                }
                Err(e) => {
                    return Err(io_unavailable(
                        format!("failed to create mutation guard '{}'", path.display()),
                        e,
                    ));
                }
            }
        }
    }

    /// Remove an abandoned mutation guard while holding the break file.
    ///
    /// Returns `false` when another process is breaking it or it turned out
    /// to be live.
    fn break_guard(&self, identity: &str) -> StoreResult<bool> {
        let guard = self.guard_path(identity);
        let breaker = self.break_path(identity);

        match OpenOptions::new().write(true).create_new(true).open(&breaker) {
            Ok(_) => {
                let _breaker = MutationGuard { path: breaker };
                if !is_abandoned(&guard) {
                    return Ok(false);
                }
                warn!(guard = %guard.display(), "breaking abandoned mutation guard");
                match fs::remove_file(&guard) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
                    Err(e) => Err(io_unavailable(
                        format!("failed to remove mutation guard '{}'", guard.display()),
                        e,
                    )),
                }
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Left behind by a process that crashed while breaking a guard.
                if is_abandoned(&breaker) {
                    warn!(breaker = %breaker.display(), "removing abandoned break file");
                    let _ = fs::remove_file(&breaker);
                }
                Ok(false)
            }
            Err(e) => Err(io_unavailable(
                format!("failed to create break file '{}'", breaker.display()),
                e,
            )),
        }
    }
}

impl LockStore for FileStore {
    fn create_if_absent(&self, record: &LockRecord) -> StoreResult<()> {
        self.ensure_directory()?;
        let record_path = self.record_path(&record.identity);
        let temp_path = self.write_temp(record)?;

        let linked = fs::hard_link(&temp_path, &record_path);
        let _ = fs::remove_file(&temp_path);

        match linked {
            Ok(()) => {
                debug!(path = %record_path.display(), "created lock record");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match self.read_path(&record_path, &record.identity) {
                    Ok(existing) => Err(StoreError::AlreadyLocked(Box::new(existing))),
                    // Deleted between our link attempt and the read.
                    Err(StoreError::NotFound) => Err(StoreError::Changed),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(io_unavailable(
                format!("failed to create lock record '{}'", record_path.display()),
                e,
            )),
        }
    }

    fn update_if_owner(
        &self,
        identity: &LockIdentity,
        owner: &str,
        heartbeat_at: DateTime<Utc>,
    ) -> StoreResult<LockRecord> {
        let _guard = self.lock_mutations(identity.as_str())?;
        let record_path = self.record_path(identity.as_str());

        let mut record = self.read_path(&record_path, identity.as_str())?;
        if record.owner != owner {
            return Err(StoreError::NotOwner {
                current_owner: record.owner,
            });
        }

        record.last_heartbeat_at = heartbeat_at;
        let temp_path = self.write_temp(&record)?;
        fs::rename(&temp_path, &record_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            io_unavailable(
                format!("failed to replace lock record '{}'", record_path.display()),
                e,
            )
        })?;

        Ok(record)
    }

    fn delete_if_owner(&self, identity: &LockIdentity, owner: &str) -> StoreResult<()> {
        let _guard = self.lock_mutations(identity.as_str())?;
        let record_path = self.record_path(identity.as_str());

        let record = self.read_path(&record_path, identity.as_str())?;
        if record.owner != owner {
            return Err(StoreError::NotOwner {
                current_owner: record.owner,
            });
        }

        remove_record(&record_path)
    }

    fn delete_if_unchanged(&self, expected: &LockRecord) -> StoreResult<()> {
        let _guard = self.lock_mutations(&expected.identity)?;
        let record_path = self.record_path(&expected.identity);

        let record = self.read_path(&record_path, &expected.identity)?;
        if record.owner != expected.owner || record.last_heartbeat_at != expected.last_heartbeat_at
        {
            return Err(StoreError::NotOwner {
                current_owner: record.owner,
            });
        }

        remove_record(&record_path)
    }

    fn read(&self, identity: &LockIdentity) -> StoreResult<LockRecord> {
        self.read_path(&self.record_path(identity.as_str()), identity.as_str())
    }

    fn delete_unconditionally(&self, identity: &LockIdentity) -> StoreResult<bool> {
        let _guard = self.lock_mutations(identity.as_str())?;
        match remove_record(&self.record_path(identity.as_str())) {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// RAII guard for a mutation guard file.
///
/// When dropped, the guard file is deleted. If deletion fails, a warning is
/// logged; the guard goes stale and is broken by the next mutation.
#[derive(Debug)]
struct MutationGuard {
    path: PathBuf,
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(guard = %self.path.display(), error = %e, "failed to remove mutation guard");
        }
    }
}

fn is_abandoned(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| {
            SystemTime::now()
                .duration_since(modified)
                .map(|age| age > GUARD_STALE_AFTER)
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

fn remove_record(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound),
        Err(e) => Err(io_unavailable(
            format!("failed to remove lock record '{}'", path.display()),
            e,
        )),
    }
}

fn io_unavailable(context: String, e: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", context, e))
}
