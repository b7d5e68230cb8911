//! Lock store backed by a Consul-compatible key-value HTTP API.
//!
//! Conditional writes map onto the KV check-and-set parameter:
//! - `PUT /v1/kv/{key}?cas=0` creates the key only if it does not exist
//! - `PUT /v1/kv/{key}?cas={ModifyIndex}` replaces it only if unchanged
//! - `DELETE /v1/kv/{key}?cas={ModifyIndex}` deletes it only if unchanged
//!
//! Owner checks read the record and its `ModifyIndex`, compare owners
//! locally, then write with that index. A lost check-and-set means the
//! record changed underneath us, so the check is repeated against the new
//! version.
//!
//! Records read back are reported under this store's identity, whatever
//! address spelling the writer used.

use super::{LockStore, StoreError, StoreResult, storage_key};
use crate::error::{Result, StateLockError};
use crate::locks::identity::LockIdentity;
use crate::locks::record::LockRecord;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Default timeout for KV requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("statelock/", env!("CARGO_PKG_VERSION"));

/// Attempts at a read-check-write cycle before giving up on a busy key.
const CAS_ATTEMPTS: u32 = 5;

/// One entry of a `GET /v1/kv/{key}` response.
#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Lock store talking to `{address}/v1/kv/`.
#[derive(Debug, Clone)]
pub struct ConsulStore {
    base_url: String,
    identity_prefix: String,
    client: Client,
}

impl ConsulStore {
    /// Create a store for the KV API at `address` with the default timeout.
    pub fn new(address: &str) -> Result<Self> {
        Self::with_timeout(address, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(address: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| StateLockError::UserError(format!("failed to build HTTP client: {}", e)))?;

        let base_url = address.trim().trim_end_matches('/').to_string();
        let identity_prefix = format!("consul:{}/", base_url.to_ascii_lowercase());

        Ok(Self {
            base_url,
            identity_prefix,
            client,
        })
    }

    /// KV key for an identity: everything after `consul:{address}/`.
    fn key_for(&self, identity: &str) -> String {
        match identity.strip_prefix(&self.identity_prefix) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => storage_key(&LockIdentity::from_resolved(identity)),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key)
    }

    /// Fetch the record and its modify index, if present.
    fn get(&self, key: &str) -> StoreResult<Option<(LockRecord, u64)>> {
        let url = self.url(key);
        debug!(%url, "GET lock record");
        let response = self.client.get(&url).send().map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, &url)?;

        let entries: Vec<KvEntry> = response
            .json()
            .map_err(|e| StoreError::Unavailable(format!("invalid KV response from {}: {}", url, e)))?;

        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };

        let encoded = entry.value.unwrap_or_default();
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| StoreError::Unavailable(format!("invalid base64 value at {}: {}", url, e)))?;
        let json = String::from_utf8(bytes)
            .map_err(|e| StoreError::Unavailable(format!("non UTF-8 value at {}: {}", url, e)))?;
        let record = LockRecord::from_json(&json)
            .map_err(|e| StoreError::Unavailable(format!("corrupt lock record at {}: {}", url, e)))?;

        Ok(Some((record, entry.modify_index)))
    }

    /// `PUT ?cas={index}`; returns whether the write was applied.
    fn put_cas(&self, key: &str, record: &LockRecord, index: u64) -> StoreResult<bool> {
        let url = self.url(key);
        let body = record
            .to_json()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        debug!(%url, cas = index, "PUT lock record");

        let response = self
            .client
            .put(&url)
            .query(&[("cas", index)])
            .body(body)
            .send()
            .map_err(transport_error)?;
        parse_bool(check_status(response, &url)?, &url)
    }

    /// `DELETE`, with `?cas={index}` when given; returns whether it was applied.
    fn delete(&self, key: &str, index: Option<u64>) -> StoreResult<bool> {
        let url = self.url(key);
        debug!(%url, cas = ?index, "DELETE lock record");

        let mut request = self.client.delete(&url);
        if let Some(index) = index {
            request = request.query(&[("cas", index)]);
        }
        let response = request.send().map_err(transport_error)?;
        parse_bool(check_status(response, &url)?, &url)
    }

    /// Read-check-write loop shared by the owner-conditional primitives.
    ///
    /// `check` validates the current record and returns the replacement
    /// (`Some`) or `None` to delete it.
    fn conditional<F>(&self, identity: &str, mut check: F) -> StoreResult<Option<LockRecord>>
    where
        F: FnMut(&LockRecord) -> StoreResult<Option<LockRecord>>,
    {
        let key = self.key_for(identity);

        for _ in 0..CAS_ATTEMPTS {
            let Some((current, index)) = self.get(&key)? else {
                return Err(StoreError::NotFound);
            };

            let replacement = check(&current)?;
            let applied = match &replacement {
                Some(updated) => self.put_cas(&key, updated, index)?,
                None => self.delete(&key, Some(index))?,
            };
            if applied {
                return Ok(replacement);
            }
            debug!(key = %key, "check-and-set lost a race; re-reading");
        }

        Err(StoreError::Unavailable(format!(
            "key '{}' kept changing during {} check-and-set attempts",
            key, CAS_ATTEMPTS
        )))
    }
}

impl LockStore for ConsulStore {
    fn create_if_absent(&self, record: &LockRecord) -> StoreResult<()> {
        let key = self.key_for(&record.identity);
        if self.put_cas(&key, record, 0)? {
            return Ok(());
        }

        match self.get(&key)? {
            Some((mut existing, _)) => {
                existing.identity = record.identity.clone();
                Err(StoreError::AlreadyLocked(Box::new(existing)))
            }
            None => Err(StoreError::Changed),
        }
    }

    fn update_if_owner(
        &self,
        identity: &LockIdentity,
        owner: &str,
        heartbeat_at: DateTime<Utc>,
    ) -> StoreResult<LockRecord> {
        let updated = self.conditional(identity.as_str(), |current| {
            if current.owner != owner {
                return Err(StoreError::NotOwner {
                    current_owner: current.owner.clone(),
                });
            }
            let mut updated = current.clone();
            updated.last_heartbeat_at = heartbeat_at;
            Ok(Some(updated))
        })?;

        updated.ok_or(StoreError::NotFound)
    }

    fn delete_if_owner(&self, identity: &LockIdentity, owner: &str) -> StoreResult<()> {
        self.conditional(identity.as_str(), |current| {
            if current.owner != owner {
                return Err(StoreError::NotOwner {
                    current_owner: current.owner.clone(),
                });
            }
            Ok(None)
        })
        .map(|_| ())
    }

    fn delete_if_unchanged(&self, expected: &LockRecord) -> StoreResult<()> {
        self.conditional(&expected.identity, |current| {
            if current.owner != expected.owner
                || current.last_heartbeat_at != expected.last_heartbeat_at
            {
                return Err(StoreError::NotOwner {
                    current_owner: current.owner.clone(),
                });
            }
            Ok(None)
        })
        .map(|_| ())
    }

    fn read(&self, identity: &LockIdentity) -> StoreResult<LockRecord> {
        let (mut record, _) = self
            .get(&self.key_for(identity.as_str()))?
            .ok_or(StoreError::NotFound)?;
        record.identity = identity.to_string();
        Ok(record)
    }

    fn delete_unconditionally(&self, identity: &LockIdentity) -> StoreResult<bool> {
        let key = self.key_for(identity.as_str());
        if self.get(&key)?.is_none() {
            return Ok(false);
        }
        self.delete(&key, None)
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(format!("request failed: {}", e))
}

/// Auth failures, throttling and server errors are all "unavailable":
/// none of them says anything about who holds the lock.
fn check_status(response: Response, url: &str) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(StoreError::Unavailable(format!(
            "{} returned HTTP {}",
            url, status
        )))
    }
}

fn parse_bool(response: Response, url: &str) -> StoreResult<bool> {
    let text = response
        .text()
        .map_err(|e| StoreError::Unavailable(format!("invalid KV response from {}: {}", url, e)))?;
    match text.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(StoreError::Unavailable(format!(
            "unexpected KV response from {}: {}",
            url, other
        ))),
    }
}
