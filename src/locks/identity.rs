//! Lock identity resolution.
//!
//! Two invocations against the same logical state must race for the same
//! lock, so resolution is a pure function of the configuration: no I/O, no
//! clock, no environment lookups.

use crate::config::{BackendKind, LockConfig};
use crate::error::{Result, StateLockError};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static SEGMENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/-]+$").expect("valid identity segment regex"));

/// Key naming the protected resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockIdentity(String);

impl LockIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an already-resolved identity string (as read back from a store).
    pub(crate) fn from_resolved(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for LockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the lock identity from the lock section of the configuration.
///
/// # Returns
///
/// * `Ok(LockIdentity)` - `<backend>:<location>/<state_file_id>`
/// * `Err(StateLockError::Configuration)` - Unknown backend, missing or malformed fields
pub fn resolve_identity(config: &LockConfig) -> Result<LockIdentity> {
    if config.backend.trim().is_empty() {
        return Err(StateLockError::Configuration(
            "lock.backend is required (one of: file, consul)".to_string(),
        ));
    }

    let backend = BackendKind::from_str(&config.backend).ok_or_else(|| {
        StateLockError::Configuration(format!(
            "unrecognized lock backend '{}' (expected one of: file, consul)",
            config.backend
        ))
    })?;

    let state_file_id = segment("lock.state_file_id", Some(&config.state_file_id))?;

    let location = match backend {
        BackendKind::File => {
            let dir = required("lock.directory", config.directory.as_deref(), backend)?;
            normalize_directory(dir)
        }
        BackendKind::Consul => {
            let address = required("lock.address", config.address.as_deref(), backend)?;
            let prefix = if config.key_prefix.trim().is_empty() {
                "statelock".to_string()
            } else {
                segment("lock.key_prefix", Some(&config.key_prefix))?
            };
            format!("{}/{}", normalize_address(address), prefix.trim_matches('/'))
        }
    };

    Ok(LockIdentity(format!(
        "{}:{}/{}",
        backend.as_str(),
        location,
        state_file_id.trim_matches('/')
    )))
}

fn required<'a>(field: &str, value: Option<&'a str>, backend: BackendKind) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(StateLockError::Configuration(format!(
            "{} is required for the '{}' backend",
            field,
            backend.as_str()
        ))),
    }
}

fn segment(field: &str, value: Option<&str>) -> Result<String> {
    let value = value.map(str::trim).unwrap_or_default();
    if value.is_empty() {
        return Err(StateLockError::Configuration(format!("{} is required", field)));
    }
    if !SEGMENT_PATTERN.is_match(value) {
        return Err(StateLockError::Configuration(format!(
            "{} '{}' may only contain letters, digits, '.', '_', '-' and '/'",
            field, value
        )));
    }
    Ok(value.to_string())
}

/// Identity prefix shared by every state file locked in `dir`.
pub(crate) fn file_identity_prefix(dir: &str) -> String {
    format!("{}:{}/", BackendKind::File.as_str(), normalize_directory(dir.trim()))
}

fn normalize_directory(dir: &str) -> String {
    let trimmed = dir.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        // The filesystem root.
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_address(address: &str) -> String {
    address.trim_end_matches('/').to_ascii_lowercase()
}
