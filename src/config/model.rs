//! Configuration struct definitions.

use super::types::{LockPolicy, default_key_prefix, default_terraform_command};
use serde::{Deserialize, Serialize};

/// Configuration for statelock.
///
/// This struct represents the contents of `.statelock.yaml`.
/// Unknown fields in the YAML are ignored for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which lock to take and where its record lives.
    pub lock: LockConfig,

    /// Timing and retry policy.
    pub policy: LockPolicy,

    /// Command used to run Terraform (split with shell quoting rules).
    #[serde(default = "default_terraform_command")]
    pub terraform_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            policy: LockPolicy::default(),
            terraform_command: default_terraform_command(),
        }
    }
}

/// Lock identity and backend location.
///
/// Which fields are required depends on `backend`; the identity resolver
/// reports anything missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Backend name (`file` or `consul`).
    pub backend: String,

    /// Name of the protected state, shared by everyone working on it.
    pub state_file_id: String,

    /// Lock directory for the `file` backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    /// Base URL of the KV API for the `consul` backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Key prefix for the `consul` backend.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: String::new(),
            state_file_id: String::new(),
            directory: None,
            address: None,
            key_prefix: default_key_prefix(),
        }
    }
}
