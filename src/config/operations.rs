//! Config loading, discovery and validation.

use super::model::Config;
use crate::error::{Result, StateLockError};
use std::path::{Path, PathBuf};

/// File name looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = ".statelock.yaml";

impl Config {
    /// Load config from a YAML file.
    ///
    /// Unknown fields in the YAML are silently ignored for forward compatibility.
    ///
    /// # Returns
    ///
    /// * `Ok(Config)` - Successfully loaded and validated config
    /// * `Err(StateLockError::Configuration)` - Read, parse, or validation failure
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| {
            StateLockError::Configuration(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let mut config = Self::from_yaml(&content)?;
        if let Some(base) = path.parent() {
            config.anchor_paths(base);
        }
        Ok(config)
    }

    /// Resolve a relative `lock.directory` against `base`, the directory
    /// holding the config file.
    pub fn anchor_paths(&mut self, base: &Path) {
        if let Some(dir) = self.lock.directory.as_deref().map(str::trim)
            && !dir.is_empty()
            && Path::new(dir).is_relative()
        {
            self.lock.directory = Some(base.join(dir).to_string_lossy().into_owned());
        }
    }

    /// Load the explicitly requested config file, or `.statelock.yaml` in `cwd`.
    pub fn discover(explicit: Option<&Path>, cwd: &Path) -> Result<Self> {
        let path = Self::resolve_path(explicit, cwd);
        if !path.exists() {
            return Err(StateLockError::Configuration(format!(
                "no config file found at '{}'.\n\
                 Create a {} describing the lock backend, or pass --config <PATH>.",
                path.display(),
                DEFAULT_CONFIG_FILE
            )));
        }
        Self::load(&path)
    }

    /// Like [`Config::discover`], but falls back to defaults when no config
    /// file was requested and none exists in `cwd`.
    pub fn discover_or_default(explicit: Option<&Path>, cwd: &Path) -> Result<Self> {
        if explicit.is_none() && !Self::resolve_path(None, cwd).exists() {
            return Ok(Self::default());
        }
        Self::discover(explicit, cwd)
    }

    fn resolve_path(explicit: Option<&Path>, cwd: &Path) -> PathBuf {
        match explicit {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => cwd.join(p),
            None => cwd.join(DEFAULT_CONFIG_FILE),
        }
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty map.
        let config: Config = if yaml.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|e| {
                StateLockError::Configuration(format!("failed to parse config YAML: {}", e))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate policy values.
    ///
    /// Validation rules:
    /// - `ttl_secs` must be positive
    /// - `heartbeat_interval_secs` must be positive and strictly below `ttl_secs`
    /// - `(max_heartbeat_misses + 1) * heartbeat_interval_secs` must be below
    ///   `ttl_secs`, so a holder notices it lost the lock before others may evict it
    /// - `max_store_retries` must be positive
    /// - `backoff_base_ms` must be positive and not exceed `backoff_max_ms`
    /// - `terraform_command` must name a program
    ///
    /// Lock identity fields are checked by the identity resolver instead.
    pub fn validate(&self) -> Result<()> {
        let policy = &self.policy;

        if policy.ttl_secs == 0 {
            return Err(invalid("policy.ttl_secs must be greater than 0"));
        }

        if policy.heartbeat_interval_secs == 0 {
            return Err(invalid("policy.heartbeat_interval_secs must be greater than 0"));
        }

        if policy.heartbeat_interval_secs >= policy.ttl_secs {
            return Err(StateLockError::Configuration(format!(
                "config validation failed: policy.heartbeat_interval_secs ({}) must be less than policy.ttl_secs ({})",
                policy.heartbeat_interval_secs, policy.ttl_secs
            )));
        }

        let detection_secs = u64::from(policy.max_heartbeat_misses)
            .saturating_add(1)
            .saturating_mul(policy.heartbeat_interval_secs);
        if detection_secs >= policy.ttl_secs {
            return Err(StateLockError::Configuration(format!(
                "config validation failed: (policy.max_heartbeat_misses + 1) * policy.heartbeat_interval_secs ({}s) must be less than policy.ttl_secs ({}s)",
                detection_secs, policy.ttl_secs
            )));
        }

        if policy.max_store_retries == 0 {
            return Err(invalid("policy.max_store_retries must be greater than 0"));
        }

        if policy.backoff_base_ms == 0 {
            return Err(invalid("policy.backoff_base_ms must be greater than 0"));
        }

        if policy.backoff_base_ms > policy.backoff_max_ms {
            return Err(invalid(
                "policy.backoff_base_ms must not exceed policy.backoff_max_ms",
            ));
        }

        if self.terraform_argv()?.is_empty() {
            return Err(invalid("terraform_command must not be empty"));
        }

        Ok(())
    }

    /// Split `terraform_command` into program and leading arguments.
    pub fn terraform_argv(&self) -> Result<Vec<String>> {
        shell_words::split(&self.terraform_command).map_err(|e| {
            StateLockError::Configuration(format!(
                "failed to parse terraform_command '{}': {}\n\
                 Fix: check for unmatched quotes or invalid escape sequences.",
                self.terraform_command, e
            ))
        })
    }
}

fn invalid(msg: &str) -> StateLockError {
    StateLockError::Configuration(format!("config validation failed: {}", msg))
}
