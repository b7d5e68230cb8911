//! Lock context resolution for statelock commands.
//!
//! Every locking command needs the same three things: the loaded config, the
//! lock identity it resolves to, and an open lock store. This module resolves
//! them once from the working directory and the `--config` flag.

use crate::config::Config;
use crate::error::{Result, StateLockError};
use crate::locks::{
    LockCoordinator, LockIdentity, LockSettings, LockStore, open_store, resolve_identity,
};
use std::env;
use std::path::Path;
use std::sync::Arc;

/// Resolved config, identity and store for one invocation.
pub struct LockContext {
    pub config: Config,
    pub identity: LockIdentity,
    pub store: Arc<dyn LockStore>,
}

impl LockContext {
    /// Resolve the context from the current working directory.
    ///
    /// # Returns
    ///
    /// * `Ok(LockContext)` - Config loaded, identity resolved and store opened
    /// * `Err(StateLockError::Configuration)` - Missing or invalid config (exit code 1)
    pub fn resolve(config_path: Option<&Path>) -> Result<Self> {
        let cwd = env::current_dir().map_err(|e| {
            StateLockError::UserError(format!("failed to get current working directory: {}", e))
        })?;

        Self::resolve_from(config_path, &cwd)
    }

    /// Resolve the context relative to a specific directory.
    pub fn resolve_from(config_path: Option<&Path>, cwd: &Path) -> Result<Self> {
        let config = Config::discover(config_path, cwd)?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let identity = resolve_identity(&config.lock)?;
        let store = open_store(&config)?;
        Ok(Self {
            config,
            identity,
            store,
        })
    }

    /// A coordinator for this invocation, recording `action` in lock records.
    pub fn coordinator(&self, action: &str) -> LockCoordinator {
        LockCoordinator::new(Arc::clone(&self.store), LockSettings::from(&self.config.policy))
            .with_action(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONFIG_FILE;
    use tempfile::TempDir;

    fn write_config(dir: &Path, locks_dir: &Path) {
        let yaml = format!(
            "lock:\n  backend: file\n  state_file_id: prod\n  directory: {}\n",
            locks_dir.display()
        );
        std::fs::write(dir.join(DEFAULT_CONFIG_FILE), yaml).unwrap();
    }

    #[test]
    fn resolves_identity_and_store_from_cwd() {
        let temp = TempDir::new().unwrap();
        let locks = temp.path().join("locks");
        write_config(temp.path(), &locks);

        let ctx = LockContext::resolve_from(None, temp.path()).unwrap();
        assert_eq!(
            ctx.identity.as_str(),
            format!("file:{}/prod", locks.display())
        );
        assert!(matches!(
            ctx.store.read(&ctx.identity),
            Err(crate::locks::StoreError::NotFound)
        ));
    }

    #[test]
    fn coordinator_records_action() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), &temp.path().join("locks"));
        let ctx = LockContext::resolve_from(None, temp.path()).unwrap();

        let handle = ctx
            .coordinator("destroy")
            .acquire(&ctx.identity, std::time::Duration::from_secs(1))
            .unwrap();
        assert_eq!(handle.record().action, "destroy");
    }

    #[cfg(unix)]
    #[test]
    fn hosts_mounting_the_directory_differently_share_the_lock() {
        let temp = TempDir::new().unwrap();
        let locks = temp.path().join("locks");
        let mount = temp.path().join("mnt");
        std::fs::create_dir_all(&locks).unwrap();
        std::os::unix::fs::symlink(&locks, &mount).unwrap();

        let host_a_dir = temp.path().join("host-a");
        let host_b_dir = temp.path().join("host-b");
        std::fs::create_dir_all(&host_a_dir).unwrap();
        std::fs::create_dir_all(&host_b_dir).unwrap();
        write_config(&host_a_dir, &locks);
        write_config(&host_b_dir, &mount);

        let host_a = LockContext::resolve_from(None, &host_a_dir).unwrap();
        let host_b = LockContext::resolve_from(None, &host_b_dir).unwrap();
        let timeout = std::time::Duration::from_millis(200);

        let _held = host_a.coordinator("apply").acquire(&host_a.identity, timeout).unwrap();
        let err = host_b
            .coordinator("apply")
            .acquire(&host_b.identity, timeout)
            .unwrap_err();
        assert!(matches!(err, StateLockError::LockTimeout { .. }));
    }

    #[test]
    fn relative_lock_directory_follows_the_config_file() {
        let temp = TempDir::new().unwrap();
        let infra = temp.path().join("infra");
        std::fs::create_dir_all(&infra).unwrap();
        std::fs::write(
            infra.join("lock.yaml"),
            "lock:\n  backend: file\n  state_file_id: prod\n  directory: locks\n",
        )
        .unwrap();
        let config_path = infra.join("lock.yaml");

        let ctx = LockContext::resolve_from(Some(&config_path), temp.path()).unwrap();
        assert_eq!(
            ctx.identity.as_str(),
            format!("file:{}/prod", infra.join("locks").display())
        );
    }

    #[test]
    fn missing_backend_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(DEFAULT_CONFIG_FILE),
            "lock:\n  state_file_id: prod\n",
        )
        .unwrap();

        let err = LockContext::resolve_from(None, temp.path())
            .err()
            .unwrap();
        assert!(matches!(err, StateLockError::Configuration(_)));
    }
}
