//! Error types for statelock.
//!
//! Uses thiserror for derive macros. Every variant carries enough context
//! (lock identity, current holder) for an operator to decide whether to wait,
//! retry, or explicitly release.

use crate::exit_codes;
use thiserror::Error;

/// Main error type for statelock operations.
#[derive(Error, Debug)]
pub enum StateLockError {
    /// Configuration is missing required fields or names an unknown backend.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid arguments or local I/O problems outside the lock layer.
    #[error("{0}")]
    UserError(String),

    /// The lock stayed held by someone else until the acquire timeout expired.
    #[error("timed out waiting for lock '{identity}', currently held by {holder}")]
    LockTimeout { identity: String, holder: String },

    /// The lock store kept failing while trying to acquire.
    #[error("failed to acquire lock '{identity}': {reason}")]
    LockAcquisition { identity: String, reason: String },

    /// The lock store kept failing while trying to release.
    #[error(
        "failed to release lock '{identity}': {reason}\n\
         The lock may still be held; run `statelock release-lock` once the store is reachable."
    )]
    LockRelease { identity: String, reason: String },

    /// Another process reclaimed the lock while the protected action was running.
    #[error(
        "lock '{identity}' was lost while the command was running.\n\
         Its effects may be partially applied and were not protected by the lock."
    )]
    LockLost { identity: String },

    /// The wrapped command exited unsuccessfully.
    #[error("command '{program}' failed{}", describe_exit_code(.code))]
    Command { program: String, code: Option<i32> },
}

impl StateLockError {
    /// Returns the appropriate exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            StateLockError::Configuration(_) => exit_codes::USER_ERROR,
            StateLockError::UserError(_) => exit_codes::USER_ERROR,
            StateLockError::LockTimeout { .. } => exit_codes::LOCK_FAILURE,
            StateLockError::LockAcquisition { .. } => exit_codes::STORE_FAILURE,
            StateLockError::LockRelease { .. } => exit_codes::STORE_FAILURE,
            StateLockError::LockLost { .. } => exit_codes::LOCK_LOST,
            StateLockError::Command { .. } => exit_codes::COMMAND_FAILURE,
        }
    }
}

fn describe_exit_code(code: &Option<i32>) -> String {
    code.map(|c| format!(" with exit code {}", c))
        .unwrap_or_default()
}

/// Result type alias for statelock operations.
pub type Result<T> = std::result::Result<T, StateLockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_has_correct_exit_code() {
        let err = StateLockError::Configuration("missing state_file_id".to_string());
        assert_eq!(err.exit_code(), exit_codes::USER_ERROR);
    }

    #[test]
    fn lock_timeout_names_the_holder() {
        let err = StateLockError::LockTimeout {
            identity: "file:/locks/state-A".to_string(),
            holder: "host-1:4242:ab12".to_string(),
        };
        assert_eq!(err.exit_code(), exit_codes::LOCK_FAILURE);
        let msg = err.to_string();
        assert!(msg.contains("file:/locks/state-A"));
        assert!(msg.contains("host-1:4242:ab12"));
    }

    #[test]
    fn store_failures_share_exit_code() {
        let acquire = StateLockError::LockAcquisition {
            identity: "x".to_string(),
            reason: "connection refused".to_string(),
        };
        let release = StateLockError::LockRelease {
            identity: "x".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(acquire.exit_code(), exit_codes::STORE_FAILURE);
        assert_eq!(release.exit_code(), exit_codes::STORE_FAILURE);
        assert!(release.to_string().contains("release-lock"));
    }

    #[test]
    fn lock_lost_warns_about_partial_effects() {
        let err = StateLockError::LockLost {
            identity: "state-B".to_string(),
        };
        assert_eq!(err.exit_code(), exit_codes::LOCK_LOST);
        assert!(err.to_string().contains("partially applied"));
    }

    #[test]
    fn command_error_includes_exit_code_when_known() {
        let err = StateLockError::Command {
            program: "terraform".to_string(),
            code: Some(2),
        };
        assert_eq!(err.to_string(), "command 'terraform' failed with exit code 2");
        assert_eq!(err.exit_code(), exit_codes::COMMAND_FAILURE);

        let killed = StateLockError::Command {
            program: "terraform".to_string(),
            code: None,
        };
        assert_eq!(killed.to_string(), "command 'terraform' failed");
    }
}
