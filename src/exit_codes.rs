//! Exit code constants for the statelock CLI.
//!
//! - 0: Success
//! - 1: User error (bad args, invalid configuration)
//! - 2: Wrapped command failure (Terraform exited non-zero)
//! - 3: Lock store failure (store unreachable during acquire/release)
//! - 4: Lock acquisition failure (timed out waiting for the holder)
//! - 5: Lock lost while the protected command was running

/// Successful execution.
pub const SUCCESS: i32 = 0;

/// User error: bad arguments or invalid configuration.
pub const USER_ERROR: i32 = 1;

/// The wrapped command ran and failed.
pub const COMMAND_FAILURE: i32 = 2;

/// The lock store could not be reached or kept failing.
pub const STORE_FAILURE: i32 = 3;

/// The lock is held by someone else and the wait timed out.
pub const LOCK_FAILURE: i32 = 4;

/// The lock was lost while the protected command was running.
pub const LOCK_LOST: i32 = 5;
