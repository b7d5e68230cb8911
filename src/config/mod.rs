//! Configuration model for statelock.
//!
//! This module defines the Config struct that represents `.statelock.yaml`.
//! It supports forward-compatible YAML parsing (unknown fields are ignored),
//! sensible defaults for the lock policy, and validation of config values.

mod model;
mod operations;
pub mod types;


// Re-export public API
pub use model::{Config, LockConfig};
pub use operations::DEFAULT_CONFIG_FILE;
pub use types::{BackendKind, LockPolicy};
