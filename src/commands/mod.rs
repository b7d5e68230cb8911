//! Command implementations for statelock.
//!
//! This module provides the dispatcher that routes CLI commands to their
//! implementations.

mod release_lock;
mod run;
mod status;

use crate::cli::{Cli, Command};
use crate::error::Result;

/// Dispatch a command to its implementation.
///
/// This is the main entry point for command execution. Each command
/// is routed to its handler function.
pub fn dispatch(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Apply(args) => run::cmd_locked("apply", args.args, config_path),
        Command::Destroy(args) => run::cmd_locked("destroy", args.args, config_path),
        Command::ReleaseLock(args) => release_lock::cmd_release_lock(args, config_path),
        Command::Status => status::cmd_status(config_path),
        Command::Other(args) => run::cmd_forward(args, config_path),
    }
}
