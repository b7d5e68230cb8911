//! Implementation of `statelock apply`, `statelock destroy` and forwarding.
//!
//! # What a locked run does
//!
//! 1. Loads `.statelock.yaml` and resolves the lock identity
//! 2. Acquires the lock, waiting out live holders and evicting stale ones
//! 3. Runs `terraform <action> ARGS..` while heartbeating the lock
//! 4. Releases the lock, whether Terraform succeeded, failed or was interrupted

use crate::config::Config;
use crate::context::LockContext;
use crate::error::{Result, StateLockError};
use crate::signals::Interrupt;
use crate::terraform::TerraformRunner;
use std::env;
use std::path::Path;

/// Execute a locked Terraform action (`apply` or `destroy`).
pub fn cmd_locked(action: &str, args: Vec<String>, config_path: Option<&Path>) -> Result<()> {
    let ctx = LockContext::resolve(config_path)?;
    let runner = TerraformRunner::from_config(&ctx.config)?;
    let coordinator = ctx.coordinator(action);

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(action.to_string());
    argv.extend(args);

    coordinator.with_lock(&ctx.identity, |scope| {
        // Ctrl+C while waiting for the lock must still terminate immediately.
        let interrupt = Interrupt::install()?;
        runner.run_protected(&argv, scope, &interrupt)
    })
}

/// Forward any other subcommand to Terraform without locking.
pub fn cmd_forward(args: Vec<String>, config_path: Option<&Path>) -> Result<()> {
    let cwd = env::current_dir().map_err(|e| {
        StateLockError::UserError(format!("failed to get current working directory: {}", e))
    })?;
    let config = Config::discover_or_default(config_path, &cwd)?;
    let runner = TerraformRunner::from_config(&config)?;
    let interrupt = Interrupt::install()?;
    runner.run_unlocked(&args, &interrupt)
}
