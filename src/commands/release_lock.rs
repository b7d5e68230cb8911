//! Implementation of the `statelock release-lock` command.
//!
//! Deletes the lock record regardless of who holds it. This is the operator
//! escape hatch for a lock left behind by a crashed or killed process, so it
//! shows the current holder and asks before deleting anything.

use crate::cli::ReleaseLockArgs;
use crate::context::LockContext;
use crate::error::{Result, StateLockError};
use crate::locks::{ExplicitRelease, LockIdentity, LockRecord};
use std::io::{self, BufRead, Write};
use std::path::Path;

/// Execute the `statelock release-lock` command.
pub fn cmd_release_lock(args: ReleaseLockArgs, config_path: Option<&Path>) -> Result<()> {
    let ctx = LockContext::resolve(config_path)?;
    let coordinator = ctx.coordinator("release-lock");

    let outcome = coordinator.explicit_release(&ctx.identity, |record| {
        if args.yes {
            return Ok(true);
        }
        let stdin = io::stdin();
        confirm(&ctx.identity, record, &mut stdin.lock(), &mut io::stderr())
    })?;

    match outcome {
        ExplicitRelease::Released(record) => {
            println!(
                "Released lock '{}' (was held by {}).",
                ctx.identity,
                record.holder_description()
            );
        }
        ExplicitRelease::NotLocked => {
            println!("Lock '{}' was not held; nothing to release.", ctx.identity);
        }
        ExplicitRelease::Declined => {
            println!("Aborted; lock '{}' left in place.", ctx.identity);
        }
    }
    Ok(())
}

/// Show the current holder and ask for a yes/no answer.
///
/// Only `y` or `yes` (case-insensitive) confirms; anything else, including
/// end of input, declines.
fn confirm<R: BufRead, W: Write>(
    identity: &LockIdentity,
    record: Option<&LockRecord>,
    input: &mut R,
    output: &mut W,
) -> Result<bool> {
    let prompt = match record {
        Some(record) => format!(
            "Lock '{}' is held:\n  {}\nForcibly release it? Only do this if the holder is no longer running. [y/N] ",
            identity, record
        ),
        None => format!("Lock '{}' is not held. Release anyway? [y/N] ", identity),
    };

    output
        .write_all(prompt.as_bytes())
        .and_then(|_| output.flush())
        .map_err(|e| StateLockError::UserError(format!("failed to write prompt: {}", e)))?;

    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .map_err(|e| StateLockError::UserError(format!("failed to read answer: {}", e)))?;

    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}
