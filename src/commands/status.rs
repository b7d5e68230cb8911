//! Implementation of the `statelock status` command.
//!
//! Shows whether the configured lock is held, by whom, for how long, and
//! whether the holder has stopped heartbeating.

use crate::context::LockContext;
use crate::error::Result;
use crate::locks::{LockIdentity, LockRecord, format_duration};
use chrono::Utc;
use std::path::Path;

/// Execute the `statelock status` command.
pub fn cmd_status(config_path: Option<&Path>) -> Result<()> {
    let ctx = LockContext::resolve(config_path)?;
    let record = ctx.coordinator("status").inspect(&ctx.identity)?;

    print!("{}", render_status(&ctx.identity, record.as_ref()));
    Ok(())
}

fn render_status(identity: &LockIdentity, record: Option<&LockRecord>) -> String {
    let mut out = format!("Lock:    {}\n", identity);

    let Some(record) = record else {
        out.push_str("State:   free\n");
        return out;
    };

    let heartbeat_age = format_duration(record.heartbeat_age_at(Utc::now()));
    let state = if record.is_stale() {
        "STALE (holder stopped heartbeating; the next acquirer will evict it)"
    } else {
        "held"
    };

    out.push_str(&format!("State:   {}\n", state));
    out.push_str(&format!("Holder:  {}\n", record.holder_description()));
    out.push_str(&format!("Action:  {}\n", record.action));
    out.push_str(&format!(
        "Held:    {} (since {})\n",
        record.age_string(),
        record.acquired_at.to_rfc3339()
    ));
    out.push_str(&format!(
        "Alive:   last heartbeat {} ago, ttl {}s\n",
        heartbeat_age, record.ttl_secs
    ));
    out
}
