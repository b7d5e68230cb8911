//! Diagnostic logging setup.
//!
//! Logs go to stderr so they never mix with Terraform's stdout. `STATELOCK_LOG`
//! takes an `EnvFilter` directive (e.g. `statelock=debug`) and overrides the
//! `-v` flags.

use tracing_subscriber::EnvFilter;

/// Environment variable holding an explicit filter directive.
pub const LOG_ENV: &str = "STATELOCK_LOG";

/// Default filter directive for a `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbosity > 0)
        .try_init();
}
