//! Interrupt handling for the wrapped command.
//!
//! Ctrl+C and SIGTERM raise a shared flag instead of terminating the process,
//! so the runner can wait for Terraform to stop and the lock can still be
//! released on the way out. The flag remembers which signal came first: the
//! terminal already delivers Ctrl+C to Terraform, a SIGTERM sent to us does not.

use crate::error::{Result, StateLockError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use tracing::{debug, warn};

const NOT_RAISED: u8 = 0;
const CTRL_C: u8 = 1;
const TERMINATE: u8 = 2;

/// Signal that asked us to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// Ctrl+C (SIGINT), normally delivered to the whole foreground process group.
    CtrlC,
    /// SIGTERM, sent to statelock alone (CI cancellation, service managers).
    Terminate,
}

/// Shared "stop requested" flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicU8>,
}

impl Interrupt {
    /// A flag that is only raised through [`Interrupt::raise`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Install Ctrl+C / SIGTERM handlers that raise the returned flag.
    ///
    /// The handlers run on a dedicated thread with a single-threaded tokio
    /// runtime. Once installed they stay installed for the life of the
    /// process.
    pub fn install() -> Result<Self> {
        let interrupt = Self::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                StateLockError::UserError(format!("failed to start signal handler: {}", e))
            })?;

        let flag = interrupt.clone();
        thread::Builder::new()
            .name("statelock-signals".to_string())
            .spawn(move || runtime.block_on(listen(flag)))
            .map_err(|e| {
                StateLockError::UserError(format!("failed to start signal handler: {}", e))
            })?;

        Ok(interrupt)
    }

    /// Raise the flag. Only the first signal is recorded.
    pub fn raise(&self, kind: InterruptKind) {
        let value = match kind {
            InterruptKind::CtrlC => CTRL_C,
            InterruptKind::Terminate => TERMINATE,
        };
        let _ = self
            .raised
            .compare_exchange(NOT_RAISED, value, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.kind().is_some()
    }

    pub fn kind(&self) -> Option<InterruptKind> {
        match self.raised.load(Ordering::SeqCst) {
            CTRL_C => Some(InterruptKind::CtrlC),
            TERMINATE => Some(InterruptKind::Terminate),
            _ => None,
        }
    }
}

async fn listen(interrupt: Interrupt) {
    #[cfg(unix)]
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                None
            }
        };

    loop {
        #[cfg(unix)]
        let terminated = async {
            match terminate.as_mut() {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        let kind = tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                    return;
                }
                debug!("received Ctrl+C");
                InterruptKind::CtrlC
            }
            _ = terminated => {
                debug!("received SIGTERM");
                InterruptKind::Terminate
            }
        };

        if interrupt.is_raised() {
            warn!("already stopping; waiting for the command to exit");
        } else {
            warn!("interrupt received; stopping the command");
        }
        interrupt.raise(kind);
    }
}
