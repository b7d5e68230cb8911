//! Terraform subprocess runner.
//!
//! Spawns the configured Terraform command with inherited stdio and polls it
//! until it exits. A protected run also watches the lock and kills the child
//! as soon as the lock is lost.
//!
//! On an interrupt Terraform gets [`INTERRUPT_GRACE`] to stop on its own. A
//! SIGTERM is forwarded to it first; Ctrl+C already reached it through the
//! terminal, and a second SIGINT would make Terraform abort without cleanup.

use crate::config::Config;
use crate::error::{Result, StateLockError};
use crate::locks::ProtectedScope;
use crate::signals::{Interrupt, InterruptKind};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time Terraform gets to stop on its own after an interrupt.
const INTERRUPT_GRACE: Duration = Duration::from_secs(30);

/// How a supervised child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Exited(Option<i32>),
    KilledLockLost,
    KilledInterrupted,
}

/// Runs Terraform (or whatever `terraform_command` names).
#[derive(Debug, Clone)]
pub struct TerraformRunner {
    argv: Vec<String>,
    interrupt_grace: Duration,
}

impl TerraformRunner {
    /// `argv` is the program followed by any leading arguments.
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(StateLockError::Configuration(
                "terraform_command must not be empty".to_string(),
            ));
        }
        Ok(Self {
            argv,
            interrupt_grace: INTERRUPT_GRACE,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.terraform_argv()?)
    }

    #[cfg(test)]
    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    fn program(&self) -> &str {
        &self.argv[0]
    }

    /// Run `args` while holding a lock; the child is killed if the lock is lost.
    pub fn run_protected(
        &self,
        args: &[String],
        scope: &ProtectedScope,
        interrupt: &Interrupt,
    ) -> Result<()> {
        let mut child = self.spawn(args)?;
        let exit = self.supervise(&mut child, || scope.is_lost(), interrupt)?;
        match exit {
            Exit::KilledLockLost => {
                error!(identity = %scope.identity(), "lock lost; terraform was stopped");
                scope.check()
            }
            other => self.finish(other),
        }
    }

    /// Run `args` without any lock.
    pub fn run_unlocked(&self, args: &[String], interrupt: &Interrupt) -> Result<()> {
        let mut child = self.spawn(args)?;
        let exit = self.supervise(&mut child, || false, interrupt)?;
        self.finish(exit)
    }

    fn spawn(&self, args: &[String]) -> Result<Child> {
        info!(program = self.program(), args = ?args, "running terraform");
        Command::new(self.program())
            .args(&self.argv[1..])
            .args(args)
            .spawn()
            .map_err(|e| {
                StateLockError::UserError(format!(
                    "failed to execute '{}': {}\n\
                     Fix: ensure the command is installed and in PATH, or set terraform_command.",
                    self.program(),
                    e
                ))
            })
    }

    fn finish(&self, exit: Exit) -> Result<()> {
        match exit {
            Exit::Exited(Some(0)) => Ok(()),
            Exit::Exited(code) => Err(StateLockError::Command {
                program: self.program().to_string(),
                code,
            }),
            Exit::KilledInterrupted => Err(StateLockError::UserError(format!(
                "'{}' was interrupted",
                self.program()
            ))),
            Exit::KilledLockLost => Err(StateLockError::UserError(format!(
                "'{}' was stopped",
                self.program()
            ))),
        }
    }

    /// Poll the child until it exits, the lock is lost, or the interrupt
    /// grace period runs out.
    fn supervise(
        &self,
        child: &mut Child,
        lock_lost: impl Fn() -> bool,
        interrupt: &Interrupt,
    ) -> Result<Exit> {
        let mut interrupted_at: Option<Instant> = None;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(code = ?status.code(), "terraform exited");
                    return Ok(Exit::Exited(status.code()));
                }
                Ok(None) => {
                    if lock_lost() {
                        kill_process(child);
                        return Ok(Exit::KilledLockLost);
                    }

                    if let Some(kind) = interrupt.kind() {
                        let since = *interrupted_at.get_or_insert_with(|| {
                            if kind == InterruptKind::Terminate {
                                forward_terminate(child);
                            }
                            Instant::now()
                        });
                        if since.elapsed() >= self.interrupt_grace {
                            warn!(program = self.program(), "terraform did not stop; killing it");
                            kill_process(child);
                            return Ok(Exit::KilledInterrupted);
                        }
                    }

                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(StateLockError::UserError(format!(
                        "failed to check process status: {}",
                        e
                    )));
                }
            }
        }
    }
}

/// Ask the child to stop the way we were asked to.
#[cfg(unix)]
fn forward_terminate(child: &Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    info!(pid, "forwarding SIGTERM to terraform");
    // SAFETY: `pid` is our own child, which has not been reaped yet.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "failed to forward SIGTERM");
    }
}

#[cfg(not(unix))]
fn forward_terminate(_child: &Child) {}

/// Kill a process and wait for it to terminate.
fn kill_process(child: &mut Child) {
    // On Unix this is SIGKILL; on Windows it is TerminateProcess.
    let _ = child.kill();
    let _ = child.wait();
}
