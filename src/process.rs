//! Supervised OS processes.
//!
//! [`ManagedProcess`] is the seam between the lifecycle logic (supervisor
//! restarts, push timeouts) and real child processes, so that logic can be
//! exercised against scripted processes in tests.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::errors::{SandboxError, SandboxResult};

/// A child process with an observable exit status.
///
/// Exit codes follow the shell convention used throughout the runtime: the
/// process's own exit code, or `-signo` when it was terminated by a signal.
#[async_trait]
pub trait ManagedProcess: Send {
    /// OS process id, if the process has not been reaped yet.
    fn id(&self) -> Option<u32>;

    /// Non-blocking status check: `None` while the process is running.
    fn exit_code(&mut self) -> Option<i32>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> io::Result<i32>;

    /// Ask the process to exit (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit (SIGKILL).
    fn kill(&mut self) -> io::Result<()>;
}

/// Map an [`ExitStatus`] to an exit code, using `-signo` for signals.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| -signo))
        .unwrap_or(-1)
}

/// A [`ManagedProcess`] backed by a tokio child.
pub struct TokioProcess {
    name: String,
    child: Child,
    exit: Option<i32>,
}

impl TokioProcess {
    /// Spawn `command`. The child is killed if the handle is dropped while it
    /// is still running.
    pub fn spawn(name: impl Into<String>, mut command: Command) -> SandboxResult<Self> {
        let name = name.into();
        let child = command
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                program: name.clone(),
                source,
            })?;
        debug!(process = %name, pid = ?child.id(), "Spawned process");
        Ok(Self::from_child(name, child))
    }

    pub fn from_child(name: impl Into<String>, child: Child) -> Self {
        Self {
            name: name.into(),
            child,
            exit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

#[async_trait]
impl ManagedProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn exit_code(&mut self) -> Option<i32> {
        if self.exit.is_some() {
            return self.exit;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(exit_code_of(status));
                self.exit
            }
            Ok(None) => None,
            Err(e) => {
                warn!(process = %self.name, error = %e, "Failed to poll process status");
                None
            }
        }
    }

    async fn wait(&mut self) -> io::Result<i32> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        let code = exit_code_of(self.child.wait().await?);
        self.exit = Some(code);
        Ok(code)
    }

    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        self.child.start_kill()
    }
}

/// Terminate `process`, escalating to a kill if it does not exit within
/// `grace`. Returns the final exit code once the process has been reaped.
pub async fn stop_process(process: &mut dyn ManagedProcess, grace: Duration) -> io::Result<i32> {
    if let Some(code) = process.exit_code() {
        return Ok(code);
    }
    if let Err(e) = process.terminate() {
        warn!(pid = ?process.id(), error = %e, "Failed to send SIGTERM");
    }
    match tokio::time::timeout(grace, process.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                pid = ?process.id(),
                grace_secs = grace.as_secs_f64(),
                "Process ignored SIGTERM, killing"
            );
            process.kill()?;
            process.wait().await
        }
    }
}

/// Kills the guarded process on drop unless it has been reaped.
///
/// Every path out of a scope holding the guard (early return, `?`, a dropped
/// future) leaves no running child behind.
pub struct ProcessGuard<'a> {
    process: &'a mut dyn ManagedProcess,
    armed: bool,
}

impl<'a> ProcessGuard<'a> {
    pub fn new(process: &'a mut dyn ManagedProcess) -> Self {
        Self {
            process,
            armed: true,
        }
    }

    /// Wait for a natural exit. Disarms the guard once the process is reaped.
    pub async fn wait(&mut self) -> io::Result<i32> {
        let code = self.process.wait().await?;
        self.armed = false;
        Ok(code)
    }

    /// Terminate with a grace period, then kill. Disarms the guard once the
    /// process is reaped.
    pub async fn stop(&mut self, grace: Duration) -> io::Result<i32> {
        let code = stop_process(&mut *self.process, grace).await?;
        self.armed = false;
        Ok(code)
    }
}

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.process.kill() {
            warn!(pid = ?self.process.id(), error = %e, "Failed to kill guarded process");
        }
    }
}
