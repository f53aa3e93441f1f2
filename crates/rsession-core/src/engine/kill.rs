//! Hard termination of engine processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use crate::error::KillError;

/// Terminates an OS process by id.
///
/// Implementations must treat an already-gone process as success.
pub trait ProcessKiller: Send + Sync {
    fn kill(&self, pid: u32) -> Result<(), KillError>;
}

/// Platform termination.
///
/// Unix sends `SIGTERM`, waits `grace`, then sends `SIGKILL`, because not
/// every engine build honors the first signal. Windows has no signal
/// delivery, so `taskkill /F` is run and its exit code checked.
#[derive(Debug, Clone)]
pub struct SystemKiller {
    grace: Duration,
}

impl SystemKiller {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

impl Default for SystemKiller {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[cfg(unix)]
impl ProcessKiller for SystemKiller {
    fn kill(&self, pid: u32) -> Result<(), KillError> {
        let target = libc::pid_t::try_from(pid).map_err(|_| KillError::Signal {
            pid,
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        })?;

        if !send_signal(pid, target, libc::SIGTERM)? {
            return Ok(());
        }
        std::thread::sleep(self.grace);
        send_signal(pid, target, libc::SIGKILL)?;
        Ok(())
    }
}

/// Returns `Ok(false)` when the process no longer exists.
#[cfg(unix)]
fn send_signal(pid: u32, target: libc::pid_t, signal: libc::c_int) -> Result<bool, KillError> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(target, signal) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(KillError::Signal { pid, source: err })
    }
}

#[cfg(windows)]
impl ProcessKiller for SystemKiller {
    fn kill(&self, pid: u32) -> Result<(), KillError> {
        use std::process::Command;

        // taskkill exit code for "process not found"
        const NOT_FOUND: i32 = 128;

        let output = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .output()
            .map_err(|source| KillError::Spawn {
                command: "taskkill".to_string(),
                source,
            })?;

        match output.status.code() {
            Some(0) | Some(NOT_FOUND) => Ok(()),
            _ => Err(KillError::Command {
                command: "taskkill".to_string(),
                pid,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

/// Thread-safe, idempotent kill handle for one engine process.
///
/// Holds the pid separately from the connection so another thread can
/// sever an in-flight round trip without waiting for it.
#[derive(Clone)]
pub struct KillSwitch {
    inner: Arc<KillState>,
}

struct KillState {
    pid: AtomicI32,
    killed: AtomicBool,
    killer: Arc<dyn ProcessKiller>,
}

impl KillSwitch {
    /// A switch with no pid yet; firing it is a no-op until armed.
    pub fn new(killer: Arc<dyn ProcessKiller>) -> Self {
        Self {
            inner: Arc::new(KillState {
                pid: AtomicI32::new(-1),
                killed: AtomicBool::new(false),
                killer,
            }),
        }
    }

    /// Record the pid to terminate.
    pub fn arm(&self, pid: i32) {
        self.inner.pid.store(pid, Ordering::SeqCst);
    }

    /// The armed pid, or -1.
    pub fn pid(&self) -> i32 {
        self.inner.pid.load(Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    /// Terminate the process. Later calls after a success are no-ops.
    pub fn fire(&self) -> Result<(), KillError> {
        let pid = self.pid();
        if pid < 0 {
            return Ok(());
        }
        if self.inner.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.inner.killer.kill(pid as u32) {
            Ok(()) => {
                tracing::debug!("terminated R instance with pid {}", pid);
                Ok(())
            }
            Err(e) => {
                // Allow another attempt.
                self.inner.killed.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}
