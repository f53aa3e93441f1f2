//! Engine instances: connections, processes, handles, termination.
//!
//! # Architecture
//!
//! ```text
//! EngineProcessHandle
//!     │
//!     ├── Box<dyn EngineConnection>   raw eval / assign / collect round trips
//!     │
//!     ├── Box<dyn EngineProcess>      the OS child, when this process launched it
//!     │
//!     └── KillSwitch                  pid + ProcessKiller, usable from any thread
//!             │
//!             ├── unix:    SIGTERM, grace period, SIGKILL
//!             └── windows: taskkill /PID <pid> /F
//! ```

mod diagnostics;
mod handle;
mod kill;
mod launcher;

use std::fmt;
use std::path::PathBuf;
use std::process::Child;

pub use diagnostics::{DiagnosticsGate, MuteGuard};
pub use handle::{EngineProcessHandle, RetryPolicy};
pub use kill::{KillSwitch, ProcessKiller, SystemKiller};
pub use launcher::{
    EngineLauncher, LaunchRole, LoopbackPortProber, PortProber, TOKEN_VAR, WorkerLauncher,
};

use crate::error::EngineFault;
use crate::ipc::Value;

/// Opaque per-instance credentials, checked in the connection handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(String);

impl Credentials {
    /// Fresh random credentials.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(..)")
    }
}

/// Where and how to reach one engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConnectionConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub work_dir: PathBuf,
}

impl EngineConnectionConfig {
    /// Same host, credentials and working directory on another port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A worker started by a master instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnedWorker {
    pub port: u16,
    pub pid: u32,
}

/// Raw round trips with one engine instance.
///
/// Every call is a single blocking request/response exchange. Implementations
/// are not expected to be reentrant; callers serialize access.
pub trait EngineConnection: Send {
    /// Evaluate engine source text.
    fn eval(&mut self, code: &str) -> Result<Value, EngineFault>;

    /// Bind `value` to `name` in the global environment.
    fn assign(&mut self, name: &str, value: Value) -> Result<(), EngineFault>;

    /// Fetch the value bound to `name`.
    fn collect(&mut self, name: &str) -> Result<Value, EngineFault>;

    /// Ask the engine for its own process id.
    fn query_pid(&mut self) -> Result<i32, EngineFault> {
        let value = self.eval("Sys.getpid()")?;
        value.as_i32().ok_or_else(|| {
            EngineFault::Eval(format!(
                "Sys.getpid() returned {} instead of an integer",
                value.type_name()
            ))
        })
    }

    /// Ask a master instance for a fresh worker.
    fn spawn_worker(&mut self) -> Result<SpawnedWorker, EngineFault> {
        Err(EngineFault::Eval(
            "this instance cannot spawn workers".to_string(),
        ))
    }

    /// Politely ask the instance to exit.
    fn shutdown(&mut self) {}

    /// Drop the transport.
    fn close(&mut self) {}
}

/// An engine process launched by this process.
pub trait EngineProcess: Send {
    /// OS process id.
    fn id(&self) -> u32;

    /// Whether the process has already exited on its own.
    fn has_exited(&mut self) -> bool {
        false
    }

    /// Make sure the process is gone and reap it.
    fn terminate(&mut self);
}

/// [`EngineProcess`] backed by a `std::process::Child`.
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl EngineProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    fn terminate(&mut self) {
        if self.has_exited() {
            return;
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!("kill of worker {} failed: {}", self.child.id(), e);
        }
        // Reap the zombie
        let _ = self.child.wait();
    }
}
