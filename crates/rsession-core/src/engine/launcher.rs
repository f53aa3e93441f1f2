//! Starting engine worker processes and allocating their ports.

use std::net::TcpListener;
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};

use crate::config::EngineSettings;
use crate::error::{Error, Result};
use crate::ipc::TcpConnection;
use crate::locate::{EngineInstallation, locate_worker_binary};

use super::diagnostics::DiagnosticsGate;
use super::{ChildProcess, EngineConnection, EngineConnectionConfig, EngineProcess};

/// Environment variable carrying the credentials token to a worker.
///
/// Passed through the environment rather than argv so it does not show up
/// in process listings.
pub const TOKEN_VAR: &str = "RSESSION_TOKEN";

/// What a launched process is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchRole {
    /// Serves exactly one session, then exits.
    Worker,
    /// Long-lived; spawns workers on request.
    Master,
}

/// Starts engine processes and opens connections to them.
pub trait EngineLauncher: Send + Sync {
    /// Start a process listening on `config.port`.
    ///
    /// Returns as soon as the process exists; it may not be reachable yet.
    fn launch(
        &self,
        installation: &EngineInstallation,
        config: &EngineConnectionConfig,
        role: LaunchRole,
    ) -> Result<Box<dyn EngineProcess>>;

    /// Open an authenticated connection.
    fn connect(&self, config: &EngineConnectionConfig) -> Result<Box<dyn EngineConnection>>;
}

/// Launches `rsession-worker` processes and talks to them over loopback TCP.
pub struct WorkerLauncher {
    settings: EngineSettings,
    diagnostics: DiagnosticsGate,
}

impl WorkerLauncher {
    pub fn new(settings: EngineSettings, diagnostics: DiagnosticsGate) -> Self {
        Self {
            settings,
            diagnostics,
        }
    }
}

impl EngineLauncher for WorkerLauncher {
    fn launch(
        &self,
        installation: &EngineInstallation,
        config: &EngineConnectionConfig,
        role: LaunchRole,
    ) -> Result<Box<dyn EngineProcess>> {
        let worker_path = locate_worker_binary(&self.settings)?;
        std::fs::create_dir_all(&config.work_dir).map_err(|e| {
            Error::startup(format!(
                "cannot create working directory '{}': {}",
                config.work_dir.display(),
                e
            ))
        })?;

        let mut command = Command::new(&worker_path);
        command
            .arg("--host")
            .arg(&config.host)
            .arg("--port")
            .arg(config.port.to_string())
            .arg("--home")
            .arg(&installation.home)
            .env("R_HOME", &installation.home)
            .env(TOKEN_VAR, config.credentials.token())
            .current_dir(&config.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if role == LaunchRole::Master {
            command.arg("--master");
        }

        let mut child = command.spawn().map_err(|e| {
            Error::startup(format!(
                "failed to spawn worker process '{}': {}",
                worker_path.display(),
                e
            ))
        })?;

        if let Some(stderr) = child.stderr.take() {
            let label = match role {
                LaunchRole::Worker => format!("worker:{}", config.port),
                LaunchRole::Master => format!("master:{}", config.port),
            };
            if let Err(e) = self.diagnostics.forward(stderr, label) {
                tracing::debug!("cannot forward worker output: {}", e);
            }
        }

        tracing::debug!(
            "started {:?} process {} on port {}",
            role,
            child.id(),
            config.port
        );
        Ok(Box::new(ChildProcess::new(child)))
    }

    fn connect(&self, config: &EngineConnectionConfig) -> Result<Box<dyn EngineConnection>> {
        Ok(Box::new(TcpConnection::connect(config)?))
    }
}

/// Hands out ports for new worker processes.
pub trait PortProber: Send + Sync {
    fn next_free_port(&self) -> Result<u16>;
}

/// Probes loopback ports by binding them, starting at a base port.
///
/// A cursor advances past every port handed out, so two allocations in quick
/// succession do not return the same port before either worker has bound it.
pub struct LoopbackPortProber {
    host: String,
    base: u16,
    window: u16,
    cursor: Mutex<u16>,
}

impl LoopbackPortProber {
    pub fn new(host: impl Into<String>, base: u16, window: u16) -> Self {
        Self {
            host: host.into(),
            base,
            window: window.max(1),
            cursor: Mutex::new(0),
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(settings.host.clone(), settings.base_port, settings.port_window)
    }
}

impl PortProber for LoopbackPortProber {
    fn next_free_port(&self) -> Result<u16> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);

        for step in 0..self.window {
            let offset = ((u32::from(*cursor) + u32::from(step)) % u32::from(self.window)) as u16;
            let Some(port) = self.base.checked_add(offset) else {
                continue;
            };
            if TcpListener::bind((self.host.as_str(), port)).is_ok() {
                *cursor = ((u32::from(offset) + 1) % u32::from(self.window)) as u16;
                return Ok(port);
            }
        }

        Err(Error::startup(format!(
            "no free port in {}..{}",
            self.base,
            u32::from(self.base) + u32::from(self.window)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prober_skips_bound_port() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let prober = LoopbackPortProber::new("127.0.0.1", port, 20);
        let next = prober.next_free_port().unwrap();
        assert_ne!(next, port);
    }

    #[test]
    fn test_prober_does_not_repeat_ports() {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = probe.local_addr().unwrap().port().saturating_add(1);
        drop(probe);

        let prober = LoopbackPortProber::new("127.0.0.1", base, 50);
        let first = prober.next_free_port().unwrap();
        let second = prober.next_free_port().unwrap();
        assert_ne!(first, second);
    }
}
