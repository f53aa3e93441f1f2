//! One connected engine instance.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineSettings;
use crate::error::{EngineFault, Error, KillError, Result};
use crate::ipc::Value;
use crate::locate::EngineInstallation;

use super::kill::{KillSwitch, ProcessKiller};
use super::launcher::{EngineLauncher, LaunchRole};
use super::{EngineConnection, EngineConnectionConfig, EngineProcess, SpawnedWorker};

/// How long to keep trying to reach a freshly started instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            attempts: settings.connect_attempts.max(1),
            delay: settings.connect_retry_delay(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

/// A connection to one engine instance plus what is needed to kill it.
///
/// Round trips go through `&mut self`; callers serialize access. The
/// [`KillSwitch`] is cloned out so termination never needs that access.
pub struct EngineProcessHandle {
    config: EngineConnectionConfig,
    connection: Option<Box<dyn EngineConnection>>,
    process: Option<Box<dyn EngineProcess>>,
    kill_switch: KillSwitch,
}

impl EngineProcessHandle {
    /// Launch a process and connect to it.
    ///
    /// Workers are identified by asking the engine for its pid. A master is
    /// identified by its OS process id, since it does not run an engine of
    /// its own until asked to.
    pub fn spawn(
        launcher: &dyn EngineLauncher,
        installation: &EngineInstallation,
        config: EngineConnectionConfig,
        role: LaunchRole,
        killer: Arc<dyn ProcessKiller>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let process = launcher.launch(installation, &config, role)?;
        let query_pid = role == LaunchRole::Worker;
        Self::establish(launcher, config, Some(process), None, killer, retry, query_pid)
    }

    /// Connect to an instance someone else started.
    ///
    /// `known_pid` is the process to kill if the instance turns out to be
    /// unusable.
    pub fn attach(
        launcher: &dyn EngineLauncher,
        config: EngineConnectionConfig,
        known_pid: Option<u32>,
        killer: Arc<dyn ProcessKiller>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Self::establish(launcher, config, None, known_pid, killer, retry, true)
    }

    fn establish(
        launcher: &dyn EngineLauncher,
        config: EngineConnectionConfig,
        mut process: Option<Box<dyn EngineProcess>>,
        known_pid: Option<u32>,
        killer: Arc<dyn ProcessKiller>,
        retry: RetryPolicy,
        query_pid: bool,
    ) -> Result<Self> {
        let kill_switch = KillSwitch::new(killer);
        if let Some(pid) = known_pid.and_then(|pid| i32::try_from(pid).ok()) {
            kill_switch.arm(pid);
        }

        let connection = match connect_with_retry(launcher, &config, process.as_deref_mut(), retry) {
            Ok(connection) => connection,
            Err(e) => {
                abandon(process, &kill_switch);
                return Err(e);
            }
        };

        let mut handle = Self {
            config,
            connection: Some(connection),
            process,
            kill_switch,
        };

        if query_pid {
            match handle.eval_pid() {
                Ok(pid) => handle.kill_switch.arm(pid),
                Err(fault) => {
                    let port = handle.config.port;
                    handle.abandon_self();
                    return Err(Error::startup(format!(
                        "instance on port {} did not report its pid: {}",
                        port, fault
                    )));
                }
            }
        } else if let Some(process) = &handle.process
            && let Ok(pid) = i32::try_from(process.id())
        {
            handle.kill_switch.arm(pid);
        }

        tracing::debug!(
            "connected to R instance pid {} on port {}",
            handle.pid(),
            handle.config.port
        );
        Ok(handle)
    }

    fn eval_pid(&mut self) -> std::result::Result<i32, EngineFault> {
        self.connection()?.query_pid()
    }

    fn abandon_self(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        abandon(self.process.take(), &self.kill_switch);
    }

    /// Engine pid, or -1 when unknown.
    pub fn pid(&self) -> i32 {
        self.kill_switch.pid()
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn config(&self) -> &EngineConnectionConfig {
        &self.config
    }

    /// A clone of the kill switch, usable without access to the handle.
    pub fn kill_switch(&self) -> KillSwitch {
        self.kill_switch.clone()
    }

    fn connection(&mut self) -> std::result::Result<&mut dyn EngineConnection, EngineFault> {
        match self.connection.as_deref_mut() {
            Some(connection) => Ok(connection),
            None => Err(EngineFault::Transport("connection released".to_string())),
        }
    }

    pub fn eval_raw(&mut self, code: &str) -> std::result::Result<Value, EngineFault> {
        self.connection()?.eval(code)
    }

    pub fn assign_raw(&mut self, name: &str, value: Value) -> std::result::Result<(), EngineFault> {
        self.connection()?.assign(name, value)
    }

    pub fn collect_raw(&mut self, name: &str) -> std::result::Result<Value, EngineFault> {
        self.connection()?.collect(name)
    }

    /// Ask a master instance for a fresh worker.
    pub fn spawn_worker(&mut self) -> std::result::Result<SpawnedWorker, EngineFault> {
        self.connection()?.spawn_worker()
    }

    /// Politely ask the instance to exit.
    pub fn request_shutdown(&mut self) {
        if let Some(connection) = self.connection.as_deref_mut() {
            connection.shutdown();
        }
    }

    /// Hard-terminate the engine process.
    pub fn force_kill(&self) -> std::result::Result<(), KillError> {
        self.kill_switch.fire()
    }

    /// Drop the connection and reap any process this handle launched.
    pub fn release(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
    }
}

impl Drop for EngineProcessHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn connect_with_retry(
    launcher: &dyn EngineLauncher,
    config: &EngineConnectionConfig,
    mut process: Option<&mut (dyn EngineProcess + 'static)>,
    retry: RetryPolicy,
) -> Result<Box<dyn EngineConnection>> {
    let attempts = retry.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match launcher.connect(config) {
            Ok(connection) => return Ok(connection),
            Err(e) => {
                tracing::debug!(
                    "connection attempt {}/{} to {} failed: {}",
                    attempt,
                    attempts,
                    config.address(),
                    e
                );
                last_error = Some(e);
            }
        }

        if let Some(process) = process.as_deref_mut()
            && process.has_exited()
        {
            return Err(Error::startup(format!(
                "process {} exited before accepting connections on port {}",
                process.id(),
                config.port
            )));
        }

        if attempt < attempts {
            std::thread::sleep(retry.delay);
        }
    }

    Err(Error::startup(format!(
        "no connection to {} after {} attempt(s): {}",
        config.address(),
        attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Get rid of an instance that never became usable.
fn abandon(process: Option<Box<dyn EngineProcess>>, kill_switch: &KillSwitch) {
    if let Some(mut process) = process {
        process.terminate();
    } else if let Err(e) = kill_switch.fire() {
        tracing::warn!("could not terminate unusable instance: {}", e);
    }
}
