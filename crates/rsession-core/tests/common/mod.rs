//! Fake engine plumbing shared by the integration tests.
//!
//! Everything here runs in-process: no R installation and no worker binary
//! are needed.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use rsession_core::engine::RetryPolicy;
use rsession_core::{
    EngineConnection, EngineConnectionConfig, EngineFault, EngineInstallation, EngineLauncher,
    EngineLocator, EngineProcess, EngineRuntime, EngineSettings, Error, KillError, LaunchRole,
    PortProber, ProcessKiller, Result, SpawnedWorker, Topology, Value,
};
use tempfile::TempDir;

/// Code that blocks inside the fake engine until its process is killed.
pub const BLOCKING_CODE: &str = "Sys.sleep(3600)";

/// Observable state of every fake engine instance in one test.
#[derive(Default)]
pub struct FakeEngine {
    pub launches: AtomicUsize,
    pub launched_ports: Mutex<Vec<u16>>,
    pub connects: AtomicUsize,
    pub evals: Mutex<Vec<String>>,
    pub missing_packages: Mutex<HashSet<String>>,
    pub outdated_packages: Mutex<HashSet<String>>,
    pub spawn_requests: AtomicUsize,
    pub shutdown_requests: AtomicUsize,
    pub terminated: AtomicUsize,
    pub kill_attempts: Mutex<Vec<u32>>,
    pub failing_kills: Mutex<HashSet<u32>>,
    killed: Mutex<HashSet<u32>>,
    killed_changed: Condvar,
    in_flight: AtomicUsize,
    pub overlapped: AtomicBool,
    pub round_trips: AtomicUsize,
    /// Every `connect` fails while set.
    pub refuse_connections: AtomicBool,
    held: Mutex<bool>,
    held_changed: Condvar,
    pub waiting_connects: AtomicUsize,
    next_process: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn evals_containing(&self, needle: &str) -> usize {
        self.evals
            .lock()
            .unwrap()
            .iter()
            .filter(|code| code.contains(needle))
            .count()
    }

    pub fn was_killed(&self, pid: u32) -> bool {
        self.killed.lock().unwrap().contains(&pid)
    }

    /// Make every `connect` block until [`release_connections`](Self::release_connections).
    pub fn hold_connections(&self) {
        *self.held.lock().unwrap() = true;
    }

    pub fn release_connections(&self) {
        *self.held.lock().unwrap() = false;
        self.held_changed.notify_all();
    }

    /// Block until some `connect` is held, or give up after a few seconds.
    pub fn wait_for_held_connect(&self) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while self.waiting_connects.load(Ordering::SeqCst) == 0 {
            if std::time::Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn pass_connect_gate(&self) {
        let held = self.held.lock().unwrap();
        if !*held {
            return;
        }
        self.waiting_connects.fetch_add(1, Ordering::SeqCst);
        let _released = self
            .held_changed
            .wait_timeout_while(held, Duration::from_secs(5), |held| *held)
            .unwrap();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn mark_killed(&self, pid: u32) {
        self.killed.lock().unwrap().insert(pid);
        self.killed_changed.notify_all();
    }

    /// Block until `pid` is killed, or give up after a few seconds.
    fn wait_for_kill(&self, pid: u32) -> bool {
        let killed = self.killed.lock().unwrap();
        let (killed, _) = self
            .killed_changed
            .wait_timeout_while(killed, Duration::from_secs(5), |killed| {
                !killed.contains(&pid)
            })
            .unwrap();
        killed.contains(&pid)
    }
}

/// Pid the fake engine reports for the instance on `port`.
pub fn engine_pid(port: u16) -> u32 {
    20_000 + u32::from(port)
}

pub struct FakeProcess {
    id: u32,
    engine: Arc<FakeEngine>,
}

impl EngineProcess for FakeProcess {
    fn id(&self) -> u32 {
        self.id
    }

    fn terminate(&mut self) {
        self.engine.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeConnection {
    pid: u32,
    engine: Arc<FakeEngine>,
    variables: HashMap<String, Value>,
}

impl FakeConnection {
    fn enter(&self) -> std::result::Result<(), EngineFault> {
        if self.engine.was_killed(self.pid) {
            return Err(EngineFault::Transport("connection reset by peer".to_string()));
        }
        if self.engine.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.engine.overlapped.store(true, Ordering::SeqCst);
        }
        self.engine.round_trips.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which an interleaved call would be seen.
        std::thread::sleep(Duration::from_millis(1));
        Ok(())
    }

    fn leave(&self) {
        self.engine.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn evaluate(&mut self, code: &str) -> std::result::Result<Value, EngineFault> {
        if code == "Sys.getpid()" {
            return Ok(Value::Integer(self.pid as i32));
        }
        if code == BLOCKING_CODE {
            return if self.engine.wait_for_kill(self.pid) {
                Err(EngineFault::Transport("broken pipe".to_string()))
            } else {
                Ok(Value::Null)
            };
        }
        if let Some(message) = code.strip_prefix("stop(") {
            return Err(EngineFault::Eval(message.trim_end_matches(')').to_string()));
        }
        if code.contains("library(") {
            let missing = self.engine.missing_packages.lock().unwrap();
            let loaded = !missing.iter().any(|p| code.contains(&format!("\"{}\"", p)));
            return Ok(Value::Logical(loaded));
        }
        if code.contains("packageVersion(") {
            let outdated = self.engine.outdated_packages.lock().unwrap();
            let recent = !outdated.iter().any(|p| code.contains(&format!("\"{}\"", p)));
            return Ok(Value::Logical(recent));
        }
        if let Some(name) = code.strip_prefix("length(").and_then(|c| c.strip_suffix(')')) {
            let len = self
                .variables
                .get(name)
                .and_then(Value::to_f64_vec)
                .map(|v| v.len())
                .unwrap_or(0);
            return Ok(Value::Integer(len as i32));
        }
        Ok(Value::Null)
    }
}

impl EngineConnection for FakeConnection {
    fn eval(&mut self, code: &str) -> std::result::Result<Value, EngineFault> {
        self.engine.evals.lock().unwrap().push(code.to_string());
        self.enter()?;
        let result = self.evaluate(code);
        self.leave();
        result
    }

    fn assign(&mut self, name: &str, value: Value) -> std::result::Result<(), EngineFault> {
        self.enter()?;
        self.variables.insert(name.to_string(), value);
        self.leave();
        Ok(())
    }

    fn collect(&mut self, name: &str) -> std::result::Result<Value, EngineFault> {
        self.enter()?;
        let value = self.variables.get(name).cloned();
        self.leave();
        value.ok_or_else(|| EngineFault::Eval(format!("object '{}' not found", name)))
    }

    fn spawn_worker(&mut self) -> std::result::Result<SpawnedWorker, EngineFault> {
        let n = self.engine.spawn_requests.fetch_add(1, Ordering::SeqCst) as u16;
        let port = 40_000 + n;
        Ok(SpawnedWorker {
            port,
            pid: 50_000 + u32::from(n),
        })
    }

    fn shutdown(&mut self) {
        self.engine.shutdown_requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Launcher that records launches and hands out [`FakeConnection`]s.
pub struct FakeLauncher {
    pub engine: Arc<FakeEngine>,
}

impl EngineLauncher for FakeLauncher {
    fn launch(
        &self,
        _installation: &EngineInstallation,
        config: &EngineConnectionConfig,
        _role: LaunchRole,
    ) -> Result<Box<dyn EngineProcess>> {
        self.engine.launches.fetch_add(1, Ordering::SeqCst);
        self.engine.launched_ports.lock().unwrap().push(config.port);
        let n = self.engine.next_process.fetch_add(1, Ordering::SeqCst) as u32;
        Ok(Box::new(FakeProcess {
            id: 30_000 + n,
            engine: Arc::clone(&self.engine),
        }))
    }

    fn connect(&self, config: &EngineConnectionConfig) -> Result<Box<dyn EngineConnection>> {
        self.engine.connects.fetch_add(1, Ordering::SeqCst);
        self.engine.pass_connect_gate();
        if self.engine.refuse_connections.load(Ordering::SeqCst) {
            return Err(Error::Ipc(format!("{} refused the connection", config.address())));
        }
        Ok(Box::new(FakeConnection {
            pid: engine_pid(config.port),
            engine: Arc::clone(&self.engine),
            variables: HashMap::new(),
        }))
    }
}

/// Killer that records attempts and fails for configured pids.
pub struct FakeKiller {
    pub engine: Arc<FakeEngine>,
}

impl ProcessKiller for FakeKiller {
    fn kill(&self, pid: u32) -> std::result::Result<(), KillError> {
        self.engine.kill_attempts.lock().unwrap().push(pid);
        if self.engine.failing_kills.lock().unwrap().contains(&pid) {
            return Err(KillError::Command {
                command: "taskkill".to_string(),
                pid,
                status: "exit code: 1".to_string(),
                stderr: "Access is denied.".to_string(),
            });
        }
        self.engine.mark_killed(pid);
        Ok(())
    }
}

/// Hands out strictly increasing ports, one per call, under a lock.
pub struct SequencePortProber {
    next: Mutex<u16>,
    pub handed_out: Mutex<Vec<u16>>,
}

impl SequencePortProber {
    pub fn new(first: u16) -> Self {
        Self {
            next: Mutex::new(first),
            handed_out: Mutex::new(Vec::new()),
        }
    }
}

impl PortProber for SequencePortProber {
    fn next_free_port(&self) -> Result<u16> {
        let mut next = self.next.lock().unwrap();
        let port = *next;
        *next = next
            .checked_add(1)
            .ok_or_else(|| Error::startup("port range exhausted"))?;
        self.handed_out.lock().unwrap().push(port);
        Ok(port)
    }
}

/// A runtime wired to fakes, plus the handles tests inspect.
pub struct Fixture {
    pub runtime: Arc<EngineRuntime>,
    pub engine: Arc<FakeEngine>,
    pub prober: Arc<SequencePortProber>,
    _home: TempDir,
}

impl Fixture {
    pub fn new(topology: Topology) -> Self {
        let home = TempDir::new().unwrap();
        let locator = EngineLocator::new("R_HOME", Some(home.path().to_path_buf()), vec![])
            .without_platform_query();
        Self::with_locator(topology, locator, home)
    }

    pub fn with_locator(topology: Topology, locator: EngineLocator, home: TempDir) -> Self {
        let engine = FakeEngine::new();
        let prober = Arc::new(SequencePortProber::new(7000));
        let settings = EngineSettings {
            topology: Some(topology),
            connect_attempts: 1,
            connect_retry_delay_ms: 1,
            work_dir: Some(home.path().join("work")),
            ..EngineSettings::default()
        };
        let runtime = EngineRuntime::builder(settings)
            .locator(locator)
            .launcher(Arc::new(FakeLauncher {
                engine: Arc::clone(&engine),
            }))
            .port_prober(prober.clone())
            .killer(Arc::new(FakeKiller {
                engine: Arc::clone(&engine),
            }))
            .build();

        Self {
            runtime,
            engine,
            prober,
            _home: home,
        }
    }
}

pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 1,
        delay: Duration::from_millis(1),
    }
}
