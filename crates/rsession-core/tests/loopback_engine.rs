//! Real loopback protocol tests.
//!
//! Workers are `serve` loops on background threads with a toy interpreter,
//! so the TCP transport, handshake and master spawning are exercised
//! without an R installation.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rsession_core::engine::{LoopbackPortProber, RetryPolicy};
use rsession_core::ipc::{
    Interpreter, InterpreterError, ServeMode, ServeOptions, TcpConnection, WorkerHost, serve,
};
use rsession_core::{
    Credentials, EngineConnection, EngineConnectionConfig, EngineFault, EngineInstallation,
    EngineKind, EngineLauncher, EngineLocator, EngineProcess, EngineProcessHandle, EngineRuntime,
    EngineSettings, Error, KillError, LaunchRole, Outcome, ProcessKiller, Result, SessionWrapper,
    SpawnedWorker, Topology, Value,
};
use tempfile::TempDir;

const TOY_PID: i32 = 4242;

/// Understands `Sys.getpid()`, `stop(...)`, `length(name)` and bare names.
#[derive(Default)]
struct ToyInterpreter {
    variables: HashMap<String, Value>,
}

impl Interpreter for ToyInterpreter {
    fn eval(&mut self, code: &str) -> std::result::Result<Value, InterpreterError> {
        if code == "Sys.getpid()" {
            return Ok(Value::Integer(TOY_PID));
        }
        if code == "quit()" {
            return Err(InterpreterError::Lost("interpreter exited".to_string()));
        }
        if let Some(message) = code.strip_prefix("stop(") {
            return Err(InterpreterError::Raised(message.trim_end_matches(')').to_string()));
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
        self.collect(code)
    }

    fn assign(&mut self, name: &str, value: Value) -> std::result::Result<(), InterpreterError> {
        self.variables.insert(name.to_string(), value);
        Ok(())
    }

    fn collect(&mut self, name: &str) -> std::result::Result<Value, InterpreterError> {
        self.variables
            .get(name)
            .cloned()
            .ok_or_else(|| InterpreterError::Raised(format!("object '{}' not found", name)))
    }
}

/// Host whose workers are `serve` threads in this process.
#[derive(Default)]
struct ThreadHost {
    token: String,
    workers: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicUsize,
    shut_down: AtomicBool,
}

impl ThreadHost {
    fn new(token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: token.to_string(),
            ..Self::default()
        })
    }
}

impl WorkerHost for ThreadHost {
    fn start_interpreter(&self) -> Result<Box<dyn Interpreter>> {
        Ok(Box::new(ToyInterpreter::default()))
    }

    fn spawn_worker(&self) -> Result<SpawnedWorker> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let options = ServeOptions {
            token: self.token.clone(),
            mode: ServeMode::SingleSession,
        };
        let worker = std::thread::spawn(move || {
            let host: Arc<dyn WorkerHost> = Arc::new(ThreadHost::default());
            let _ = serve(listener, host, options);
        });
        self.workers.lock().unwrap().push(worker);
        let n = self.spawned.fetch_add(1, Ordering::SeqCst) as u32;
        Ok(SpawnedWorker {
            port,
            pid: 90_000 + n,
        })
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

struct ThreadProcess {
    server: Option<JoinHandle<()>>,
}

impl EngineProcess for ThreadProcess {
    fn id(&self) -> u32 {
        80_000
    }

    fn has_exited(&mut self) -> bool {
        self.server.as_ref().is_none_or(|server| server.is_finished())
    }

    fn terminate(&mut self) {}
}

/// Launches `serve` threads and connects with the real TCP transport.
struct ThreadLauncher {
    hosts: Mutex<Vec<Arc<ThreadHost>>>,
}

impl EngineLauncher for ThreadLauncher {
    fn launch(
        &self,
        _installation: &EngineInstallation,
        config: &EngineConnectionConfig,
        role: LaunchRole,
    ) -> Result<Box<dyn EngineProcess>> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))?;
        let host = ThreadHost::new(config.credentials.token());
        self.hosts.lock().unwrap().push(Arc::clone(&host));
        let options = ServeOptions {
            token: config.credentials.token().to_string(),
            mode: match role {
                LaunchRole::Worker => ServeMode::SingleSession,
                LaunchRole::Master => ServeMode::Master,
            },
        };
        let server = std::thread::spawn(move || {
            let _ = serve(listener, host, options);
        });
        Ok(Box::new(ThreadProcess {
            server: Some(server),
        }))
    }

    fn connect(&self, config: &EngineConnectionConfig) -> Result<Box<dyn EngineConnection>> {
        Ok(Box::new(TcpConnection::connect(config)?))
    }
}

/// Never signals anything; these "processes" are threads of the test.
#[derive(Default)]
struct NoopKiller {
    kills: Mutex<Vec<u32>>,
}

impl ProcessKiller for NoopKiller {
    fn kill(&self, pid: u32) -> std::result::Result<(), KillError> {
        self.kills.lock().unwrap().push(pid);
        Ok(())
    }
}

fn start_single_session(token: &str) -> (EngineConnectionConfig, JoinHandle<Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let options = ServeOptions {
        token: token.to_string(),
        mode: ServeMode::SingleSession,
    };
    let server = std::thread::spawn(move || {
        let host: Arc<dyn WorkerHost> = ThreadHost::new("unused");
        serve(listener, host, options)
    });
    let config = EngineConnectionConfig {
        host: "127.0.0.1".to_string(),
        port,
        credentials: Credentials::new(token),
        work_dir: std::env::temp_dir(),
    };
    (config, server)
}

fn free_base_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

#[test]
fn test_round_trips_over_tcp() {
    let (config, server) = start_single_session("s3cret");
    let mut connection = TcpConnection::connect(&config).unwrap();

    connection
        .assign("mz", Value::Numeric(vec![101.5, 202.25, f64::NAN]))
        .unwrap();
    assert_eq!(connection.eval("length(mz)").unwrap(), Value::Integer(3));
    match connection.collect("mz").unwrap() {
        Value::Numeric(v) => {
            assert_eq!(v[1], 202.25);
            assert!(v[2].is_nan());
        }
        other => panic!("unexpected value {:?}", other),
    }
    assert_eq!(connection.query_pid().unwrap(), TOY_PID);

    connection.close();
    server.join().unwrap().unwrap();
}

#[test]
fn test_eval_fault_keeps_connection_usable() {
    let (config, server) = start_single_session("s3cret");
    let mut connection = TcpConnection::connect(&config).unwrap();

    match connection.eval("stop('no peaks')") {
        Err(EngineFault::Eval(message)) => assert!(message.contains("no peaks")),
        other => panic!("expected eval fault, got {:?}", other),
    }
    assert_eq!(connection.query_pid().unwrap(), TOY_PID);

    connection.close();
    server.join().unwrap().unwrap();
}

#[test]
fn test_lost_interpreter_is_transport_fault() {
    let (config, server) = start_single_session("s3cret");
    let mut connection = TcpConnection::connect(&config).unwrap();

    assert!(matches!(connection.eval("quit()"), Err(EngineFault::Transport(_))));
    assert!(server.join().unwrap().is_err());
}

#[test]
fn test_wrong_token_is_refused_and_worker_keeps_waiting() {
    let (config, server) = start_single_session("s3cret");

    let intruder = EngineConnectionConfig {
        credentials: Credentials::new("guess"),
        ..config.clone()
    };
    match TcpConnection::connect(&intruder) {
        Err(Error::Ipc(message)) => assert!(message.contains("refused")),
        other => panic!("expected refusal, got {:?}", other.map(|_| ())),
    }

    let mut connection = TcpConnection::connect(&config).unwrap();
    assert_eq!(connection.query_pid().unwrap(), TOY_PID);
    connection.close();
    server.join().unwrap().unwrap();
}

#[test]
fn test_garbage_frame_is_refused_and_worker_keeps_waiting() {
    let (config, server) = start_single_session("s3cret");

    for body in [vec![0u8; 16], vec![0xAB; 32]] {
        let mut stream = TcpStream::connect(config.address()).unwrap();
        stream
            .write_all(&(body.len() as u32).to_le_bytes())
            .unwrap();
        stream.write_all(&body).unwrap();
        stream.flush().unwrap();
        // The worker hangs up without a reply
        let mut reply = Vec::new();
        let _ = stream.read_to_end(&mut reply);
    }

    let mut connection = TcpConnection::connect(&config).unwrap();
    assert_eq!(connection.query_pid().unwrap(), TOY_PID);
    connection.close();
    server.join().unwrap().unwrap();
}

#[test]
fn test_connect_gives_up_on_dead_port() {
    let port = free_base_port();
    let config = EngineConnectionConfig {
        host: "127.0.0.1".to_string(),
        port,
        credentials: Credentials::generate(),
        work_dir: std::env::temp_dir(),
    };
    let launcher = ThreadLauncher {
        hosts: Mutex::new(Vec::new()),
    };
    let retry = RetryPolicy {
        attempts: 2,
        delay: std::time::Duration::from_millis(5),
    };

    let killer = Arc::new(NoopKiller::default());

    let result = EngineProcessHandle::attach(&launcher, config, Some(77), killer.clone(), retry);
    assert!(matches!(result, Err(Error::StartupFailed { .. })));
    // The half-started worker is killed before the error is returned
    assert_eq!(*killer.kills.lock().unwrap(), vec![77]);
}

fn thread_runtime(topology: Topology) -> (Arc<EngineRuntime>, Arc<NoopKiller>, TempDir) {
    let home = TempDir::new().unwrap();
    let settings = EngineSettings {
        topology: Some(topology),
        connect_attempts: 3,
        connect_retry_delay_ms: 10,
        work_dir: Some(home.path().join("work")),
        ..EngineSettings::default()
    };
    let killer = Arc::new(NoopKiller::default());
    let runtime = EngineRuntime::builder(settings)
        .locator(
            EngineLocator::new("R_HOME", Some(home.path().to_path_buf()), vec![])
                .without_platform_query(),
        )
        .launcher(Arc::new(ThreadLauncher {
            hosts: Mutex::new(Vec::new()),
        }))
        .port_prober(Arc::new(LoopbackPortProber::new(
            "127.0.0.1",
            free_base_port(),
            200,
        )))
        .killer(killer.clone())
        .build();
    (runtime, killer, home)
}

#[test]
fn test_sessions_over_process_per_worker() {
    let (runtime, killer, _home) = thread_runtime(Topology::ProcessPerWorker);

    let session = SessionWrapper::new(&runtime, EngineKind::PooledWorker, vec![]);
    session.open().unwrap();
    assert_eq!(session.pid(), TOY_PID);

    session.assign("rt", vec![1.0, 2.0]).unwrap();
    assert_eq!(
        session.eval("length(rt)").unwrap(),
        Outcome::Done(Value::Integer(2))
    );
    session.close(false).unwrap();

    assert_eq!(*killer.kills.lock().unwrap(), vec![TOY_PID as u32]);
    runtime.shutdown();
}

#[test]
fn test_sessions_through_master() {
    let (runtime, _killer, _home) = thread_runtime(Topology::MasterProxy);

    let sessions: Vec<_> = (0..3)
        .map(|_| SessionWrapper::new(&runtime, EngineKind::PooledWorker, vec![]))
        .collect();
    for (i, session) in sessions.iter().enumerate() {
        session.open().unwrap();
        session.assign("i", i as f64).unwrap();
    }
    for (i, session) in sessions.iter().enumerate() {
        assert_eq!(
            session.collect("i").unwrap(),
            Outcome::Done(Value::Scalar(i as f64))
        );
    }
    assert!(runtime.pool().has_master());

    let summary = runtime.shutdown();
    assert_eq!(summary.closed, 3);
    assert!(!runtime.pool().has_master());
    assert!(runtime.registry().is_empty());
}
