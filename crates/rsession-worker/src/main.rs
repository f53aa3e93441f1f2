//! Engine worker process.
//!
//! Listens on a loopback port, authenticates the host with the token from
//! `RSESSION_TOKEN` and evaluates requests in an R process it starts on
//! demand. With `--master` it serves many connections and starts further
//! workers (copies of this binary) when asked.

mod bridge;

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use rsession_core::engine::{LoopbackPortProber, PortProber, TOKEN_VAR};
use rsession_core::ipc::{Interpreter, ServeMode, ServeOptions, WorkerHost, serve};
use rsession_core::{Error, SpawnedWorker};
use tracing_subscriber::EnvFilter;

use bridge::RBridge;

/// Ports a master searches for its workers, starting just above its own.
const WORKER_PORT_WINDOW: u16 = 1000;

#[derive(Parser)]
#[command(name = "rsession-worker")]
#[command(about = "Serves one R engine instance over loopback TCP")]
#[command(version)]
struct Args {
    /// Interface to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long)]
    port: u16,

    /// R installation directory
    #[arg(long)]
    home: PathBuf,

    /// Serve many connections and spawn workers on request
    #[arg(long)]
    master: bool,
}

/// Starts R bridges, and worker processes when running as a master.
struct RHost {
    home: PathBuf,
    host: String,
    token: String,
    prober: LoopbackPortProber,
    children: Mutex<Vec<Child>>,
}

impl WorkerHost for RHost {
    fn start_interpreter(&self) -> rsession_core::Result<Box<dyn Interpreter>> {
        let bridge = RBridge::start(&self.home).map_err(|e| Error::Ipc(format!("{:#}", e)))?;
        Ok(Box::new(bridge))
    }

    fn spawn_worker(&self) -> rsession_core::Result<SpawnedWorker> {
        let port = self.prober.next_free_port()?;
        let exe = std::env::current_exe()?;

        let child = Command::new(&exe)
            .arg("--host")
            .arg(&self.host)
            .arg("--port")
            .arg(port.to_string())
            .arg("--home")
            .arg(&self.home)
            .env(TOKEN_VAR, &self.token)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::startup(format!("failed to spawn worker '{}': {}", exe.display(), e))
            })?;

        let pid = child.id();
        tracing::info!("spawned worker {} on port {}", pid, port);

        let mut children = self
            .children
            .lock()
            .map_err(|_| Error::LockPoisoned("worker children".to_string()))?;
        // Forget workers that already exited
        children.retain_mut(|c| matches!(c.try_wait(), Ok(None)));
        children.push(child);

        Ok(SpawnedWorker { port, pid })
    }

    fn shutdown(&self) {
        let Ok(mut children) = self.children.lock() else {
            return;
        };
        for mut child in children.drain(..) {
            if let Err(e) = child.kill() {
                tracing::debug!("worker {} already gone: {}", child.id(), e);
            }
            let _ = child.wait();
        }
    }
}

fn main() -> anyhow::Result<()> {
    // stdout is not read by the host; everything goes to stderr
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let token = std::env::var(TOKEN_VAR)
        .with_context(|| format!("{} must carry the connection token", TOKEN_VAR))?;

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .with_context(|| format!("cannot listen on {}:{}", args.host, args.port))?;

    let mode = if args.master {
        ServeMode::Master
    } else {
        ServeMode::SingleSession
    };
    let host = Arc::new(RHost {
        prober: LoopbackPortProber::new(
            args.host.clone(),
            args.port.saturating_add(1),
            WORKER_PORT_WINDOW,
        ),
        home: args.home,
        host: args.host,
        token: token.clone(),
        children: Mutex::new(Vec::new()),
    });

    let result = serve(listener, host.clone(), ServeOptions { token, mode });
    host.shutdown();
    result.context("worker stopped")
}
