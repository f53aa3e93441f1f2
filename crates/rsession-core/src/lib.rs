//! Session management for an external R statistics engine.
//!
//! This crate provides:
//! - Installation discovery with remediation hints
//! - Engine worker processes reached over an authenticated loopback protocol
//! - Worker acquisition per process or through a master instance
//! - Cancelable, idempotently closable sessions and a process-wide registry
//! - Forced termination of engine processes on every platform

pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod locate;
pub mod progress;
pub mod session;

pub use config::{EngineKind, EngineSettings, Topology};
pub use engine::{
    Credentials, DiagnosticsGate, EngineConnection, EngineConnectionConfig, EngineLauncher,
    EngineProcess, EngineProcessHandle, KillSwitch, LaunchRole, PortProber, ProcessKiller,
    SpawnedWorker, SystemKiller,
};
pub use error::{EngineFault, Error, KillError, Operation, Result};
pub use ipc::Value;
pub use locate::{EngineInstallation, EngineLocator};
pub use progress::Progress;
pub use session::{
    CleanupSummary, EngineRuntime, Outcome, RequiredPackage, SessionId, SessionRegistry,
    SessionState, SessionWrapper,
};
