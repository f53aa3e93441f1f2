//! Acquisition of pooled worker instances.
//!
//! Two topologies:
//!
//! - [`Topology::ProcessPerWorker`]: every acquisition launches a worker on
//!   a freshly probed port. Probing, launching and the wait until the worker
//!   accepts connections happen under one startup lock, so a port cannot be
//!   handed out twice before either worker has bound it.
//! - [`Topology::MasterProxy`]: one long-lived master, started lazily on the
//!   first acquisition, spawns workers on request. The master is owned by
//!   the pool, never registered as a session, and released at shutdown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::config::{EngineSettings, Topology};
use crate::engine::{
    Credentials, EngineConnectionConfig, EngineLauncher, EngineProcessHandle, LaunchRole,
    PortProber, ProcessKiller, RetryPolicy,
};
use crate::error::{Error, Result};
use crate::locate::EngineInstallation;

/// The master instance of the [`Topology::MasterProxy`] topology.
struct MasterInstance {
    handle: Mutex<EngineProcessHandle>,
}

impl MasterInstance {
    fn lock(&self) -> MutexGuard<'_, EngineProcessHandle> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Hands out engine worker handles.
pub struct SessionPool {
    topology: Topology,
    launcher: Arc<dyn EngineLauncher>,
    prober: Arc<dyn PortProber>,
    killer: Arc<dyn ProcessKiller>,
    retry: RetryPolicy,
    host: String,
    work_dir: std::path::PathBuf,
    startup: Mutex<()>,
    master: RwLock<Option<Arc<MasterInstance>>>,
}

impl SessionPool {
    pub fn new(
        settings: &EngineSettings,
        launcher: Arc<dyn EngineLauncher>,
        prober: Arc<dyn PortProber>,
        killer: Arc<dyn ProcessKiller>,
    ) -> Self {
        Self {
            topology: settings.topology(),
            launcher,
            prober,
            killer,
            retry: RetryPolicy::from_settings(settings),
            host: settings.host.clone(),
            work_dir: settings.work_dir(),
            startup: Mutex::new(()),
            master: RwLock::new(None),
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Whether a master instance is currently running.
    pub fn has_master(&self) -> bool {
        self.master
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn fresh_config(&self, port: u16) -> EngineConnectionConfig {
        EngineConnectionConfig {
            host: self.host.clone(),
            port,
            credentials: Credentials::generate(),
            work_dir: self.work_dir.clone(),
        }
    }

    /// Launch (or have the master spawn) a worker and connect to it.
    ///
    /// The returned handle already knows the engine's pid.
    pub fn acquire_worker(&self, installation: &EngineInstallation) -> Result<EngineProcessHandle> {
        match self.topology {
            Topology::ProcessPerWorker => self.launch_worker(installation),
            Topology::MasterProxy => self.spawn_via_master(installation),
        }
    }

    fn launch_worker(&self, installation: &EngineInstallation) -> Result<EngineProcessHandle> {
        let _startup = self.startup.lock().unwrap_or_else(PoisonError::into_inner);
        let port = self.prober.next_free_port()?;
        EngineProcessHandle::spawn(
            self.launcher.as_ref(),
            installation,
            self.fresh_config(port),
            LaunchRole::Worker,
            Arc::clone(&self.killer),
            self.retry,
        )
    }

    fn spawn_via_master(&self, installation: &EngineInstallation) -> Result<EngineProcessHandle> {
        let master = self.master(installation)?;

        let (spawned, config) = {
            let mut handle = master.lock();
            let config = handle.config().clone();
            (handle.spawn_worker(), config)
        };

        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(fault) => {
                if fault.is_transport() {
                    tracing::warn!("master instance unreachable, it will be restarted: {}", fault);
                    self.discard_master(&master);
                }
                return Err(Error::startup(format!("master could not spawn a worker: {}", fault)));
            }
        };

        tracing::debug!(
            "master spawned worker {} on port {}",
            spawned.pid,
            spawned.port
        );
        EngineProcessHandle::attach(
            self.launcher.as_ref(),
            config.with_port(spawned.port),
            Some(spawned.pid),
            Arc::clone(&self.killer),
            self.retry,
        )
    }

    /// The master instance, started on first use (double-checked).
    fn master(&self, installation: &EngineInstallation) -> Result<Arc<MasterInstance>> {
        if let Some(master) = self
            .master
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(Arc::clone(master));
        }

        let mut slot = self.master.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(master) = slot.as_ref() {
            return Ok(Arc::clone(master));
        }

        let port = self.prober.next_free_port()?;
        let handle = EngineProcessHandle::spawn(
            self.launcher.as_ref(),
            installation,
            self.fresh_config(port),
            LaunchRole::Master,
            Arc::clone(&self.killer),
            self.retry,
        )?;
        tracing::info!("started master instance (pid {}) on port {}", handle.pid(), port);

        let master = Arc::new(MasterInstance {
            handle: Mutex::new(handle),
        });
        *slot = Some(Arc::clone(&master));
        Ok(master)
    }

    fn discard_master(&self, stale: &Arc<MasterInstance>) {
        let mut slot = self.master.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
            *slot = None;
        }
        drop(slot);
        terminate_master(stale);
    }

    /// Shut the master instance down, if one was started.
    pub fn release_master(&self) {
        let master = self
            .master
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(master) = master {
            terminate_master(&master);
            tracing::info!("master instance released");
        }
    }
}

fn terminate_master(master: &MasterInstance) {
    let mut handle = master.lock();
    handle.request_shutdown();
    if let Err(e) = handle.force_kill() {
        tracing::warn!("could not terminate master instance {}: {}", handle.pid(), e);
    }
    handle.release();
}
