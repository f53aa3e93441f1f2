//! Process-wide engine state.
//!
//! [`EngineRuntime`] owns everything that exists at most once per process:
//! the installation locator, the worker pool and its master instance, the
//! shared embedded engine, the session registry and the diagnostics gate.
//! Applications use [`EngineRuntime::global`] and call
//! [`EngineRuntime::shutdown`] before exiting; tests build private runtimes
//! with fakes through [`EngineRuntime::builder`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::config::EngineSettings;
use crate::engine::{
    Credentials, DiagnosticsGate, EngineConnectionConfig, EngineLauncher, EngineProcessHandle,
    LaunchRole, LoopbackPortProber, PortProber, ProcessKiller, RetryPolicy, SystemKiller,
    WorkerLauncher,
};
use crate::error::{Error, Result};
use crate::locate::{EngineInstallation, EngineLocator};

use super::pool::SessionPool;
use super::registry::{CleanupSummary, SessionRegistry};
use super::SessionId;

static GLOBAL: OnceLock<Arc<EngineRuntime>> = OnceLock::new();

/// The single shared engine behind [`EngineKind::EmbeddedSingleton`] sessions.
///
/// The instance is not reentrant: every round trip holds the lock.
///
/// [`EngineKind::EmbeddedSingleton`]: crate::config::EngineKind::EmbeddedSingleton
pub struct SharedEngine {
    handle: Mutex<EngineProcessHandle>,
}

impl SharedEngine {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, EngineProcessHandle>> {
        self.handle.lock().map_err(lock_error)
    }
}

pub(crate) fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::LockPoisoned(e.to_string())
}

/// Builder for [`EngineRuntime`]; unset parts get the production defaults.
pub struct EngineRuntimeBuilder {
    settings: EngineSettings,
    locator: Option<EngineLocator>,
    launcher: Option<Arc<dyn EngineLauncher>>,
    prober: Option<Arc<dyn PortProber>>,
    killer: Option<Arc<dyn ProcessKiller>>,
}

impl EngineRuntimeBuilder {
    pub fn locator(mut self, locator: EngineLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn EngineLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn port_prober(mut self, prober: Arc<dyn PortProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn killer(mut self, killer: Arc<dyn ProcessKiller>) -> Self {
        self.killer = Some(killer);
        self
    }

    pub fn build(self) -> Arc<EngineRuntime> {
        let settings = self.settings;
        let diagnostics = DiagnosticsGate::new();

        let locator = self
            .locator
            .unwrap_or_else(|| EngineLocator::from_settings(&settings));
        let launcher = self.launcher.unwrap_or_else(|| {
            Arc::new(WorkerLauncher::new(settings.clone(), diagnostics.clone()))
        });
        let prober = self
            .prober
            .unwrap_or_else(|| Arc::new(LoopbackPortProber::from_settings(&settings)));
        let killer = self
            .killer
            .unwrap_or_else(|| Arc::new(SystemKiller::new(settings.kill_grace())));

        let pool = SessionPool::new(
            &settings,
            Arc::clone(&launcher),
            Arc::clone(&prober),
            Arc::clone(&killer),
        );

        Arc::new(EngineRuntime {
            settings,
            locator,
            launcher,
            prober,
            killer,
            pool,
            registry: SessionRegistry::new(),
            diagnostics,
            shared: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }
}

/// Process-wide engine state object.
pub struct EngineRuntime {
    settings: EngineSettings,
    locator: EngineLocator,
    launcher: Arc<dyn EngineLauncher>,
    prober: Arc<dyn PortProber>,
    killer: Arc<dyn ProcessKiller>,
    pool: SessionPool,
    registry: SessionRegistry,
    diagnostics: DiagnosticsGate,
    shared: Mutex<Option<Arc<SharedEngine>>>,
    next_id: AtomicU64,
}

impl EngineRuntime {
    pub fn builder(settings: EngineSettings) -> EngineRuntimeBuilder {
        EngineRuntimeBuilder {
            settings,
            locator: None,
            launcher: None,
            prober: None,
            killer: None,
        }
    }

    /// The process-wide runtime, created from the default settings on first use.
    pub fn global() -> Result<Arc<EngineRuntime>> {
        if let Some(runtime) = GLOBAL.get() {
            return Ok(Arc::clone(runtime));
        }
        let settings = EngineSettings::load_default()?;
        let runtime = GLOBAL.get_or_init(|| Self::builder(settings).build());
        Ok(Arc::clone(runtime))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn diagnostics(&self) -> &DiagnosticsGate {
        &self.diagnostics
    }

    pub fn locator(&self) -> &EngineLocator {
        &self.locator
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Resolve the engine installation (cached after the first success).
    pub fn resolve_installation(&self) -> Result<EngineInstallation> {
        self.locator.resolve_home()
    }

    /// A fresh pooled worker.
    pub fn acquire_worker(&self, installation: &EngineInstallation) -> Result<EngineProcessHandle> {
        self.pool.acquire_worker(installation)
    }

    /// The shared engine, started on first use.
    pub fn shared_engine(&self, installation: &EngineInstallation) -> Result<Arc<SharedEngine>> {
        let mut shared = self.shared.lock().map_err(lock_error)?;
        if let Some(engine) = shared.as_ref() {
            return Ok(Arc::clone(engine));
        }

        let port = self.prober.next_free_port()?;
        let config = EngineConnectionConfig {
            host: self.settings.host.clone(),
            port,
            credentials: Credentials::generate(),
            work_dir: self.settings.work_dir(),
        };
        let handle = EngineProcessHandle::spawn(
            self.launcher.as_ref(),
            installation,
            config,
            LaunchRole::Worker,
            Arc::clone(&self.killer),
            RetryPolicy::from_settings(&self.settings),
        )?;
        tracing::info!("started shared R engine (pid {}) on port {}", handle.pid(), port);

        let engine = Arc::new(SharedEngine {
            handle: Mutex::new(handle),
        });
        *shared = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// Forget the shared engine after it was lost, if it is still the current one.
    ///
    /// The next embedded session starts a fresh instance.
    pub(crate) fn discard_shared_engine(&self, stale: &Arc<SharedEngine>) {
        let current = {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.as_ref().is_some_and(|engine| Arc::ptr_eq(engine, stale)) {
                shared.take()
            } else {
                None
            }
        };
        if let Some(engine) = current {
            tracing::warn!("shared R engine lost, it will be restarted");
            self.terminate_shared(&engine);
        }
    }

    fn terminate_shared(&self, engine: &SharedEngine) {
        let mut handle = engine.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let _mute = self.diagnostics.mute();
        if let Err(e) = handle.force_kill() {
            tracing::warn!("could not terminate shared R engine: {}", e);
        }
        handle.release();
    }

    /// Close every session, then release the master and the shared engine.
    ///
    /// Safe to call more than once. Applications call this on normal exit
    /// and from their interrupt handler.
    pub fn shutdown(&self) -> CleanupSummary {
        let summary = self.registry.clean_all();
        self.pool.release_master();

        let shared = self
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(engine) = shared {
            self.terminate_shared(&engine);
            tracing::info!("shared R engine released");
        }
        summary
    }
}
