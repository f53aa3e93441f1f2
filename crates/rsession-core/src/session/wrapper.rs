//! One computation task's exclusive use of an engine instance.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::EngineKind;
use crate::engine::{EngineProcessHandle, KillSwitch};
use crate::error::{EngineFault, Error, Operation, Result};
use crate::ipc::{Value, quote};

use super::runtime::{EngineRuntime, SharedEngine, lock_error};
use super::{Outcome, RequiredPackage, SessionId, SessionState};

enum Backing {
    Worker(EngineProcessHandle),
    Shared(Arc<SharedEngine>),
}

/// A session on one engine instance.
///
/// Created per computation task and driven by that task's thread; another
/// thread may [`cancel`](Self::cancel) it at any time. Always used behind an
/// `Arc`.
///
/// ```no_run
/// use rsession_core::{EngineKind, EngineRuntime, Outcome, RequiredPackage, SessionWrapper};
///
/// # fn main() -> rsession_core::Result<()> {
/// let runtime = EngineRuntime::global()?;
/// let session = SessionWrapper::new(
///     &runtime,
///     EngineKind::PooledWorker,
///     vec![RequiredPackage::new("stats")],
/// );
/// session.open()?;
/// session.assign("x", vec![1.0, 2.0, 3.0])?;
/// if let Outcome::Done(mean) = session.eval("mean(x)")? {
///     println!("mean = {:?}", mean);
/// }
/// session.close(false)?;
/// # Ok(())
/// # }
/// ```
pub struct SessionWrapper {
    id: SessionId,
    kind: EngineKind,
    runtime: Arc<EngineRuntime>,
    packages: Vec<RequiredPackage>,
    state: Mutex<SessionState>,
    canceled: AtomicBool,
    closing: AtomicBool,
    pid: AtomicI32,
    backing: Mutex<Option<Backing>>,
    kill_switch: Mutex<Option<KillSwitch>>,
}

impl SessionWrapper {
    pub fn new(
        runtime: &Arc<EngineRuntime>,
        kind: EngineKind,
        packages: Vec<RequiredPackage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: runtime.next_session_id(),
            kind,
            runtime: Arc::clone(runtime),
            packages,
            state: Mutex::new(SessionState::Created),
            canceled: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            pid: AtomicI32::new(-1),
            backing: Mutex::new(None),
            kill_switch: Mutex::new(None),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn required_packages(&self) -> &[RequiredPackage] {
        &self.packages
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Engine pid, or -1 when unknown or not applicable (the shared engine).
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Whether the session holds a live instance and has not been stopped.
    pub fn is_running(&self) -> bool {
        !self.is_stopped() && self.state() == SessionState::Ready
    }

    fn is_stopped(&self) -> bool {
        self.is_canceled() || self.closing.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn transition(&self, from: SessionState, to: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
        }
    }

    /// Resolve the installation, acquire an instance and register.
    ///
    /// A session canceled before or during this call ends `Closed` without
    /// a live process and without being registered; that is not an error.
    pub fn open(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_stopped() || *state == SessionState::Closed {
                *state = SessionState::Closed;
                return Ok(());
            }
            if *state != SessionState::Created {
                return Err(Error::startup(format!(
                    "session {} cannot be opened from state {:?}",
                    self.id, *state
                )));
            }
            *state = SessionState::Opening;
        }

        let backing = match self.acquire() {
            Ok(backing) => backing,
            Err(e) => {
                self.set_state(SessionState::Closed);
                if self.is_stopped() {
                    tracing::debug!("session {} canceled during startup: {}", self.id, e);
                    return Ok(());
                }
                return Err(e);
            }
        };

        let mut slot = self.backing.lock().unwrap_or_else(PoisonError::into_inner);
        if let Backing::Worker(handle) = &backing {
            self.pid.store(handle.pid(), Ordering::SeqCst);
            *self.kill_switch.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(handle.kill_switch());
        }

        if self.is_stopped() {
            drop(slot);
            tracing::debug!("session {} canceled while opening, discarding instance", self.id);
            let _mute = self.runtime.diagnostics().mute();
            if let Backing::Worker(mut handle) = backing {
                if let Err(e) = handle.force_kill() {
                    tracing::warn!("{}", e);
                }
                handle.release();
            }
            self.set_state(SessionState::Closed);
            return Ok(());
        }

        *slot = Some(backing);
        self.runtime.registry().register(self);
        self.transition(SessionState::Opening, SessionState::Ready);
        drop(slot);

        tracing::info!("session {} ready ({:?}, pid {})", self.id, self.kind, self.pid());
        Ok(())
    }

    fn acquire(&self) -> Result<Backing> {
        let installation = self.runtime.resolve_installation()?;
        match self.kind {
            EngineKind::EmbeddedSingleton => {
                Ok(Backing::Shared(self.runtime.shared_engine(&installation)?))
            }
            EngineKind::PooledWorker => {
                Ok(Backing::Worker(self.runtime.acquire_worker(&installation)?))
            }
        }
    }

    /// Issue one round trip unless the session is stopped.
    fn round_trip<T>(
        &self,
        op: Operation,
        target: &str,
        call: impl FnOnce(&mut EngineProcessHandle) -> std::result::Result<T, EngineFault>,
    ) -> Result<Outcome<T>> {
        if self.is_stopped() {
            return Ok(Outcome::NotRunning);
        }

        let result = {
            let mut backing = self.backing.lock().map_err(lock_error)?;
            match backing.as_mut() {
                Some(Backing::Worker(handle)) => call(handle),
                Some(Backing::Shared(engine)) => {
                    let result = {
                        let mut handle = engine.lock()?;
                        call(&mut *handle)
                    };
                    if let Err(fault) = &result
                        && fault.is_transport()
                        && !self.is_stopped()
                    {
                        self.runtime.discard_shared_engine(engine);
                    }
                    result
                }
                None if self.is_stopped() || self.state() == SessionState::Closed => {
                    return Ok(Outcome::NotRunning);
                }
                None => return Err(Error::NotOpen(self.id.as_u64())),
            }
        };

        match result {
            Ok(value) => Ok(Outcome::Done(value)),
            Err(fault) if self.is_stopped() => {
                tracing::debug!(
                    "{} of '{}' on session {} interrupted by cancellation: {}",
                    op,
                    target,
                    self.id,
                    fault
                );
                Ok(Outcome::NotRunning)
            }
            Err(fault) => Err(Error::RoundTrip {
                op,
                target: target.to_string(),
                pid: self.pid(),
                fault,
            }),
        }
    }

    /// Bind `value` to `name` in the engine's global environment.
    pub fn assign(&self, name: &str, value: impl Into<Value>) -> Result<Outcome<()>> {
        let value = value.into();
        self.round_trip(Operation::Assign, name, |handle| handle.assign_raw(name, value))
    }

    /// Evaluate engine source text.
    pub fn eval(&self, code: &str) -> Result<Outcome<Value>> {
        self.round_trip(Operation::Eval, code, |handle| handle.eval_raw(code))
    }

    /// Fetch the value bound to `name`.
    pub fn collect(&self, name: &str) -> Result<Outcome<Value>> {
        self.round_trip(Operation::Collect, name, |handle| handle.collect_raw(name))
    }

    /// Load one package, failing with [`Error::MissingPackage`] if it is unavailable.
    pub fn load_package(&self, package: &str) -> Result<Outcome<()>> {
        let code = format!(
            "suppressWarnings(library({}, character.only = TRUE, logical.return = TRUE))",
            quote(package)
        );
        match self.eval(&code) {
            Ok(Outcome::Done(loaded)) if loaded.as_bool() == Some(true) => Ok(Outcome::Done(())),
            Ok(Outcome::Done(_)) => Err(Error::MissingPackage(package.to_string())),
            Ok(Outcome::NotRunning) => Ok(Outcome::NotRunning),
            Err(e) if e.is_transport() => Err(e),
            Err(e) => {
                tracing::debug!("loading '{}' raised: {}", package, e);
                Err(Error::MissingPackage(package.to_string()))
            }
        }
    }

    /// Load the required packages in order.
    ///
    /// Returns the name of the first package that fails to load; the
    /// remaining ones are not attempted. Connectivity failures end the
    /// loop quietly and are left to the next round trip to report.
    pub fn load_required_packages(&self) -> Option<String> {
        for package in &self.packages {
            match self.load_package(&package.name) {
                Ok(Outcome::Done(())) => {}
                Ok(Outcome::NotRunning) => return None,
                Err(Error::MissingPackage(name)) => return Some(name),
                Err(e) => {
                    tracing::debug!("package loading on session {} stopped: {}", self.id, e);
                    return None;
                }
            }
        }
        None
    }

    /// Fail with [`Error::PackageVersionTooOld`] if `package` is older than `minimum`.
    ///
    /// Stays silent when the comparison itself cannot be run.
    pub fn check_package_version(&self, package: &str, minimum: &str) -> Result<()> {
        let code = format!(
            "utils::packageVersion({}) >= {}",
            quote(package),
            quote(minimum)
        );
        match self.eval(&code) {
            Ok(Outcome::Done(recent)) if recent.as_bool() == Some(false) => {
                Err(Error::PackageVersionTooOld {
                    package: package.to_string(),
                    required: minimum.to_string(),
                })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!("version check of '{}' skipped: {}", package, e);
                Ok(())
            }
        }
    }

    /// Check every required package that names a minimum version.
    pub fn check_required_package_versions(&self) -> Result<()> {
        for package in &self.packages {
            if let Some(minimum) = &package.min_version {
                self.check_package_version(&package.name, minimum)?;
            }
        }
        Ok(())
    }

    /// Mark the session canceled and tear it down.
    ///
    /// Any round trip in flight is severed; its caller sees
    /// [`Outcome::NotRunning`]. Termination failures are logged, not returned.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Err(e) = self.close(true) {
            tracing::warn!("{}", e.with_hint());
        }
    }

    /// Terminate the backing instance and unregister.
    ///
    /// Only the first call does anything; later or concurrent calls return
    /// `Ok(())`. Every step runs even if an earlier one failed. A kill
    /// failure is returned as [`Error::KillFailed`], worded by `user_canceled`.
    pub fn close(&self, user_canceled: bool) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.state() != SessionState::Created {
            self.set_state(SessionState::Closing);
        }

        let _mute = self.runtime.diagnostics().mute();

        // Fired before taking the backing lock, so an in-flight round trip
        // fails fast instead of blocking the close.
        let switch = self
            .kill_switch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let killed = match switch {
            Some(switch) if self.kind == EngineKind::PooledWorker => switch.fire(),
            _ => Ok(()),
        };

        let backing = self
            .backing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Backing::Worker(mut handle)) = backing {
            handle.release();
        }

        self.runtime.registry().unregister(self.id);
        self.set_state(SessionState::Closed);
        tracing::debug!("session {} closed (canceled: {})", self.id, user_canceled);

        killed.map_err(|source| Error::KillFailed {
            pid: self.pid(),
            canceled: user_canceled,
            source,
        })
    }
}

impl Drop for SessionWrapper {
    fn drop(&mut self) {
        if self.closing.load(Ordering::SeqCst)
            || matches!(self.state(), SessionState::Created | SessionState::Closed)
        {
            return;
        }
        if let Err(e) = self.close(false) {
            tracing::warn!("session {} dropped without close: {}", self.id, e);
        }
    }
}
