//! Sessions: the per-task view of an engine instance.

mod pool;
mod registry;
mod runtime;
mod wrapper;

use std::fmt;

pub use pool::SessionPool;
pub use registry::{CleanupSummary, SessionRegistry};
pub use runtime::{EngineRuntime, EngineRuntimeBuilder, SharedEngine};
pub use wrapper::SessionWrapper;

/// Identity of a session within its runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a [`SessionWrapper`].
///
/// `Created → Opening → Ready → Closing → Closed`. Cancellation is a
/// separate flag that can be raised in `Opening` or `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Created,
    Opening,
    Ready,
    Closing,
    Closed,
}

/// Result of a round trip that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Done(T),
    /// The session was canceled or closed; nothing was (or will be) returned.
    NotRunning,
}

impl<T> Outcome<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done(_))
    }

    /// The value, or `None` when the session is not running.
    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            Outcome::NotRunning => None,
        }
    }
}

/// A package a computation needs, optionally with a minimum version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequiredPackage {
    pub name: String,
    pub min_version: Option<String>,
}

impl RequiredPackage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_version: None,
        }
    }

    pub fn at_least(mut self, version: impl Into<String>) -> Self {
        self.min_version = Some(version.into());
        self
    }
}

impl From<&str> for RequiredPackage {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl<N: Into<String>, V: Into<String>> From<(N, Option<V>)> for RequiredPackage {
    fn from((name, version): (N, Option<V>)) -> Self {
        Self {
            name: name.into(),
            min_version: version.map(Into::into),
        }
    }
}
