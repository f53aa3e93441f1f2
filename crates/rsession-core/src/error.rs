//! Error types for rsession-core.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for rsession-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of round trip issued to an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Eval,
    Assign,
    Collect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Eval => f.write_str("eval"),
            Operation::Assign => f.write_str("assign"),
            Operation::Collect => f.write_str("collect"),
        }
    }
}

/// Failure of a single round trip with an engine instance.
///
/// The two variants must stay distinguishable: a transport failure is fatal
/// for the handle, an evaluation failure leaves the instance usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineFault {
    /// The instance is busy, unreachable, or gone (broken pipe, reset, EOF).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The expression was evaluated but raised an engine-level error.
    #[error("engine error: {0}")]
    Eval(String),
}

impl EngineFault {
    /// Whether the failure happened at the transport level.
    pub fn is_transport(&self) -> bool {
        matches!(self, EngineFault::Transport(_))
    }
}

/// Failure to terminate an engine process.
#[derive(Debug, Error)]
pub enum KillError {
    /// Signal delivery failed for a reason other than "no such process".
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// The external termination utility reported failure.
    #[error("`{command}` failed for pid {pid} ({status}): {stderr}")]
    Command {
        command: String,
        pid: u32,
        status: String,
        stderr: String,
    },

    /// The external termination utility could not be started.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur in rsession-core.
#[derive(Debug, Error)]
pub enum Error {
    /// No usable engine installation could be resolved.
    #[error("R installation directory not found (checked '{variable}' and {} fallback location(s))", searched.len())]
    InstallationNotFound {
        /// Environment variable consulted first.
        variable: String,
        /// Locations probed after the variable.
        searched: Vec<PathBuf>,
    },

    /// An engine instance could not be started or never became reachable.
    #[error("could not start R engine instance: {reason}")]
    StartupFailed { reason: String },

    /// A round trip failed for a reason other than user cancellation.
    #[error("couldn't {op} '{target}' (instance pid {pid}): {fault}")]
    RoundTrip {
        op: Operation,
        target: String,
        pid: i32,
        #[source]
        fault: EngineFault,
    },

    /// A required package failed to load.
    #[error("the \"{0}\" R package couldn't be loaded - is it installed in R?")]
    MissingPackage(String),

    /// A required package is installed in a version older than required.
    #[error("an old version of the '{package}' package is installed in R - please update '{package}' to version {required} or later")]
    PackageVersionTooOld { package: String, required: String },

    /// The backing process could not be terminated.
    #[error("{}", kill_message(pid, canceled))]
    KillFailed {
        pid: i32,
        canceled: bool,
        #[source]
        source: KillError,
    },

    /// A round trip was requested before the session was opened.
    #[error("session {0} is not open")]
    NotOpen(u64),

    /// A session lock was poisoned by a panicking thread.
    #[error("session lock poisoned (thread panicked): {0}")]
    LockPoisoned(String),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unreadable settings.
    #[error("configuration error: {0}")]
    Config(String),
}

fn kill_message(pid: &i32, canceled: &bool) -> String {
    if *canceled {
        format!("couldn't terminate R instance with pid '{}'", pid)
    } else {
        format!("something went wrong with R instance of pid '{}'", pid)
    }
}

impl Error {
    /// Shorthand for a startup failure.
    pub fn startup(reason: impl Into<String>) -> Self {
        Error::StartupFailed {
            reason: reason.into(),
        }
    }

    /// User-actionable remediation text, if any.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Error::InstallationNotFound { variable, .. } => Some(format!(
                "Set the '{}' environment variable to the R installation directory, \
                 or install R (https://cran.r-project.org/).",
                variable
            )),
            Error::StartupFailed { .. } => Some(
                "Check that R is installed and that the rsession-worker binary is available \
                 (set RSESSION_WORKER_PATH if it is not next to the application)."
                    .to_string(),
            ),
            Error::MissingPackage(name) => Some(format!(
                "Install the package from R: install.packages(\"{}\")",
                name
            )),
            Error::PackageVersionTooOld { package, .. } => Some(format!(
                "Upgrade the package from R: install.packages(\"{}\")",
                package
            )),
            Error::KillFailed { pid, .. } => Some(format!(
                "Process {} may still be running; terminate it manually.",
                pid
            )),
            _ => None,
        }
    }

    /// Render the error followed by its remediation hint.
    pub fn with_hint(&self) -> String {
        match self.remediation() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }

    /// Whether this is a round trip that failed at the transport level.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::RoundTrip { fault, .. } if fault.is_transport())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_message_depends_on_cancellation() {
        let canceled = Error::KillFailed {
            pid: 42,
            canceled: true,
            source: KillError::Command {
                command: "taskkill".to_string(),
                pid: 42,
                status: "exit code 1".to_string(),
                stderr: String::new(),
            },
        };
        assert!(canceled.to_string().contains("couldn't terminate"));

        let unexpected = Error::KillFailed {
            pid: 42,
            canceled: false,
            source: KillError::Command {
                command: "taskkill".to_string(),
                pid: 42,
                status: "exit code 1".to_string(),
                stderr: String::new(),
            },
        };
        assert!(unexpected.to_string().contains("something went wrong"));
    }

    #[test]
    fn test_installation_hint_names_variable() {
        let err = Error::InstallationNotFound {
            variable: "R_HOME".to_string(),
            searched: vec![PathBuf::from("/usr/lib/R")],
        };
        assert!(err.with_hint().contains("'R_HOME'"));
    }

    #[test]
    fn test_transport_classification() {
        let err = Error::RoundTrip {
            op: Operation::Eval,
            target: "x <- 1".to_string(),
            pid: 7,
            fault: EngineFault::Transport("connection reset".to_string()),
        };
        assert!(err.is_transport());
        assert!(err.to_string().contains("pid 7"));

        let err = Error::RoundTrip {
            op: Operation::Eval,
            target: "stop('x')".to_string(),
            pid: 7,
            fault: EngineFault::Eval("x".to_string()),
        };
        assert!(!err.is_transport());
    }
}
