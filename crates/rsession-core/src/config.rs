//! Engine settings.
//!
//! Settings are plain serde data with defaults for every field, so a JSON
//! file only needs to name what it changes:
//!
//! ```json
//! { "topology": "process_per_worker", "base_port": 7311 }
//! ```
//!
//! A few environment variables override the file (see
//! [`EngineSettings::with_env_overrides`]).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming the worker binary.
pub const WORKER_PATH_VAR: &str = "RSESSION_WORKER_PATH";
/// Environment variable forcing a deployment topology.
pub const TOPOLOGY_VAR: &str = "RSESSION_TOPOLOGY";
/// Environment variable overriding the first probed port.
pub const BASE_PORT_VAR: &str = "RSESSION_BASE_PORT";

/// Which flavor of engine a session is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// One shared, non-reentrant instance for the whole process.
    /// Every round trip takes the process-wide engine lock.
    EmbeddedSingleton,
    /// An independent worker process per session.
    #[default]
    PooledWorker,
}

/// How pooled workers are brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Every session launches its own worker process on a fresh port.
    ProcessPerWorker,
    /// A long-lived master instance spawns workers on request.
    MasterProxy,
}

impl Topology {
    /// Windows cannot fork engine instances cheaply, everything else can.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Topology::ProcessPerWorker
        } else {
            Topology::MasterProxy
        }
    }
}

impl FromStr for Topology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "process_per_worker" | "direct" => Ok(Topology::ProcessPerWorker),
            "master_proxy" | "master" => Ok(Topology::MasterProxy),
            other => Err(Error::Config(format!("unknown topology '{}'", other))),
        }
    }
}

/// Settings for locating, launching and talking to engine instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Environment variable naming the engine installation root.
    pub home_variable: String,
    /// Installation roots probed, in order, when the variable is unusable.
    pub probe_paths: Vec<PathBuf>,
    /// Default engine kind for new sessions.
    pub kind: EngineKind,
    /// Deployment topology; `None` picks the platform default.
    pub topology: Option<Topology>,
    /// Loopback host workers listen on.
    pub host: String,
    /// First port probed when allocating a worker port.
    pub base_port: u16,
    /// Number of consecutive ports probed before giving up.
    pub port_window: u16,
    /// Connection attempts before a started worker is declared dead.
    pub connect_attempts: u32,
    /// Delay between connection attempts.
    pub connect_retry_delay_ms: u64,
    /// Pause between the soft and the hard termination signal.
    pub kill_grace_ms: u64,
    /// Working directory for worker processes.
    pub work_dir: Option<PathBuf>,
    /// Explicit path to the `rsession-worker` binary.
    pub worker_binary: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            home_variable: "R_HOME".to_string(),
            probe_paths: Self::default_probe_paths(),
            kind: EngineKind::default(),
            topology: None,
            host: "127.0.0.1".to_string(),
            base_port: 6311,
            port_window: 1000,
            connect_attempts: 5,
            connect_retry_delay_ms: 500,
            kill_grace_ms: 50,
            work_dir: None,
            worker_binary: None,
        }
    }
}

impl EngineSettings {
    /// Well-known installation roots, highest priority first.
    pub fn default_probe_paths() -> Vec<PathBuf> {
        if cfg!(windows) {
            return Vec::new();
        }
        [
            "/Library/Frameworks/R.framework/Resources",
            "/usr/local/lib/R",
            "/usr/lib/R",
            "/usr/lib64/R",
            "/opt/R/lib/R",
            "/sw/lib/R",
            "/usr/common/lib/R",
            "/opt/lib/R",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    }

    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid settings in {}: {}", path.display(), e)))
    }

    /// Default settings file location (`<config dir>/rsession/settings.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rsession").join("settings.json"))
    }

    /// Load the default settings file if present, then apply environment overrides.
    pub fn load_default() -> Result<Self> {
        let settings = match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path)?,
            _ => Self::default(),
        };
        settings.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = lookup(WORKER_PATH_VAR).filter(|p| !p.is_empty()) {
            self.worker_binary = Some(PathBuf::from(path));
        }
        if let Some(topology) = lookup(TOPOLOGY_VAR).filter(|t| !t.is_empty()) {
            self.topology = Some(topology.parse()?);
        }
        if let Some(port) = lookup(BASE_PORT_VAR).filter(|p| !p.is_empty()) {
            self.base_port = port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{} is not a port: '{}'", BASE_PORT_VAR, port)))?;
        }
        Ok(self)
    }

    /// Effective topology.
    pub fn topology(&self) -> Topology {
        self.topology.unwrap_or_else(Topology::platform_default)
    }

    /// Effective working directory for workers.
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("rsession"))
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{ "topology": "process_per_worker", "base_port": 7311 }"#).unwrap();

        let settings = EngineSettings::load(&path).unwrap();
        assert_eq!(settings.topology(), Topology::ProcessPerWorker);
        assert_eq!(settings.base_port, 7311);
        assert_eq!(settings.home_variable, "R_HOME");
        assert_eq!(settings.connect_attempts, 5);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(EngineSettings::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (WORKER_PATH_VAR, "/opt/rsession/bin/rsession-worker"),
            (TOPOLOGY_VAR, "master"),
            (BASE_PORT_VAR, "9000"),
        ]
        .into_iter()
        .collect();

        let settings = EngineSettings::default()
            .with_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(
            settings.worker_binary.as_deref(),
            Some(Path::new("/opt/rsession/bin/rsession-worker"))
        );
        assert_eq!(settings.topology(), Topology::MasterProxy);
        assert_eq!(settings.base_port, 9000);
    }

    #[test]
    fn test_bad_port_override_rejected() {
        let result = EngineSettings::default().with_env_overrides(|key| {
            (key == BASE_PORT_VAR).then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
