//! Discovery of the R installation and of the worker binary.
//!
//! A failed lookup is always a structured [`Error`] with remediation text,
//! never a crash: the requesting task fails, the host application keeps
//! running.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use crate::config::{EngineSettings, WORKER_PATH_VAR};
use crate::error::{Error, Result};

/// A resolved engine installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInstallation {
    /// Installation root (what `R_HOME` points at).
    pub home: PathBuf,
    /// The `R` front-end.
    pub executable: PathBuf,
    /// The `Rscript` front-end.
    pub script_executable: PathBuf,
}

impl EngineInstallation {
    /// Derive executable paths from an installation root.
    pub fn from_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let bin = home.join("bin");
        let (r, rscript) = if cfg!(windows) {
            ("R.exe", "Rscript.exe")
        } else {
            ("R", "Rscript")
        };
        Self {
            executable: bin.join(r),
            script_executable: bin.join(rscript),
            home,
        }
    }
}

/// Resolves the engine installation once and caches it.
///
/// Search order:
/// 1. the override taken from the home variable (`R_HOME` by default),
///    used only if the path exists
/// 2. the probe paths, first existing one wins
/// 3. the platform itself: the Windows registry, or `R RHOME` for an `R`
///    found on `PATH`
pub struct EngineLocator {
    variable: String,
    override_home: Option<PathBuf>,
    probe_paths: Vec<PathBuf>,
    query_platform: bool,
    cached: Mutex<Option<EngineInstallation>>,
}

impl EngineLocator {
    /// Create a locator with an explicit override and probe list.
    pub fn new(
        variable: impl Into<String>,
        override_home: Option<PathBuf>,
        probe_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            variable: variable.into(),
            override_home,
            probe_paths,
            query_platform: true,
            cached: Mutex::new(None),
        }
    }

    /// Create a locator from settings, reading the home variable from the environment.
    pub fn from_settings(settings: &EngineSettings) -> Self {
        let override_home = std::env::var_os(&settings.home_variable)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::new(
            settings.home_variable.clone(),
            override_home,
            settings.probe_paths.clone(),
        )
    }

    /// Skip step 3 (asking the platform).
    pub fn without_platform_query(mut self) -> Self {
        self.query_platform = false;
        self
    }

    /// Name of the environment variable consulted first.
    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Resolve the installation, using the cached result when available.
    pub fn resolve_home(&self) -> Result<EngineInstallation> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(installation) = cached.as_ref() {
            return Ok(installation.clone());
        }

        let home = self.search().ok_or_else(|| Error::InstallationNotFound {
            variable: self.variable.clone(),
            searched: self.probe_paths.clone(),
        })?;

        tracing::info!("R installation resolved to '{}'", home.display());
        let installation = EngineInstallation::from_home(home);
        *cached = Some(installation.clone());
        Ok(installation)
    }

    fn search(&self) -> Option<PathBuf> {
        if let Some(home) = &self.override_home {
            if home.exists() {
                return Some(home.clone());
            }
            tracing::warn!(
                "'{}' points at '{}', which does not exist; probing default locations",
                self.variable,
                home.display()
            );
        }

        if let Some(home) = self.probe_paths.iter().find(|p| p.exists()) {
            return Some(home.clone());
        }

        if self.query_platform {
            return query_platform().filter(|home| home.exists());
        }

        None
    }
}

#[cfg(windows)]
fn query_platform() -> Option<PathBuf> {
    let output = Command::new("reg")
        .args(["query", r"HKLM\Software\R-core\R", "/v", "InstallPath"])
        .output()
        .map_err(|e| tracing::debug!("registry query failed: {}", e))
        .ok()?;
    parse_install_path(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(not(windows))]
fn query_platform() -> Option<PathBuf> {
    let r = which::which("R").ok()?;
    let output = Command::new(&r)
        .arg("RHOME")
        .output()
        .map_err(|e| tracing::debug!("'{} RHOME' failed: {}", r.display(), e))
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let home = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!home.is_empty()).then(|| PathBuf::from(home))
}

/// Extract the `InstallPath` value from `reg query` output.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_install_path(reg_output: &str) -> Option<PathBuf> {
    reg_output.lines().find_map(|line| {
        let rest = &line[line.find("InstallPath")? + "InstallPath".len()..];
        let value = match rest.find("REG_SZ") {
            Some(i) => &rest[i + "REG_SZ".len()..],
            None => rest,
        };
        let value = value.trim();
        (!value.is_empty()).then(|| PathBuf::from(value))
    })
}

fn worker_file_name() -> &'static str {
    if cfg!(windows) {
        "rsession-worker.exe"
    } else {
        "rsession-worker"
    }
}

/// Find the `rsession-worker` binary.
///
/// Looks in the following order:
/// 1. the configured path (`worker_binary`, or `RSESSION_WORKER_PATH`)
/// 2. same directory as the current executable
/// 3. system PATH
/// 4. for development: `target/debug` or `target/release`
pub fn locate_worker_binary(settings: &EngineSettings) -> Result<PathBuf> {
    if let Some(path) = &settings.worker_binary {
        if path.exists() {
            return Ok(path.clone());
        }
        tracing::warn!("configured worker binary '{}' does not exist", path.display());
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let worker_path = exe_dir.join(worker_file_name());
        if worker_path.exists() {
            return Ok(worker_path);
        }
        // Test binaries live one level below the profile directory.
        if let Some(profile_dir) = exe_dir.parent() {
            let worker_path = profile_dir.join(worker_file_name());
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(worker_file_name()) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = Path::new(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(worker_file_name());
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::startup(format!(
        "could not find the {} binary; set {} or install it next to the application",
        worker_file_name(),
        WORKER_PATH_VAR
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_override_wins_when_it_exists() {
        let temp = TempDir::new().unwrap();
        let probe = TempDir::new().unwrap();
        let locator = EngineLocator::new(
            "R_HOME",
            Some(temp.path().to_path_buf()),
            vec![probe.path().to_path_buf()],
        )
        .without_platform_query();

        let installation = locator.resolve_home().unwrap();
        assert_eq!(installation.home, temp.path());
        assert!(installation.executable.starts_with(temp.path().join("bin")));
    }

    #[test]
    fn test_missing_override_falls_back_to_probes() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope");
        let second = temp.path().join("second");
        std::fs::create_dir(&second).unwrap();

        let locator = EngineLocator::new(
            "R_HOME",
            Some(missing.clone()),
            vec![temp.path().join("first-missing"), second.clone()],
        )
        .without_platform_query();

        assert_eq!(locator.resolve_home().unwrap().home, second);
    }

    #[test]
    fn test_nothing_found_is_structured_error() {
        let temp = TempDir::new().unwrap();
        let locator = EngineLocator::new("R_HOME", Some(temp.path().join("nope")), vec![])
            .without_platform_query();

        match locator.resolve_home() {
            Err(Error::InstallationNotFound { variable, .. }) => assert_eq!(variable, "R_HOME"),
            other => panic!("expected InstallationNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_result_is_cached() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("R");
        std::fs::create_dir(&home).unwrap();
        let locator = EngineLocator::new("R_HOME", Some(home.clone()), vec![]).without_platform_query();

        assert_eq!(locator.resolve_home().unwrap().home, home);
        std::fs::remove_dir(&home).unwrap();
        assert_eq!(locator.resolve_home().unwrap().home, home);
    }

    #[test]
    fn test_configured_worker_binary_wins() {
        let temp = TempDir::new().unwrap();
        let worker = temp.path().join(worker_file_name());
        std::fs::write(&worker, b"").unwrap();

        let settings = EngineSettings {
            worker_binary: Some(worker.clone()),
            ..EngineSettings::default()
        };
        assert_eq!(locate_worker_binary(&settings).unwrap(), worker);
    }

    #[test]
    fn test_parse_registry_output() {
        let output = "\r\nHKEY_LOCAL_MACHINE\\Software\\R-core\\R\r\n    InstallPath    REG_SZ    C:\\Program Files\\R\\R-4.3.1\r\n";
        assert_eq!(
            parse_install_path(output),
            Some(PathBuf::from("C:\\Program Files\\R\\R-4.3.1"))
        );
        assert_eq!(parse_install_path("ERROR: not found"), None);
    }
}
