//! Eval command implementation.
//!
//! Opens one session, loads the requested packages, evaluates the code and
//! closes the session again. Ctrl-C cancels the session, which severs a
//! running evaluation.

use std::sync::Arc;
use std::time::Instant;

use anyhow::bail;
use rsession_core::{
    EngineKind, EngineRuntime, Error, Outcome, RequiredPackage, SessionWrapper, Value,
};

use crate::colors;
use crate::output::print_value;

/// Parse `NAME` or `NAME>=VERSION`.
pub fn parse_package(spec: &str) -> anyhow::Result<RequiredPackage> {
    let (name, version) = match spec.split_once(">=") {
        Some((name, version)) => (name.trim(), Some(version.trim())),
        None => (spec.trim(), None),
    };
    if name.is_empty() {
        bail!("package spec '{}' has no package name", spec);
    }
    if version == Some("") {
        bail!("package spec '{}' has an empty version", spec);
    }
    Ok((name, version).into())
}

/// Everything the session does between open and close.
fn run(session: &Arc<SessionWrapper>, code: &str) -> rsession_core::Result<Outcome<Value>> {
    session.open()?;
    if let Some(package) = session.load_required_packages() {
        return Err(Error::MissingPackage(package));
    }
    session.check_required_package_versions()?;
    session.eval(code)
}

pub async fn execute(
    runtime: Arc<EngineRuntime>,
    code: String,
    packages: &[String],
    embedded: bool,
) -> anyhow::Result<()> {
    let packages = packages
        .iter()
        .map(|p| parse_package(p))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let kind = if embedded {
        EngineKind::EmbeddedSingleton
    } else {
        runtime.settings().kind
    };

    let start = Instant::now();
    let session = SessionWrapper::new(&runtime, kind, packages);
    let task = {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || {
            let result = run(&session, &code);
            let closed = session.close(false);
            result.and_then(|outcome| closed.map(|()| outcome))
        })
    };

    tokio::select! {
        joined = task => {
            match joined?? {
                Outcome::Done(value) => {
                    print_value(&value);
                    tracing::debug!(
                        "session {} finished in {:.2}s",
                        session.id(),
                        start.elapsed().as_secs_f64()
                    );
                    Ok(())
                }
                Outcome::NotRunning => bail!("session {} stopped before finishing", session.id()),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n{}Canceling session {}{}", colors::YELLOW, session.id(), colors::RESET);
            tokio::task::spawn_blocking(move || session.cancel()).await?;
            bail!("interrupted")
        }
    }
}
