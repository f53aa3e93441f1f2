//! Stress command implementation.
//!
//! Opens many sessions concurrently, has each bind and read back its own
//! marker, and reports which engine process served it.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::bail;
use rsession_core::{EngineKind, EngineRuntime, Outcome, Progress, SessionId, SessionWrapper, Value};

use crate::colors;

const MARKER: &str = "rsession_marker";

struct SessionReport {
    id: SessionId,
    pid: i32,
    /// Whether the marker read back is the one this session bound.
    isolated: bool,
}

fn exercise(runtime: &Arc<EngineRuntime>, kind: EngineKind, index: usize) -> anyhow::Result<SessionReport> {
    let session = SessionWrapper::new(runtime, kind, vec![]);
    session.open()?;

    let marker = index as f64;
    let isolated = match session.assign(MARKER, marker)? {
        Outcome::Done(()) => session.collect(MARKER)?.done() == Some(Value::Scalar(marker)),
        Outcome::NotRunning => false,
    };
    let report = SessionReport {
        id: session.id(),
        pid: session.pid(),
        isolated,
    };
    session.close(false)?;
    Ok(report)
}

pub async fn execute(runtime: Arc<EngineRuntime>, sessions: usize, kind: EngineKind) -> anyhow::Result<()> {
    let start = Instant::now();
    println!(
        "{}Opening{} {} {:?} sessions",
        colors::BOLD,
        colors::RESET,
        sessions,
        kind
    );

    let progress = Arc::new(Progress::new(sessions));
    let stop = Arc::new(AtomicBool::new(false));

    let reporter = {
        let progress = Arc::clone(&progress);
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || {
            progress.wait(Duration::from_millis(200), |fraction| {
                eprint!("\r  {:>3.0}%", fraction * 100.0);
                let _ = std::io::stderr().flush();
                !stop.load(Ordering::SeqCst)
            });
            eprintln!();
        })
    };

    let tasks: Vec<_> = (0..sessions)
        .map(|index| {
            let runtime = Arc::clone(&runtime);
            let progress = Arc::clone(&progress);
            tokio::task::spawn_blocking(move || {
                let report = exercise(&runtime, kind, index);
                progress.advance();
                report
            })
        })
        .collect();

    let collect = async {
        let mut reports = Vec::with_capacity(tasks.len());
        for task in tasks {
            reports.push(task.await?);
        }
        anyhow::Ok(reports)
    };

    let reports = tokio::select! {
        reports = collect => reports?,
        _ = tokio::signal::ctrl_c() => {
            stop.store(true, Ordering::SeqCst);
            let cleaner = Arc::clone(&runtime);
            let summary = tokio::task::spawn_blocking(move || cleaner.registry().clean_all()).await?;
            eprintln!(
                "{}Interrupted{}: closed {} sessions",
                colors::YELLOW,
                colors::RESET,
                summary.closed
            );
            bail!("interrupted")
        }
    };
    stop.store(true, Ordering::SeqCst);
    reporter.await?;

    let mut failures = 0;
    let mut pids = HashSet::new();
    for report in &reports {
        match report {
            Ok(report) => {
                pids.insert(report.pid);
                let status = if report.isolated || kind == EngineKind::EmbeddedSingleton {
                    format!("{}ok{}", colors::GREEN, colors::RESET)
                } else {
                    failures += 1;
                    format!("{}marker mismatch{}", colors::RED, colors::RESET)
                };
                println!("  session {} pid {:>6} {}", report.id, report.pid, status);
            }
            Err(e) => {
                failures += 1;
                println!("  {}failed{}: {}", colors::RED, colors::RESET, e);
            }
        }
    }

    println!(
        "\n{}Completed{} {} sessions on {} engine processes in {:.2}s {}({} failed){}",
        colors::GREEN,
        colors::RESET,
        reports.len(),
        pids.len(),
        start.elapsed().as_secs_f64(),
        colors::DIM,
        failures,
        colors::RESET
    );

    if failures > 0 {
        bail!("{} of {} sessions failed", failures, reports.len());
    }
    Ok(())
}
