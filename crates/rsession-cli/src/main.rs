//! rsession CLI - run R code in managed engine sessions.

mod colors;
mod eval;
mod locate;
mod output;
mod stress;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use rsession_core::{EngineKind, EngineRuntime, EngineSettings, Topology};

#[derive(Parser)]
#[command(name = "rsession")]
#[command(about = "Run R code in managed engine sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (defaults to <config dir>/rsession/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the worker topology
    #[arg(long, global = true, value_enum)]
    topology: Option<TopologyArg>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the R installation and worker binary that would be used
    Locate,

    /// Evaluate R code in a fresh session
    Eval {
        /// R source to evaluate
        code: String,

        /// Package to load first, as NAME or NAME>=VERSION (repeatable)
        #[arg(short, long = "package")]
        packages: Vec<String>,

        /// Run in the shared embedded engine instead of a dedicated worker
        #[arg(long)]
        embedded: bool,
    },

    /// Open many sessions at once and check they stay isolated
    Stress {
        /// Number of concurrent sessions
        #[arg(short, long, default_value = "4")]
        sessions: usize,

        /// Engine kind used by every session
        #[arg(long, value_enum, default_value = "pooled")]
        kind: KindArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Pooled,
    Embedded,
}

impl From<KindArg> for EngineKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Pooled => EngineKind::PooledWorker,
            KindArg::Embedded => EngineKind::EmbeddedSingleton,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TopologyArg {
    Process,
    Master,
}

impl From<TopologyArg> for Topology {
    fn from(topology: TopologyArg) -> Self {
        match topology {
            TopologyArg::Process => Topology::ProcessPerWorker,
            TopologyArg::Master => Topology::MasterProxy,
        }
    }
}

/// Settings from `--config` or the default location, with environment overrides.
fn load_settings(config: Option<&Path>, topology: Option<TopologyArg>) -> anyhow::Result<EngineSettings> {
    let mut settings = match config {
        Some(path) => EngineSettings::load(path)?.with_env_overrides(|key| std::env::var(key).ok())?,
        None => EngineSettings::load_default()?,
    };
    if let Some(topology) = topology {
        settings.topology = Some(topology.into());
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Helper to format rsession-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<rsession_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    let settings = load_settings(cli.config.as_deref(), cli.topology).map_err(format_error)?;
    let runtime = EngineRuntime::builder(settings).build();

    let result = match cli.command {
        Commands::Locate => locate::execute(&runtime),

        Commands::Eval {
            code,
            packages,
            embedded,
        } => eval::execute(Arc::clone(&runtime), code, &packages, embedded).await,

        Commands::Stress { sessions, kind } => {
            stress::execute(Arc::clone(&runtime), sessions, kind.into()).await
        }
    };

    // Engines must not outlive the CLI, whatever happened above
    let summary = tokio::task::spawn_blocking(move || runtime.shutdown()).await?;
    if summary.failed > 0 {
        tracing::warn!("{} engine processes could not be terminated", summary.failed);
    }

    result.map_err(format_error)
}
