//! `dotclaw` -- host binary for the dotclaw assistant gateway.
//!
//! Subcommands:
//!
//! - `dotclaw start` -- run the host (pipeline, scheduler, jobs, IPC,
//!   maintenance).
//! - `dotclaw doctor` -- environment and configuration diagnostics.
//! - `dotclaw init` -- create the data directory layout and default
//!   config files.
//! - `dotclaw bootstrap` -- guided first-time setup (init plus an `.env`
//!   template).
//! - `dotclaw build` -- build the agent container image.
//! - `dotclaw benchmark` -- baseline and trace-harness benchmarks.

use clap::{Parser, Subcommand};

mod commands;

/// dotclaw assistant gateway CLI.
#[derive(Parser)]
#[command(name = "dotclaw", about = "dotclaw assistant gateway", version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the data root (defaults to DOTCLAW_HOME or ~/.dotclaw).
    #[arg(long, global = true)]
    data_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Run the host.
    Start,

    /// Check the environment and configuration.
    Doctor,

    /// Create the data directory layout and default config files.
    Init,

    /// Guided first-time setup.
    Bootstrap,

    /// Build the agent container image.
    Build(commands::build::BuildArgs),

    /// Benchmarks.
    Benchmark {
        #[command(subcommand)]
        action: commands::benchmark::BenchmarkCmd,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dotclaw={default},dotclaw_core={default}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let paths = match &cli.data_dir {
        Some(dir) => dotclaw_platform::DataPaths::at(dir.clone()),
        None => dotclaw_platform::DataPaths::resolve()?,
    };

    match cli.command {
        Commands::Start => commands::start::run(paths).await,
        Commands::Doctor => commands::doctor::run(paths).await,
        Commands::Init => commands::init::run(paths).await,
        Commands::Bootstrap => commands::bootstrap::run(paths).await,
        Commands::Build(args) => commands::build::run(paths, args).await,
        Commands::Benchmark { action } => commands::benchmark::run(paths, action).await,
    }
}
