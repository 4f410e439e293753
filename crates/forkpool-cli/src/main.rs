//! forkpool CLI - run demo workloads on the fork-based task engine.

mod colors;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use forkpool_core::EngineConfig;

#[derive(Parser)]
#[command(name = "forkpool")]
#[command(about = "Run closures in forked worker processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic batch of tasks and report every outcome
    Run {
        /// Number of tasks to submit
        #[arg(short, long, default_value = "8")]
        tasks: u64,

        /// Upper bound on concurrent workers (overrides the config file)
        #[arg(short = 'p', long)]
        max_processes: Option<usize>,

        /// How long each task sleeps before answering
        #[arg(long, default_value = "100")]
        sleep_ms: u64,

        /// Make every Nth task fail with an error
        #[arg(long)]
        fail_every: Option<u64>,

        /// Collect results from the calling thread instead of a dispatcher
        #[arg(long)]
        no_background_thread: bool,

        /// JSON engine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the effective engine configuration as JSON
    Config {
        /// JSON engine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
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
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            tasks,
            max_processes,
            sleep_ms,
            fail_every,
            no_background_thread,
            config,
        } => {
            let mut engine_config = load_config(config.as_deref())?;
            if let Some(max_processes) = max_processes {
                engine_config = engine_config.with_max_processes(max_processes);
            }
            if no_background_thread {
                engine_config = engine_config.with_background_thread(false);
            }

            let workload = run::Workload {
                tasks,
                sleep_ms,
                fail_every,
            };
            run::execute(engine_config, &workload)?;
        }

        Commands::Config { config } => {
            let engine_config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&engine_config)?);
        }
    }

    Ok(())
}

/// Load a config file, or fall back to the defaults.
fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_path(path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e)),
        None => Ok(EngineConfig::default()),
    }
}
