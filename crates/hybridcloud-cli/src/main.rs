//! Hybrid cloud simulator command-line interface.
//!
//! ```text
//! hybridcloud run --config cloud.yaml --max-jobs 50 --format json
//! hybridcloud run --config cloud.yaml --arrivals trace.json
//! hybridcloud validate --config cloud.yaml
//! hybridcloud devices --config cloud.yaml
//! ```

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;

mod commands;
mod tracing_config;

use commands::{devices, run, validate};

/// Discrete-event simulation of QPU/CPU hybrid cloud workloads
#[derive(Parser)]
#[command(name = "hybridcloud")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (YAML or JSON)
    #[arg(short, long, global = true, env = "HYBRIDCLOUD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation and print its summary
    Run {
        /// Replay arrivals from a YAML/JSON file instead of generating them
        #[arg(short, long)]
        arrivals: Option<PathBuf>,

        /// Override the random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Stop the clock at this simulated time
        #[arg(long)]
        horizon: Option<f64>,

        /// Stop generating after this many jobs
        #[arg(long)]
        max_jobs: Option<u64>,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,

        /// Write the JSON summary to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a configuration without running it
    Validate,

    /// List the configured devices
    Devices,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli) {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = commands::common::load_config(cli.config.as_deref())?;

    let tracing = tracing_config::TracingConfig::from_logging(&config.logging, cli.verbose)?;
    tracing_config::init_tracing(&tracing)?;

    match cli.command {
        Commands::Run {
            arrivals,
            seed,
            horizon,
            max_jobs,
            format,
            output,
        } => run::execute(
            config,
            &run::RunOptions {
                arrivals,
                seed,
                horizon,
                max_jobs,
                format,
                output,
            },
        ),

        Commands::Validate => {
            validate::execute(&config, cli.config.as_deref());
            Ok(())
        }

        Commands::Devices => devices::execute(&config),
    }
}
