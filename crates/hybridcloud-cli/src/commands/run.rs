//! Run command implementation.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use console::style;
use tracing::debug;

use hybridcloud_sim::HybridCloudSim;
use hybridcloud_sim::config::SimConfig;
use hybridcloud_sim::generator::JobFeed;

use super::common::{load_arrivals, print_summary};

/// Flags of the run command.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub arrivals: Option<PathBuf>,
    pub seed: Option<u64>,
    pub horizon: Option<f64>,
    pub max_jobs: Option<u64>,
    pub format: String,
    pub output: Option<PathBuf>,
}

/// Apply command-line overrides on top of the loaded config.
pub fn apply_overrides(mut config: SimConfig, options: &RunOptions) -> Result<SimConfig> {
    if let Some(seed) = options.seed {
        config.seed = seed;
    }
    if let Some(horizon) = options.horizon {
        config.horizon = Some(horizon);
    }
    if let Some(max_jobs) = options.max_jobs {
        config.workload.max_jobs = Some(max_jobs);
    }
    config.validate()?;
    Ok(config)
}

/// Execute the run command.
pub fn execute(config: SimConfig, options: &RunOptions) -> Result<()> {
    if !matches!(options.format.as_str(), "table" | "json") {
        anyhow::bail!("Unknown format: '{}'. Available: table, json", options.format);
    }

    let config = apply_overrides(config, options)?;

    let feed = match &options.arrivals {
        Some(path) => {
            let records = load_arrivals(path)?;
            debug!(records = records.len(), path = %path.display(), "loaded arrival trace");
            JobFeed::dispatcher(records)?
        }
        None => config.workload.feed(),
    };

    let mut sim = HybridCloudSim::from_config(&config)?;
    let summary = sim.run(feed, config.horizon)?;

    let json = summary.to_json()?;
    if let Some(path) = &options.output {
        fs::write(path, &json)
            .with_context(|| format!("Failed to write output: {}", path.display()))?;
    }

    match options.format.as_str() {
        "json" => println!("{json}"),
        _ => {
            print_summary(&summary);
            if let Some(path) = &options.output {
                println!("\n  Summary written to {}", style(path.display()).cyan());
            }
        }
    }

    Ok(())
}
