//! Validate command implementation.

use std::path::Path;

use console::style;

use hybridcloud_sim::config::SimConfig;

/// Execute the validate command. `config` was validated while loading, so
/// this only reports what was accepted.
pub fn execute(config: &SimConfig, path: Option<&Path>) {
    let source = path.map_or_else(|| "defaults".to_string(), |p| p.display().to_string());
    println!(
        "{} Configuration OK ({})",
        style("✓").green().bold(),
        style(source).cyan()
    );
    println!("  Seed: {}", config.seed);
    match config.horizon {
        Some(h) => println!("  Horizon: {h}"),
        None => println!("  Horizon: none"),
    }
    println!("  Devices: {}", config.devices.len());
    println!(
        "  Broker phases: {}",
        config
            .broker
            .required_classes()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    match config.workload.max_jobs {
        Some(n) => println!("  Max jobs: {n}"),
        None => println!("  Max jobs: unbounded"),
    }
    println!(
        "  Electricity price: {} per kWh",
        config.cost.electricity_price_per_kwh
    );
}
