//! Shared helpers for CLI commands.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use hybridcloud_sim::RunSummary;
use hybridcloud_sim::config::SimConfig;
use hybridcloud_sim::cost::PowerModel;
use hybridcloud_sim::generator::ArrivalRecord;

/// Load the simulation config: file (if any), then environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<SimConfig> {
    if let Some(path) = path {
        if !path.exists() {
            anyhow::bail!("File not found: {}", path.display());
        }
    }
    SimConfig::load(path).with_context(|| match path {
        Some(p) => format!("Failed to load config: {}", p.display()),
        None => "Invalid default configuration".to_string(),
    })
}

/// Load an arrival trace: a YAML or JSON list of records with a `timestamp`
/// and optional job attributes.
pub fn load_arrivals(path: &Path) -> Result<Vec<ArrivalRecord>> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }

    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let records = match ext.to_lowercase().as_str() {
        "json" => serde_json::from_str(&source)
            .map_err(|e| anyhow::anyhow!("Parse error in {}: {e}", path.display()))?,
        _ => serde_yaml_ng::from_str(&source)
            .map_err(|e| anyhow::anyhow!("Parse error in {}: {e}", path.display()))?,
    };
    Ok(records)
}

/// Short human form of a power model.
pub fn describe_power(model: &PowerModel) -> String {
    match model {
        PowerModel::Constant(kw) => format!("{kw} kW"),
        PowerModel::Affine { idle_kw, peak_kw } => format!("{idle_kw}..{peak_kw} kW"),
    }
}

/// Print a run summary in table form.
pub fn print_summary(summary: &RunSummary) {
    println!(
        "\n{} Simulation finished at t={:.4} (seed {}, broker {})",
        style("✓").green().bold(),
        summary.end_time,
        summary.seed,
        style(&summary.broker).cyan()
    );
    println!(
        "  Jobs: {} arrived, {} completed, {} failed, {} in flight",
        summary.arrived,
        style(summary.completed).green(),
        if summary.failed > 0 {
            style(summary.failed).red()
        } else {
            style(summary.failed).dim()
        },
        summary.in_flight
    );
    println!(
        "  Energy: {:.4} kWh   Cost: {:.4}",
        summary.total_energy_kwh,
        style(summary.total_cost).yellow()
    );

    println!(
        "\n  {:<16} {:<6} {:>8} {:>8} {:>10} {:>10}",
        "device", "class", "served", "failed", "busy [s]", "kWh"
    );
    for device in &summary.devices {
        println!(
            "  {:<16} {:<6} {:>8} {:>8} {:>10.3} {:>10.4}",
            style(&device.name).bold(),
            device.class,
            device.phases_served,
            device.phases_failed,
            device.busy_time_s,
            device.energy_kwh
        );
    }
}
