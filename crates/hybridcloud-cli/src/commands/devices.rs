//! Devices command implementation.

use anyhow::Result;
use console::style;

use hybridcloud_sim::HybridCloudSim;
use hybridcloud_sim::config::SimConfig;

use super::common::describe_power;

/// Execute the devices command.
pub fn execute(config: &SimConfig) -> Result<()> {
    let sim = HybridCloudSim::from_config(config)?;
    let cost = sim.ledger().cost_config();

    println!("{} Configured devices:\n", style("hybridcloud").cyan().bold());

    for device in sim.devices() {
        let core = device.core();
        println!(
            "  {} {} ({}, {})",
            style("●").green(),
            style(core.name()).bold(),
            core.class(),
            device.model()
        );
        println!("    Compute units: {}", core.compute().capacity());
        println!("    Bandwidth units: {}", core.bandwidth().capacity());
        println!(
            "    Power: {}",
            describe_power(&cost.power_model(core.class(), core.name()))
        );
        println!();
    }

    Ok(())
}
