//! Energy and cost configuration.
//!
//! Read-only once a simulation is built; consulted only when the ledger
//! finalizes a job.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::DeviceClass;
use crate::error::{SimError, SimResult};

/// Seconds per hour, for kW x s -> kWh.
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Power draw of a device while it serves a phase.
///
/// Deserializes from either a bare number (constant kW) or a table with
/// `idle_kw` / `peak_kw` (utilization-affine).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PowerModel {
    /// Fixed draw regardless of load.
    Constant(f64),
    /// `idle + (peak - idle) * utilization`, utilization in [0, 1].
    Affine { idle_kw: f64, peak_kw: f64 },
}

impl PowerModel {
    /// Draw in kW at the given utilization. Utilization is clamped to [0, 1].
    pub fn power_kw(&self, utilization: f64) -> f64 {
        match *self {
            PowerModel::Constant(kw) => kw,
            PowerModel::Affine { idle_kw, peak_kw } => {
                let u = if utilization.is_finite() {
                    utilization.clamp(0.0, 1.0)
                } else {
                    1.0
                };
                idle_kw + (peak_kw - idle_kw) * u
            }
        }
    }

    fn validate(&self, what: &str) -> SimResult<()> {
        let ok = match *self {
            PowerModel::Constant(kw) => kw.is_finite() && kw >= 0.0,
            PowerModel::Affine { idle_kw, peak_kw } => {
                idle_kw.is_finite() && peak_kw.is_finite() && idle_kw >= 0.0 && peak_kw >= idle_kw
            }
        };
        if ok {
            Ok(())
        } else {
            Err(SimError::ConfigError(format!(
                "invalid power model for {what}: {self:?}"
            )))
        }
    }
}

/// Electricity price and per-device power parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Price of one kWh.
    pub electricity_price_per_kwh: f64,

    /// Power model for QPUs without an override.
    pub default_qpu_power_kw: PowerModel,

    /// Power model for CPUs without an override.
    pub default_cpu_power_kw: PowerModel,

    /// Per-QPU overrides, keyed by device name.
    pub qpu_power_kw: BTreeMap<String, PowerModel>,

    /// Per-CPU overrides, keyed by device name.
    pub cpu_power_kw: BTreeMap<String, PowerModel>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            electricity_price_per_kwh: 0.15,
            // superconducting baseline incl. cryo
            default_qpu_power_kw: PowerModel::Constant(50.0),
            default_cpu_power_kw: PowerModel::Constant(0.5),
            qpu_power_kw: BTreeMap::new(),
            cpu_power_kw: BTreeMap::new(),
        }
    }
}

impl CostConfig {
    /// Set the electricity price.
    pub fn with_price(mut self, price_per_kwh: f64) -> Self {
        self.electricity_price_per_kwh = price_per_kwh;
        self
    }

    /// Override the power model of one device.
    pub fn with_device_power(
        mut self,
        class: DeviceClass,
        device: impl Into<String>,
        model: PowerModel,
    ) -> Self {
        match class {
            DeviceClass::Quantum => self.qpu_power_kw.insert(device.into(), model),
            DeviceClass::Classical => self.cpu_power_kw.insert(device.into(), model),
        };
        self
    }

    /// Power model for `device`, falling back to the class default.
    pub fn power_model(&self, class: DeviceClass, device: &str) -> PowerModel {
        match class {
            DeviceClass::Quantum => self
                .qpu_power_kw
                .get(device)
                .copied()
                .unwrap_or(self.default_qpu_power_kw),
            DeviceClass::Classical => self
                .cpu_power_kw
                .get(device)
                .copied()
                .unwrap_or(self.default_cpu_power_kw),
        }
    }

    /// Energy in kWh drawn at `power_kw` for `duration_s` seconds.
    pub fn energy_kwh(power_kw: f64, duration_s: f64) -> f64 {
        power_kw * (duration_s / SECONDS_PER_HOUR)
    }

    /// Price of `energy_kwh`.
    pub fn cost(&self, energy_kwh: f64) -> f64 {
        energy_kwh * self.electricity_price_per_kwh
    }

    /// Reject negative or non-finite parameters.
    pub fn validate(&self) -> SimResult<()> {
        let price = self.electricity_price_per_kwh;
        if !price.is_finite() || price < 0.0 {
            return Err(SimError::ConfigError(format!(
                "electricity_price_per_kwh must be finite and >= 0, got {price}"
            )));
        }
        self.default_qpu_power_kw.validate("default QPU")?;
        self.default_cpu_power_kw.validate("default CPU")?;
        for (name, model) in self.qpu_power_kw.iter().chain(&self.cpu_power_kw) {
            model.validate(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CostConfig::default();
        assert_eq!(cfg.electricity_price_per_kwh, 0.15);
        assert_eq!(
            cfg.power_model(DeviceClass::Quantum, "qpu-0").power_kw(0.3),
            50.0
        );
        assert_eq!(
            cfg.power_model(DeviceClass::Classical, "cpu-0").power_kw(1.0),
            0.5
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_affine_power() {
        let model = PowerModel::Affine {
            idle_kw: 0.2,
            peak_kw: 1.0,
        };
        assert!((model.power_kw(0.0) - 0.2).abs() < 1e-12);
        assert!((model.power_kw(0.5) - 0.6).abs() < 1e-12);
        assert!((model.power_kw(3.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_override_and_energy() {
        let cfg = CostConfig::default()
            .with_price(0.30)
            .with_device_power(DeviceClass::Classical, "ryzen-0", PowerModel::Constant(0.12));
        let kw = cfg
            .power_model(DeviceClass::Classical, "ryzen-0")
            .power_kw(1.0);
        assert_eq!(kw, 0.12);

        let kwh = CostConfig::energy_kwh(kw, 1800.0);
        assert!((kwh - 0.06).abs() < 1e-12);
        assert!((cfg.cost(kwh) - 0.018).abs() < 1e-12);
    }

    #[test]
    fn test_deserialize_mixed_power_models() {
        let cfg: CostConfig = serde_json::from_str(
            r#"{
                "electricity_price_per_kwh": 0.2,
                "cpu_power_kw": {
                    "cpu-0": 0.8,
                    "cpu-1": {"idle_kw": 0.1, "peak_kw": 0.9}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.cpu_power_kw["cpu-0"], PowerModel::Constant(0.8));
        assert!(matches!(
            cfg.cpu_power_kw["cpu-1"],
            PowerModel::Affine { .. }
        ));
        assert_eq!(cfg.default_qpu_power_kw, PowerModel::Constant(50.0));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = CostConfig::default().with_price(-1.0);
        assert!(cfg.validate().is_err());

        let cfg = CostConfig::default().with_device_power(
            DeviceClass::Classical,
            "cpu-0",
            PowerModel::Affine {
                idle_kw: 2.0,
                peak_kw: 1.0,
            },
        );
        assert!(cfg.validate().is_err());
    }
}
