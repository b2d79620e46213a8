//! Quantum devices.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::{
    Device, DeviceClass, DeviceCore, PhasePlan, check_duration_range, check_positive,
    draw_duration,
};
use crate::clock::Env;
use crate::error::SimResult;
use crate::job::Job;

/// Control channels a job uses when it does not say otherwise.
const DEFAULT_CHANNELS: u64 = 1;

/// A QPU: qubits are the compute pool, control channels the bandwidth pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpuSpec {
    pub name: String,
    pub qubits: u64,
    pub channels: u64,
    pub min_duration: f64,
    pub max_duration: f64,
}

impl Default for QpuSpec {
    fn default() -> Self {
        Self {
            name: "qpu-0".to_string(),
            qubits: 127,
            channels: 4,
            min_duration: 1.0,
            max_duration: 3.0,
        }
    }
}

impl QpuSpec {
    pub fn new(name: impl Into<String>, qubits: u64) -> Self {
        Self {
            name: name.into(),
            qubits,
            ..Self::default()
        }
    }

    pub fn with_channels(mut self, channels: u64) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_duration_range(mut self, min: f64, max: f64) -> Self {
        self.min_duration = min;
        self.max_duration = max;
        self
    }

    pub(super) fn validate(&self) -> SimResult<()> {
        check_positive(&self.name, "qubits", self.qubits)?;
        check_positive(&self.name, "channels", self.channels)?;
        check_duration_range(&self.name, self.min_duration, self.max_duration)
    }
}

/// Quantum device.
///
/// A job that does not state its qubit count takes the whole chip. Service
/// time is device-intrinsic: a uniform draw from the configured range unless
/// the job fixes it.
#[derive(Debug)]
pub struct Qpu {
    core: DeviceCore,
    spec: QpuSpec,
}

impl Qpu {
    pub fn new(env: &Env, spec: QpuSpec) -> Self {
        Self {
            core: DeviceCore::new(
                env,
                spec.name.clone(),
                DeviceClass::Quantum,
                spec.qubits,
                spec.channels,
            ),
            spec,
        }
    }
}

impl Device for Qpu {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn model(&self) -> &str {
        "QPU"
    }

    fn plan(&self, job: &Job, rng: &mut StdRng) -> SimResult<PhasePlan> {
        let demand = job.demand(DeviceClass::Quantum);
        let duration = match demand.duration {
            Some(d) => d,
            None => draw_duration(rng, self.spec.min_duration, self.spec.max_duration),
        };

        Ok(PhasePlan {
            compute_units: demand.compute_units.unwrap_or(self.spec.qubits),
            bandwidth_units: demand.bandwidth_units.unwrap_or(DEFAULT_CHANNELS),
            duration,
        })
    }
}
