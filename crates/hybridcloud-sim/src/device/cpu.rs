//! Classical devices.

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::{
    Device, DeviceClass, DeviceCore, PhasePlan, check_duration_range, check_positive,
    draw_duration,
};
use crate::clock::Env;
use crate::error::{SimError, SimResult};
use crate::job::Job;
use crate::ledger::EventValue;

/// Smallest compute demand drawn for a job that does not state one.
const MIN_DRAWN_UNITS: u64 = 4;

/// Upper bound of the drawn compute demand on a plain CPU.
const MAX_DRAWN_UNITS: u64 = 10;

/// Bandwidth demand for a job that does not state one.
const DEFAULT_BANDWIDTH_UNITS: u64 = 20;

/// Exponent of the sub-linear parallel speed-up.
const PARALLEL_EXPONENT: f64 = 0.85;

/// Floor for effective performance, so a degenerate profile cannot divide by zero.
const MIN_EFFECTIVE_PERF: f64 = 1e-6;

/// Uniform draw of a compute demand in `MIN_DRAWN_UNITS..=upper`, never
/// above what the device can hold.
fn draw_units(rng: &mut StdRng, upper: u64, capacity: u64) -> u64 {
    let hi = upper.min(capacity).max(1);
    let lo = MIN_DRAWN_UNITS.min(hi);
    rng.gen_range(lo..=hi)
}

/// Plain classical device: fixed capacities, randomized sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuSpec {
    pub name: String,
    pub compute_capacity: u64,
    pub bandwidth_capacity: u64,
    pub min_duration: f64,
    pub max_duration: f64,
}

impl Default for CpuSpec {
    fn default() -> Self {
        Self {
            name: "cpu-0".to_string(),
            compute_capacity: 100,
            bandwidth_capacity: 200,
            min_duration: 1.0,
            max_duration: 3.0,
        }
    }
}

impl CpuSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, compute: u64, bandwidth: u64) -> Self {
        self.compute_capacity = compute;
        self.bandwidth_capacity = bandwidth;
        self
    }

    pub(super) fn validate(&self) -> SimResult<()> {
        check_positive(&self.name, "compute_capacity", self.compute_capacity)?;
        check_positive(&self.name, "bandwidth_capacity", self.bandwidth_capacity)?;
        check_duration_range(&self.name, self.min_duration, self.max_duration)
    }
}

/// A CPU with no performance model.
///
/// Unstated demand is drawn: compute units uniformly from 4 to 10, duration
/// uniformly from the configured range. Bandwidth defaults to 20 units.
/// Neither default exceeds the device's capacity.
#[derive(Debug)]
pub struct Cpu {
    core: DeviceCore,
    spec: CpuSpec,
}

impl Cpu {
    pub fn new(env: &Env, spec: CpuSpec) -> Self {
        Self {
            core: DeviceCore::new(
                env,
                spec.name.clone(),
                DeviceClass::Classical,
                spec.compute_capacity,
                spec.bandwidth_capacity,
            ),
            spec,
        }
    }
}

impl Device for Cpu {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn model(&self) -> &str {
        "CPU"
    }

    fn plan(&self, job: &Job, rng: &mut StdRng) -> SimResult<PhasePlan> {
        let demand = job.demand(DeviceClass::Classical);
        let duration = match demand.duration {
            Some(d) => d,
            None => draw_duration(rng, self.spec.min_duration, self.spec.max_duration),
        };
        let compute_units = match demand.compute_units {
            Some(units) => units,
            None => draw_units(rng, MAX_DRAWN_UNITS, self.spec.compute_capacity),
        };

        Ok(PhasePlan {
            compute_units,
            bandwidth_units: demand
                .bandwidth_units
                .unwrap_or(DEFAULT_BANDWIDTH_UNITS.min(self.spec.bandwidth_capacity)),
            duration,
        })
    }
}

/// Performance profile of a named CPU microarchitecture.
///
/// Capacity derives from the thread count and memory bandwidth; duration
/// derives from the job's work and the clock/IPC figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuProfile {
    pub name: String,
    pub model: String,
    pub cores: u32,
    pub threads: u32,
    pub base_ghz: f64,
    pub boost_ghz: f64,
    pub ipc_factor: f64,
    pub mem_bw_gbps: f64,
    pub units_per_thread: u64,
    pub bandwidth_units_per_gbps: f64,
}

impl Default for CpuProfile {
    fn default() -> Self {
        Self {
            name: "ryzen-0".to_string(),
            model: "AMD_Ryzen".to_string(),
            cores: 8,
            threads: 16,
            base_ghz: 3.8,
            boost_ghz: 5.0,
            ipc_factor: 1.10,
            mem_bw_gbps: 51.2,
            units_per_thread: 8,
            bandwidth_units_per_gbps: 4.0,
        }
    }
}

impl CpuProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// `threads x units_per_thread`.
    pub fn compute_capacity(&self) -> u64 {
        u64::from(self.threads) * self.units_per_thread
    }

    /// Memory bandwidth in units, rounded to the nearest whole unit.
    pub fn bandwidth_capacity(&self) -> u64 {
        (self.mem_bw_gbps * self.bandwidth_units_per_gbps).round().max(0.0) as u64
    }

    /// Mean of base and boost clock, scaled by IPC.
    pub fn effective_perf(&self) -> f64 {
        0.5 * (self.base_ghz + self.boost_ghz) * self.ipc_factor
    }

    pub(super) fn validate(&self) -> SimResult<()> {
        check_positive(&self.name, "threads", u64::from(self.threads))?;
        check_positive(&self.name, "compute capacity", self.compute_capacity())?;
        check_positive(&self.name, "bandwidth capacity", self.bandwidth_capacity())?;
        let figures = [self.base_ghz, self.boost_ghz, self.ipc_factor, self.mem_bw_gbps];
        if figures.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(SimError::ConfigError(format!(
                "device {}: clock, IPC and bandwidth figures must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// A CPU sized and timed by its [`CpuProfile`].
///
/// Indistinguishable from [`Cpu`] to a broker: same class, same protocol.
#[derive(Debug)]
pub struct ProfiledCpu {
    core: DeviceCore,
    profile: CpuProfile,
}

impl ProfiledCpu {
    pub fn new(env: &Env, profile: CpuProfile) -> Self {
        Self {
            core: DeviceCore::new(
                env,
                profile.name.clone(),
                DeviceClass::Classical,
                profile.compute_capacity(),
                profile.bandwidth_capacity(),
            ),
            profile,
        }
    }

    pub fn profile(&self) -> &CpuProfile {
        &self.profile
    }

    fn perf(&self) -> f64 {
        self.profile.effective_perf().max(MIN_EFFECTIVE_PERF)
    }
}

impl Device for ProfiledCpu {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn model(&self) -> &str {
        &self.profile.model
    }

    fn plan(&self, job: &Job, rng: &mut StdRng) -> SimResult<PhasePlan> {
        let demand = job.demand(DeviceClass::Classical);
        let max_units = MAX_DRAWN_UNITS.max(u64::from(self.profile.threads));
        let compute_units = match demand.compute_units {
            Some(units) => units,
            None => draw_units(rng, max_units, self.profile.compute_capacity()),
        };

        let duration = match (demand.duration, demand.work) {
            (Some(d), _) => d,
            (None, Some(work)) if work > 0.0 => {
                let parallel_eff = (compute_units as f64).powf(PARALLEL_EXPONENT);
                work / (self.perf() * parallel_eff)
            }
            _ => rng.gen_range(1.0..3.0) / self.perf(),
        };

        Ok(PhasePlan {
            compute_units,
            bandwidth_units: demand
                .bandwidth_units
                .unwrap_or(DEFAULT_BANDWIDTH_UNITS.min(self.profile.bandwidth_capacity())),
            duration,
        })
    }

    fn phase_metadata(&self) -> Vec<(String, EventValue)> {
        vec![
            ("cpu_model".to_string(), self.profile.model.as_str().into()),
            ("cpu_cores".to_string(), self.profile.cores.into()),
            ("cpu_threads".to_string(), self.profile.threads.into()),
            ("cpu_eff_perf".to_string(), self.profile.effective_perf().into()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, PhaseDemand};
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    #[test]
    fn test_cpu_draws_within_ranges() {
        let env = Env::new();
        let cpu = Cpu::new(&env, CpuSpec::default());
        let mut rng = rng();
        let job = Job::new(JobId(1), 0.0);

        for _ in 0..200 {
            let plan = cpu.plan(&job, &mut rng).unwrap();
            assert!((MIN_DRAWN_UNITS..=MAX_DRAWN_UNITS).contains(&plan.compute_units));
            assert_eq!(plan.bandwidth_units, DEFAULT_BANDWIDTH_UNITS);
            assert!((1.0..3.0).contains(&plan.duration));
        }
        assert_eq!(cpu.core().compute().capacity(), 100);
        assert_eq!(cpu.core().bandwidth().capacity(), 200);
    }

    #[test]
    fn test_cpu_honours_job_demand() {
        let env = Env::new();
        let cpu = Cpu::new(&env, CpuSpec::new("cpu-1").with_capacity(10, 20));
        let job = Job::new(JobId(1), 0.0).with_demand(
            DeviceClass::Classical,
            PhaseDemand::new().compute(6).bandwidth(5).duration(4.0),
        );

        let plan = cpu.plan(&job, &mut rng()).unwrap();
        assert_eq!(
            plan,
            PhasePlan {
                compute_units: 6,
                bandwidth_units: 5,
                duration: 4.0
            }
        );
    }

    #[test]
    fn test_small_cpu_draws_fit_capacity() {
        let env = Env::new();
        let cpu = Cpu::new(&env, CpuSpec::new("cpu-s").with_capacity(6, 8));
        let tiny = Cpu::new(&env, CpuSpec::new("cpu-t").with_capacity(2, 200));
        let mut rng = rng();
        let job = Job::new(JobId(1), 0.0);

        let mut seen_max = false;
        for _ in 0..200 {
            let plan = cpu.plan(&job, &mut rng).unwrap();
            let units = plan.compute_units;
            assert!((4..=6).contains(&units));
            assert_eq!(plan.bandwidth_units, 8);
            seen_max |= units == 6;
            assert!((1..=2).contains(&tiny.plan(&job, &mut rng).unwrap().compute_units));
        }
        assert!(seen_max);
    }

    #[test]
    fn test_small_profile_draws_fit_capacity() {
        let env = Env::new();
        let cpu = ProfiledCpu::new(
            &env,
            CpuProfile {
                threads: 2,
                units_per_thread: 3,
                ..CpuProfile::default()
            },
        );
        assert_eq!(cpu.core().compute().capacity(), 6);
        let mut rng = rng();
        let job = Job::new(JobId(1), 0.0);

        for _ in 0..200 {
            assert!((4..=6).contains(&cpu.plan(&job, &mut rng).unwrap().compute_units));
        }
    }

    #[test]
    fn test_profile_capacities() {
        let profile = CpuProfile::default();
        assert_eq!(profile.compute_capacity(), 128);
        // 51.2 GB/s x 4 = 204.8
        assert_eq!(profile.bandwidth_capacity(), 205);
        assert!((profile.effective_perf() - 4.84).abs() < 1e-12);
    }

    #[test]
    fn test_profiled_duration_from_work() {
        let env = Env::new();
        let cpu = ProfiledCpu::new(&env, CpuProfile::default());
        let job = Job::new(JobId(1), 0.0).with_demand(
            DeviceClass::Classical,
            PhaseDemand::new().compute(16).work(100.0),
        );

        let plan = cpu.plan(&job, &mut rng()).unwrap();
        let expected = 100.0 / (4.84 * 16f64.powf(0.85));
        assert!((plan.duration - expected).abs() < 1e-9);
        assert_eq!(plan.compute_units, 16);
    }

    #[test]
    fn test_profiled_draws_scale_with_threads() {
        let env = Env::new();
        let cpu = ProfiledCpu::new(
            &env,
            CpuProfile {
                threads: 32,
                ..CpuProfile::default()
            },
        );
        let mut rng = rng();
        let job = Job::new(JobId(1), 0.0);

        for _ in 0..200 {
            let plan = cpu.plan(&job, &mut rng).unwrap();
            assert!((4..=32).contains(&plan.compute_units));
            assert!(plan.duration > 0.0 && plan.duration < 3.0 / 4.84);
        }
    }

    #[test]
    fn test_profiled_metadata() {
        let env = Env::new();
        let cpu = ProfiledCpu::new(&env, CpuProfile::default());
        let meta = cpu.phase_metadata();
        let keys: Vec<_> = meta.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["cpu_model", "cpu_cores", "cpu_threads", "cpu_eff_perf"]);
        assert_eq!(meta[0].1, EventValue::from("AMD_Ryzen"));
        assert_eq!(cpu.class(), DeviceClass::Classical);
        assert_eq!(cpu.model(), "AMD_Ryzen");
    }
}
