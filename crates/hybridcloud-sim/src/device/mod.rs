//! Simulated devices.
//!
//! A device owns three pools: compute units, bandwidth units, and a
//! single-slot admission gate. Jobs pass the gate in priority-then-arrival
//! order, take their compute and bandwidth units while holding it, and then
//! let the next job in. Service itself runs outside the gate, so a device
//! serves as many jobs concurrently as its capacity allows.
//!
//! Variants differ only in how they size a phase ([`Device::plan`]); the
//! acquire / serve / release protocol in [`run_phase`] is shared.

mod cpu;
mod qpu;

pub use cpu::{Cpu, CpuProfile, CpuSpec, ProfiledCpu};
pub use qpu::{Qpu, QpuSpec};

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use async_trait::async_trait;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::bus::BusEvent;
use crate::clock::{Env, SimTime};
use crate::error::{SimError, SimResult};
use crate::job::{Job, JobId};
use crate::ledger::{DEVICE_NAME, EventValue, PhaseEvent};
use crate::resource::Pool;
use crate::sim::SimContext;

/// Capability class of a device. Brokers route on this tag only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    #[serde(rename = "QPU", alias = "qpu", alias = "quantum")]
    Quantum,
    #[serde(rename = "CPU", alias = "cpu", alias = "classical")]
    Classical,
}

impl DeviceClass {
    /// Both classes, quantum first.
    pub const ALL: [DeviceClass; 2] = [DeviceClass::Quantum, DeviceClass::Classical];

    /// Lowercase prefix used for ledger keys.
    pub fn tag(&self) -> &'static str {
        match self {
            DeviceClass::Quantum => "qpu",
            DeviceClass::Classical => "cpu",
        }
    }

    /// Placeholder device name for segments with no recorded device.
    pub fn unknown_device(&self) -> &'static str {
        match self {
            DeviceClass::Quantum => "UNKNOWN_QPU",
            DeviceClass::Classical => "UNKNOWN_CPU",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Quantum => write!(f, "QPU"),
            DeviceClass::Classical => write!(f, "CPU"),
        }
    }
}

impl FromStr for DeviceClass {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qpu" | "quantum" => Ok(DeviceClass::Quantum),
            "cpu" | "classical" => Ok(DeviceClass::Classical),
            other => Err(SimError::ConfigError(format!("unknown device class: {other}"))),
        }
    }
}

/// Sizing of one phase, decided before any capacity is requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhasePlan {
    pub compute_units: u64,
    pub bandwidth_units: u64,
    pub duration: SimTime,
}

impl PhasePlan {
    fn validate(&self) -> SimResult<()> {
        if self.duration.is_finite() && self.duration >= 0.0 {
            Ok(())
        } else {
            Err(SimError::invalid_time(
                self.duration,
                "service duration must be finite and >= 0",
            ))
        }
    }
}

/// What happened during one completed phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseOutcome {
    pub device: String,
    pub class: DeviceClass,
    pub job_id: JobId,
    pub arrive: SimTime,
    pub start: SimTime,
    pub finish: SimTime,
    pub compute_units: u64,
    pub bandwidth_units: u64,
}

impl PhaseOutcome {
    /// Time spent waiting for capacity.
    pub fn wait(&self) -> SimTime {
        self.start - self.arrive
    }
}

/// Running counters kept by each device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DeviceStats {
    pub phases_served: u64,
    pub phases_failed: u64,
    pub busy_time_s: f64,
}

/// State every device variant shares: identity and pools.
pub struct DeviceCore {
    name: String,
    class: DeviceClass,
    compute: Pool,
    bandwidth: Pool,
    admission: Pool,
    stats: RefCell<DeviceStats>,
}

impl fmt::Debug for DeviceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCore")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("compute", &self.compute)
            .field("bandwidth", &self.bandwidth)
            .finish()
    }
}

impl DeviceCore {
    /// Bind a device's pools to `env`.
    pub fn new(
        env: &Env,
        name: impl Into<String>,
        class: DeviceClass,
        compute_capacity: u64,
        bandwidth_capacity: u64,
    ) -> Self {
        let name = name.into();
        Self {
            compute: Pool::new(env, format!("{name}.compute"), compute_capacity),
            bandwidth: Pool::new(env, format!("{name}.bandwidth"), bandwidth_capacity),
            admission: Pool::new(env, format!("{name}.admission"), 1),
            name,
            class,
            stats: RefCell::new(DeviceStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    /// Compute-unit pool.
    pub fn compute(&self) -> &Pool {
        &self.compute
    }

    /// Bandwidth-unit pool.
    pub fn bandwidth(&self) -> &Pool {
        &self.bandwidth
    }

    /// Single-slot admission gate.
    pub fn admission(&self) -> &Pool {
        &self.admission
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DeviceStats {
        *self.stats.borrow()
    }

    /// Busy fraction of the compute pool plus the number of jobs queued at
    /// the gate.
    pub fn load(&self) -> f64 {
        let capacity = self.compute.capacity().max(1) as f64;
        let busy = (self.compute.in_use() + self.compute.queued_units()) as f64 / capacity;
        busy + self.admission.waiting() as f64
    }

    /// Fail every pending and future request on all three pools.
    pub fn close(&self) {
        self.admission.close();
        self.compute.close();
        self.bandwidth.close();
    }

    async fn acquire_capacity(&self, job: &Job, plan: &PhasePlan) -> SimResult<()> {
        self.compute.acquire(plan.compute_units, job.priority).await?;

        if let Err(err) = self.bandwidth.acquire(plan.bandwidth_units, job.priority).await {
            warn!(
                device = %self.name,
                job_id = %job.id,
                units = plan.compute_units,
                error = %err,
                "bandwidth acquisition failed, returning compute units"
            );
            if let Err(release_err) = self.compute.release(plan.compute_units) {
                error!(device = %self.name, job_id = %job.id, error = %release_err, "rollback release failed");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Return bandwidth then compute units. Failures are logged only.
    fn release_capacity(&self, job_id: JobId, plan: &PhasePlan) {
        if let Err(err) = self.bandwidth.release(plan.bandwidth_units) {
            error!(device = %self.name, job_id = %job_id, error = %err, "failed to return bandwidth units");
        }
        if let Err(err) = self.compute.release(plan.compute_units) {
            error!(device = %self.name, job_id = %job_id, error = %err, "failed to return compute units");
        }
    }

    fn record_served(&self, busy: SimTime) {
        let mut stats = self.stats.borrow_mut();
        stats.phases_served += 1;
        stats.busy_time_s += busy;
    }

    fn record_failed(&self) {
        self.stats.borrow_mut().phases_failed += 1;
    }
}

/// A device that can serve one phase of a job.
#[async_trait(?Send)]
pub trait Device {
    /// Shared identity and pools.
    fn core(&self) -> &DeviceCore;

    /// Model label for reports.
    fn model(&self) -> &str;

    /// Size the phase for `job`. Draws from `rng` only for values the job
    /// leaves open.
    fn plan(&self, job: &Job, rng: &mut StdRng) -> SimResult<PhasePlan>;

    /// Extra ledger events logged at phase entry.
    fn phase_metadata(&self) -> Vec<(String, EventValue)> {
        Vec::new()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn class(&self) -> DeviceClass {
        self.core().class()
    }

    /// Serve one phase of `job`: acquire, run for the planned duration,
    /// publish `device_finish`, release.
    async fn process_job(&self, job: &Job, ctx: &SimContext) -> SimResult<PhaseOutcome> {
        run_phase(self, job, ctx).await
    }
}

/// The phase protocol shared by every device variant.
///
/// If bandwidth cannot be granted, the compute units already held are
/// returned before the error propagates. Release failures after service are
/// logged and swallowed.
pub async fn run_phase<D: Device + ?Sized>(
    device: &D,
    job: &Job,
    ctx: &SimContext,
) -> SimResult<PhaseOutcome> {
    let core = device.core();
    let class = core.class();
    let env = ctx.env();
    let ledger = ctx.ledger();

    let plan = ctx.with_rng(|rng| device.plan(job, rng))?;
    plan.validate()?;

    let arrive = env.now();
    ledger.log_job_event(job.id, DEVICE_NAME, core.name());
    ledger.log_phase_event(job.id, class, PhaseEvent::Device, core.name());
    ledger.log_phase_event(job.id, class, PhaseEvent::Arrive, arrive);
    ledger.log_phase_event(job.id, class, PhaseEvent::Units, plan.compute_units);
    ledger.log_phase_event(job.id, class, PhaseEvent::Bandwidth, plan.bandwidth_units);
    ledger.log_phase_event(job.id, class, PhaseEvent::Capacity, core.compute().capacity());
    for (key, value) in device.phase_metadata() {
        ledger.log_job_event(job.id, key, value);
    }
    debug!(
        device = %core.name(),
        job_id = %job.id,
        compute_units = plan.compute_units,
        bandwidth_units = plan.bandwidth_units,
        "phase queued"
    );

    if let Err(err) = core.admission().acquire(1, job.priority).await {
        core.record_failed();
        return Err(err);
    }
    let acquired = core.acquire_capacity(job, &plan).await;
    if let Err(err) = core.admission().release(1) {
        error!(device = %core.name(), job_id = %job.id, error = %err, "failed to leave admission gate");
    }
    if let Err(err) = acquired {
        core.record_failed();
        return Err(err);
    }

    let start = env.now();
    ledger.log_phase_event(job.id, class, PhaseEvent::Start, start);
    debug!(device = %core.name(), job_id = %job.id, start, duration = plan.duration, "phase started");

    let served = match env.timeout(plan.duration) {
        Ok(timer) => {
            timer.await;
            Ok(())
        }
        Err(err) => Err(err),
    };
    if let Err(err) = served {
        core.release_capacity(job.id, &plan);
        core.record_failed();
        return Err(err);
    }

    let finish = env.now();
    ledger.log_phase_event(job.id, class, PhaseEvent::Finish, finish);
    ctx.bus().publish(&BusEvent::DeviceFinish {
        device: core.name().to_string(),
        job_id: job.id,
        timestamp: finish,
    });
    core.release_capacity(job.id, &plan);
    core.record_served(finish - start);
    debug!(device = %core.name(), job_id = %job.id, finish, "phase finished");

    Ok(PhaseOutcome {
        device: core.name().to_string(),
        class,
        job_id: job.id,
        arrive,
        start,
        finish,
        compute_units: plan.compute_units,
        bandwidth_units: plan.bandwidth_units,
    })
}

/// Declarative device description, as found in a configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceSpec {
    Qpu(QpuSpec),
    Cpu(CpuSpec),
    ProfiledCpu(CpuProfile),
}

impl DeviceSpec {
    pub fn name(&self) -> &str {
        match self {
            DeviceSpec::Qpu(s) => &s.name,
            DeviceSpec::Cpu(s) => &s.name,
            DeviceSpec::ProfiledCpu(s) => &s.name,
        }
    }

    pub fn class(&self) -> DeviceClass {
        match self {
            DeviceSpec::Qpu(_) => DeviceClass::Quantum,
            DeviceSpec::Cpu(_) | DeviceSpec::ProfiledCpu(_) => DeviceClass::Classical,
        }
    }

    /// Check parameters without building anything.
    pub fn validate(&self) -> SimResult<()> {
        if self.name().trim().is_empty() {
            return Err(SimError::ConfigError("device name must not be empty".to_string()));
        }
        match self {
            DeviceSpec::Qpu(s) => s.validate(),
            DeviceSpec::Cpu(s) => s.validate(),
            DeviceSpec::ProfiledCpu(s) => s.validate(),
        }
    }

    /// Build the device with its pools bound to `env`.
    pub fn build(&self, env: &Env) -> SimResult<Rc<dyn Device>> {
        self.validate()?;
        let device: Rc<dyn Device> = match self {
            DeviceSpec::Qpu(s) => Rc::new(Qpu::new(env, s.clone())),
            DeviceSpec::Cpu(s) => Rc::new(Cpu::new(env, s.clone())),
            DeviceSpec::ProfiledCpu(s) => Rc::new(ProfiledCpu::new(env, s.clone())),
        };
        Ok(device)
    }
}

pub(crate) fn check_positive(device: &str, field: &str, value: u64) -> SimResult<()> {
    if value == 0 {
        return Err(SimError::ConfigError(format!(
            "device {device}: {field} must be greater than 0"
        )));
    }
    Ok(())
}

pub(crate) fn check_duration_range(device: &str, min: f64, max: f64) -> SimResult<()> {
    if !(min.is_finite() && max.is_finite() && min >= 0.0 && min <= max) {
        return Err(SimError::ConfigError(format!(
            "device {device}: duration range [{min}, {max}] is invalid"
        )));
    }
    Ok(())
}

/// Uniform draw in `[min, max)`, or `min` for a degenerate range.
pub(crate) fn draw_duration(rng: &mut StdRng, min: f64, max: f64) -> f64 {
    use rand::Rng;
    if max > min { rng.gen_range(min..max) } else { min }
}
