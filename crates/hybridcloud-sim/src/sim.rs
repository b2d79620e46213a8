//! Simulation wiring, run driver and run summary.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerSpec};
use crate::bus::EventBus;
use crate::clock::{Env, SimTime};
use crate::config::SimConfig;
use crate::cost::CostConfig;
use crate::device::{Device, DeviceClass, DeviceSpec};
use crate::error::{SimError, SimResult};
use crate::generator::{JobFeed, JobGenerator, RunTally};
use crate::job::JobId;
use crate::ledger::{JobRecord, Ledger, round4};

/// Handles every simulated component receives: clock, ledger, bus and the
/// seeded random source. Cheap to clone.
#[derive(Clone)]
pub struct SimContext {
    env: Env,
    ledger: Ledger,
    bus: EventBus,
    rng: Rc<RefCell<StdRng>>,
}

impl fmt::Debug for SimContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimContext")
            .field("env", &self.env)
            .field("ledger", &self.ledger)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl SimContext {
    pub fn new(env: Env, ledger: Ledger, bus: EventBus, seed: u64) -> Self {
        Self {
            env,
            ledger,
            bus,
            rng: Rc::new(RefCell::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Run `f` with exclusive access to the random source.
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        f(&mut self.rng.borrow_mut())
    }
}

/// Builder for [`HybridCloudSim`].
#[derive(Debug, Clone, Default)]
pub struct SimBuilder {
    seed: u64,
    cost: CostConfig,
    devices: Vec<DeviceSpec>,
    broker: BrokerSpec,
}

impl SimBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn cost(mut self, cost: CostConfig) -> Self {
        self.cost = cost;
        self
    }

    pub fn device(mut self, spec: DeviceSpec) -> Self {
        self.devices.push(spec);
        self
    }

    pub fn devices(mut self, specs: impl IntoIterator<Item = DeviceSpec>) -> Self {
        self.devices.extend(specs);
        self
    }

    pub fn broker(mut self, spec: BrokerSpec) -> Self {
        self.broker = spec;
        self
    }

    /// Bind every device to a fresh clock and build the broker.
    ///
    /// Fails on duplicate device names, invalid parameters, or a broker
    /// that needs a device class with no devices.
    pub fn build(self) -> SimResult<HybridCloudSim> {
        self.cost.validate()?;

        let mut seen = FxHashSet::default();
        for spec in &self.devices {
            if !seen.insert(spec.name()) {
                return Err(SimError::DuplicateDevice(spec.name().to_string()));
            }
        }

        let env = Env::new();
        let devices = self
            .devices
            .iter()
            .map(|spec| spec.build(&env))
            .collect::<SimResult<Vec<_>>>()?;
        let broker = self.broker.build(&devices)?;

        let bus = EventBus::new();
        let ledger = Ledger::new(self.cost);
        ledger.attach(&bus);

        Ok(HybridCloudSim {
            ctx: SimContext::new(env, ledger, bus, self.seed),
            seed: self.seed,
            devices,
            broker,
            tally: Rc::new(RunTally::default()),
        })
    }
}

/// A fully wired simulated cloud.
pub struct HybridCloudSim {
    ctx: SimContext,
    seed: u64,
    devices: Vec<Rc<dyn Device>>,
    broker: Rc<dyn Broker>,
    tally: Rc<RunTally>,
}

impl fmt::Debug for HybridCloudSim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridCloudSim")
            .field("seed", &self.seed)
            .field("now", &self.ctx.env().now())
            .field("devices", &self.devices.len())
            .field("broker", &self.broker.name())
            .finish()
    }
}

impl HybridCloudSim {
    pub fn builder() -> SimBuilder {
        SimBuilder::new()
    }

    /// Build from a validated configuration.
    pub fn from_config(config: &SimConfig) -> SimResult<Self> {
        config.validate()?;
        SimBuilder::new()
            .seed(config.seed)
            .cost(config.cost.clone())
            .devices(config.devices.iter().cloned())
            .broker(config.broker.clone())
            .build()
    }

    pub fn context(&self) -> &SimContext {
        &self.ctx
    }

    pub fn env(&self) -> &Env {
        self.ctx.env()
    }

    pub fn ledger(&self) -> &Ledger {
        self.ctx.ledger()
    }

    pub fn bus(&self) -> &EventBus {
        self.ctx.bus()
    }

    pub fn broker(&self) -> &Rc<dyn Broker> {
        &self.broker
    }

    pub fn devices(&self) -> &[Rc<dyn Device>] {
        &self.devices
    }

    /// Look up a device by name.
    pub fn device(&self, name: &str) -> SimResult<&Rc<dyn Device>> {
        self.devices
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| SimError::UnknownDevice(name.to_string()))
    }

    /// Job counters.
    pub fn tally(&self) -> &RunTally {
        &self.tally
    }

    /// Feed jobs and run the clock until everything drains, or until `until`.
    ///
    /// A feed that never ends on its own needs a horizon. Jobs still in
    /// flight at the horizon stay suspended and are reported as such.
    pub fn run(&mut self, feed: JobFeed, until: Option<SimTime>) -> SimResult<RunSummary> {
        if !feed.is_bounded() && until.is_none() {
            return Err(SimError::UnboundedRun(
                "a generator feed without max_jobs needs a horizon".to_string(),
            ));
        }

        let env = self.ctx.env().clone();
        info!(
            at = env.now(),
            devices = self.devices.len(),
            broker = self.broker.name(),
            method = feed.method(),
            "simulation started"
        );

        let generator = JobGenerator::new(
            feed,
            Rc::clone(&self.broker),
            self.ctx.clone(),
            Rc::clone(&self.tally),
        );
        let feed_handle = env.spawn(generator.run());
        env.run(until)?;

        if let Some(Err(err)) = feed_handle.try_take() {
            return Err(err);
        }

        let summary = self.summary();
        if summary.jobs.is_empty() {
            warn!("no job records found");
        }
        info!(
            at = summary.end_time,
            completed = summary.completed,
            failed = summary.failed,
            in_flight = summary.in_flight,
            "simulation ended"
        );
        Ok(summary)
    }

    /// Snapshot of the run so far. Finalizes cost for every job with records.
    pub fn summary(&self) -> RunSummary {
        let ledger = self.ctx.ledger();
        ledger.finalize_all();
        let energy = ledger.energy_by_device();
        let end_time = self.ctx.env().now();

        let devices = self
            .devices
            .iter()
            .map(|d| DeviceReport::new(d.as_ref(), energy.get(d.name()).copied().unwrap_or(0.0)))
            .collect();

        let jobs = ledger.records();
        let total_energy_kwh: f64 = jobs
            .values()
            .filter_map(|r| r.cost.as_ref())
            .map(|c| c.energy_total_kwh)
            .sum();

        RunSummary {
            seed: self.seed,
            broker: self.broker.name().to_string(),
            end_time,
            arrived: self.tally.arrived(),
            completed: self.tally.completed(),
            failed: self.tally.failed(),
            in_flight: self.tally.in_flight(),
            total_energy_kwh,
            total_cost: ledger.cost_config().cost(total_energy_kwh),
            devices,
            jobs,
        }
    }
}

impl Drop for HybridCloudSim {
    fn drop(&mut self) {
        // Suspended job processes hold clones of the context.
        self.ctx.env().abandon_pending();
    }
}

fn serialize_round4<S: serde::Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round4(*value))
}

/// End-of-run view of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReport {
    pub name: String,
    pub class: DeviceClass,
    pub model: String,
    pub compute_capacity: u64,
    pub bandwidth_capacity: u64,
    pub compute_free: u64,
    pub bandwidth_free: u64,
    pub peak_compute_in_use: u64,
    pub phases_served: u64,
    pub phases_failed: u64,
    #[serde(serialize_with = "serialize_round4")]
    pub busy_time_s: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub energy_kwh: f64,
}

impl DeviceReport {
    fn new(device: &dyn Device, energy_kwh: f64) -> Self {
        let core = device.core();
        let stats = core.stats();
        Self {
            name: core.name().to_string(),
            class: core.class(),
            model: device.model().to_string(),
            compute_capacity: core.compute().capacity(),
            bandwidth_capacity: core.bandwidth().capacity(),
            compute_free: core.compute().available(),
            bandwidth_free: core.bandwidth().available(),
            peak_compute_in_use: core.compute().peak_in_use(),
            phases_served: stats.phases_served,
            phases_failed: stats.phases_failed,
            busy_time_s: stats.busy_time_s,
            energy_kwh,
        }
    }

    /// Whether every unit is back in its pool.
    pub fn is_drained(&self) -> bool {
        self.compute_free == self.compute_capacity && self.bandwidth_free == self.bandwidth_capacity
    }
}

/// Everything a finished run reports.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub seed: u64,
    pub broker: String,
    #[serde(serialize_with = "serialize_round4")]
    pub end_time: SimTime,
    pub arrived: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
    #[serde(serialize_with = "serialize_round4")]
    pub total_energy_kwh: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub total_cost: f64,
    pub devices: Vec<DeviceReport>,
    pub jobs: BTreeMap<JobId, JobRecord>,
}

impl RunSummary {
    /// Pretty JSON.
    pub fn to_json(&self) -> SimResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Ids of jobs whose every phase finished.
    pub fn completed_jobs(&self) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|(_, r)| r.cost.is_some() && !r.is_in_flight())
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Build a simulation from `config` and run its configured workload.
pub fn run_config(config: &SimConfig) -> SimResult<RunSummary> {
    let mut sim = HybridCloudSim::from_config(config)?;
    let feed = config.workload.feed();
    sim.run(feed, config.horizon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Selection;
    use crate::device::{CpuSpec, QpuSpec};
    use crate::generator::ArrivalRecord;
    use crate::job::{JobSpec, PhaseDemand};

    fn hybrid_builder() -> SimBuilder {
        HybridCloudSim::builder()
            .seed(3)
            .device(DeviceSpec::Qpu(QpuSpec::new("qpu-0", 27)))
            .device(DeviceSpec::Cpu(CpuSpec::new("cpu-0")))
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let err = hybrid_builder()
            .device(DeviceSpec::Cpu(CpuSpec::new("cpu-0")))
            .build()
            .unwrap_err();
        assert!(matches!(err, SimError::DuplicateDevice(name) if name == "cpu-0"));
    }

    #[test]
    fn test_unbounded_generator_needs_horizon() {
        let mut sim = hybrid_builder().build().unwrap();
        let feed = JobFeed::generator(|_| 1.0);
        assert!(matches!(
            sim.run(feed, None),
            Err(SimError::UnboundedRun(_))
        ));
    }

    #[test]
    fn test_horizon_leaves_jobs_in_flight() {
        let mut sim = hybrid_builder().build().unwrap();
        let template = JobSpec::new()
            .with_demand(DeviceClass::Quantum, PhaseDemand::new().duration(4.0))
            .with_demand(DeviceClass::Classical, PhaseDemand::new().duration(1.0));
        let feed = JobFeed::generator(|_| 1.0).with_template(template);

        let summary = sim.run(feed, Some(10.0)).unwrap();
        assert_eq!(summary.end_time, 10.0);
        // Arrivals at 1..=10; the QPU is exclusive, 4 s per job.
        assert_eq!(summary.arrived, 10);
        assert!(summary.completed >= 1);
        assert!(summary.in_flight > 0);
        assert_eq!(
            summary.arrived,
            summary.completed + summary.failed + summary.in_flight
        );
    }

    #[test]
    fn test_summary_reports_devices_and_energy() {
        let mut sim = hybrid_builder().build().unwrap();
        let spec = JobSpec::new()
            .with_demand(DeviceClass::Quantum, PhaseDemand::new().duration(36.0))
            .with_demand(
                DeviceClass::Classical,
                PhaseDemand::new().compute(5).duration(36.0),
            );
        let feed = JobFeed::dispatcher(vec![ArrivalRecord::new(0.0, spec)]).unwrap();

        let summary = sim.run(feed, None).unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.completed_jobs(), vec![JobId(0)]);
        assert!(summary.devices.iter().all(DeviceReport::is_drained));

        let qpu = &summary.devices[0];
        assert_eq!(qpu.phases_served, 1);
        assert!((qpu.energy_kwh - 0.5).abs() < 1e-9);
        assert!((summary.total_energy_kwh - 0.505).abs() < 1e-9);

        let json: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
        assert_eq!(json["jobs"]["0"]["energy_total_kwh"], 0.505);
        assert_eq!(json["broker"], "hybrid");
    }

    #[test]
    fn test_device_lookup() {
        let sim = hybrid_builder()
            .broker(BrokerSpec::Serial {
                class: DeviceClass::Classical,
                selection: Selection::LeastLoaded,
            })
            .build()
            .unwrap();
        assert_eq!(sim.device("qpu-0").unwrap().class(), DeviceClass::Quantum);
        assert!(matches!(
            sim.device("gpu-0"),
            Err(SimError::UnknownDevice(_))
        ));
        assert_eq!(sim.broker().name(), "serial");
    }

    #[test]
    fn test_empty_run_is_tolerated() {
        let mut sim = hybrid_builder().build().unwrap();
        let summary = sim.run(JobFeed::dispatcher(vec![]).unwrap(), None).unwrap();
        assert_eq!(summary.arrived, 0);
        assert!(summary.jobs.is_empty());
        assert_eq!(summary.total_cost, 0.0);
    }
}
