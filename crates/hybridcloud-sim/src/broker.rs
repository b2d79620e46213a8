//! Brokers route jobs to devices.
//!
//! A [`SerialBroker`] sends each job to one device of a single class. A
//! [`HybridBroker`] walks the job through a fixed sequence of phases, one
//! device per phase. Both pick among eligible devices with a
//! [`DeviceSelector`], and both refuse to be built when a class they need
//! has no devices.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{Device, DeviceClass, PhaseOutcome};
use crate::error::{SimError, SimResult};
use crate::job::{Job, JobId};
use crate::sim::SimContext;

/// Rule for choosing one device among eligible candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Cycle through candidates in registration order.
    #[default]
    RoundRobin,
    /// Lowest current load; ties go to the first registered.
    LeastLoaded,
    /// Uniform draw from the seeded simulation RNG.
    Random,
}

/// Stateful selector applying a [`Selection`] rule.
#[derive(Debug, Default)]
pub struct DeviceSelector {
    rule: Selection,
    cursor: Cell<usize>,
}

impl DeviceSelector {
    pub fn new(rule: Selection) -> Self {
        Self {
            rule,
            cursor: Cell::new(0),
        }
    }

    pub fn rule(&self) -> Selection {
        self.rule
    }

    /// Pick one of `candidates`. `None` only when the slice is empty.
    pub fn select(
        &self,
        candidates: &[Rc<dyn Device>],
        ctx: &SimContext,
    ) -> Option<Rc<dyn Device>> {
        if candidates.is_empty() {
            return None;
        }
        let index = match self.rule {
            Selection::RoundRobin => {
                let i = self.cursor.get() % candidates.len();
                self.cursor.set(i + 1);
                i
            }
            Selection::LeastLoaded => candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.core().load().total_cmp(&b.core().load()))
                .map_or(0, |(i, _)| i),
            Selection::Random => ctx.with_rng(|rng| rng.gen_range(0..candidates.len())),
        };
        candidates.get(index).cloned()
    }
}

/// Result of a job that ran every phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub phases: Vec<PhaseOutcome>,
}

impl JobOutcome {
    /// Completion time of the last phase.
    pub fn finish(&self) -> Option<f64> {
        self.phases.last().map(|p| p.finish)
    }
}

/// Routes a job to devices and drives it to completion.
#[async_trait(?Send)]
pub trait Broker {
    /// Policy name for logs and reports.
    fn name(&self) -> &str;

    /// Device classes this broker visits, in order.
    fn phases(&self) -> Vec<DeviceClass>;

    /// Serve every phase of `job`.
    async fn handle(&self, job: Job, ctx: &SimContext) -> SimResult<JobOutcome>;
}

fn eligible(devices: &[Rc<dyn Device>], class: DeviceClass) -> Vec<Rc<dyn Device>> {
    devices
        .iter()
        .filter(|d| d.class() == class)
        .cloned()
        .collect()
}

fn require_candidates(
    candidates: &[Rc<dyn Device>],
    class: DeviceClass,
    broker: &str,
) -> SimResult<()> {
    if candidates.is_empty() {
        return Err(SimError::NoEligibleDevice {
            class: class.to_string(),
            reason: format!("{broker} broker has no {class} devices registered"),
        });
    }
    Ok(())
}

async fn run_on(
    selector: &DeviceSelector,
    candidates: &[Rc<dyn Device>],
    class: DeviceClass,
    broker: &str,
    job: &Job,
    ctx: &SimContext,
) -> SimResult<PhaseOutcome> {
    let device = selector
        .select(candidates, ctx)
        .ok_or_else(|| SimError::NoEligibleDevice {
            class: class.to_string(),
            reason: format!("{broker} broker has no candidates"),
        })?;
    debug!(job_id = %job.id, device = %device.name(), %class, "job routed");
    device.process_job(job, ctx).await
}

/// Single-class routing.
pub struct SerialBroker {
    class: DeviceClass,
    candidates: Vec<Rc<dyn Device>>,
    selector: DeviceSelector,
}

impl fmt::Debug for SerialBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialBroker")
            .field("class", &self.class)
            .field("candidates", &self.candidates.len())
            .field("selection", &self.selector.rule())
            .finish()
    }
}

impl SerialBroker {
    /// Build over the `class` devices in `devices`. Fails if there are none.
    pub fn new(
        devices: &[Rc<dyn Device>],
        class: DeviceClass,
        selection: Selection,
    ) -> SimResult<Self> {
        let candidates = eligible(devices, class);
        require_candidates(&candidates, class, "serial")?;
        Ok(Self {
            class,
            candidates,
            selector: DeviceSelector::new(selection),
        })
    }
}

#[async_trait(?Send)]
impl Broker for SerialBroker {
    fn name(&self) -> &str {
        "serial"
    }

    fn phases(&self) -> Vec<DeviceClass> {
        vec![self.class]
    }

    async fn handle(&self, job: Job, ctx: &SimContext) -> SimResult<JobOutcome> {
        let phase = run_on(
            &self.selector,
            &self.candidates,
            self.class,
            "serial",
            &job,
            ctx,
        )
        .await?;
        Ok(JobOutcome {
            job_id: job.id,
            phases: vec![phase],
        })
    }
}

/// Multi-phase routing across both classes.
pub struct HybridBroker {
    phases: Vec<DeviceClass>,
    qpus: Vec<Rc<dyn Device>>,
    cpus: Vec<Rc<dyn Device>>,
    selector: DeviceSelector,
}

impl fmt::Debug for HybridBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridBroker")
            .field("phases", &self.phases)
            .field("qpus", &self.qpus.len())
            .field("cpus", &self.cpus.len())
            .field("selection", &self.selector.rule())
            .finish()
    }
}

impl HybridBroker {
    /// Build with an explicit phase order. Fails if the order is empty or
    /// names a class with no devices.
    pub fn new(
        devices: &[Rc<dyn Device>],
        phases: Vec<DeviceClass>,
        selection: Selection,
    ) -> SimResult<Self> {
        if phases.is_empty() {
            return Err(SimError::ConfigError(
                "hybrid broker needs at least one phase".to_string(),
            ));
        }
        let qpus = eligible(devices, DeviceClass::Quantum);
        let cpus = eligible(devices, DeviceClass::Classical);
        for class in &phases {
            let candidates = match class {
                DeviceClass::Quantum => &qpus,
                DeviceClass::Classical => &cpus,
            };
            require_candidates(candidates, *class, "hybrid")?;
        }
        Ok(Self {
            phases,
            qpus,
            cpus,
            selector: DeviceSelector::new(selection),
        })
    }

    /// Quantum execution followed by classical post-processing.
    pub fn quantum_then_classical(
        devices: &[Rc<dyn Device>],
        selection: Selection,
    ) -> SimResult<Self> {
        Self::new(
            devices,
            vec![DeviceClass::Quantum, DeviceClass::Classical],
            selection,
        )
    }

    fn candidates(&self, class: DeviceClass) -> &[Rc<dyn Device>] {
        match class {
            DeviceClass::Quantum => &self.qpus,
            DeviceClass::Classical => &self.cpus,
        }
    }
}

#[async_trait(?Send)]
impl Broker for HybridBroker {
    fn name(&self) -> &str {
        "hybrid"
    }

    fn phases(&self) -> Vec<DeviceClass> {
        self.phases.clone()
    }

    async fn handle(&self, job: Job, ctx: &SimContext) -> SimResult<JobOutcome> {
        let mut phases = Vec::with_capacity(self.phases.len());
        for class in &self.phases {
            let outcome = run_on(
                &self.selector,
                self.candidates(*class),
                *class,
                "hybrid",
                &job,
                ctx,
            )
            .await?;
            phases.push(outcome);
        }
        Ok(JobOutcome {
            job_id: job.id,
            phases,
        })
    }
}

/// Declarative broker choice, as found in a configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BrokerSpec {
    Serial {
        class: DeviceClass,
        #[serde(default)]
        selection: Selection,
    },
    Hybrid {
        #[serde(default = "default_phase_order")]
        phases: Vec<DeviceClass>,
        #[serde(default)]
        selection: Selection,
    },
}

fn default_phase_order() -> Vec<DeviceClass> {
    vec![DeviceClass::Quantum, DeviceClass::Classical]
}

impl Default for BrokerSpec {
    fn default() -> Self {
        BrokerSpec::Hybrid {
            phases: default_phase_order(),
            selection: Selection::default(),
        }
    }
}

impl BrokerSpec {
    /// Device classes the broker will need.
    pub fn required_classes(&self) -> Vec<DeviceClass> {
        match self {
            BrokerSpec::Serial { class, .. } => vec![*class],
            BrokerSpec::Hybrid { phases, .. } => phases.clone(),
        }
    }

    /// Build the broker over `devices`.
    pub fn build(&self, devices: &[Rc<dyn Device>]) -> SimResult<Rc<dyn Broker>> {
        let broker: Rc<dyn Broker> = match self {
            BrokerSpec::Serial { class, selection } => {
                Rc::new(SerialBroker::new(devices, *class, *selection)?)
            }
            BrokerSpec::Hybrid { phases, selection } => {
                Rc::new(HybridBroker::new(devices, phases.clone(), *selection)?)
            }
        };
        Ok(broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::clock::Env;
    use crate::device::{CpuSpec, DeviceSpec, QpuSpec};
    use crate::job::PhaseDemand;
    use crate::ledger::Ledger;

    fn context() -> SimContext {
        SimContext::new(Env::new(), Ledger::default(), EventBus::new(), 1)
    }

    fn devices(env: &Env, qpus: usize, cpus: usize) -> Vec<Rc<dyn Device>> {
        let mut out = Vec::new();
        for i in 0..qpus {
            out.push(
                DeviceSpec::Qpu(QpuSpec::new(format!("qpu-{i}"), 20))
                    .build(env)
                    .unwrap(),
            );
        }
        for i in 0..cpus {
            out.push(
                DeviceSpec::Cpu(CpuSpec::new(format!("cpu-{i}")))
                    .build(env)
                    .unwrap(),
            );
        }
        out
    }

    #[test]
    fn test_missing_class_fails_fast() {
        let ctx = context();
        let only_cpus = devices(ctx.env(), 0, 2);

        let err = SerialBroker::new(&only_cpus, DeviceClass::Quantum, Selection::RoundRobin)
            .unwrap_err();
        assert!(matches!(err, SimError::NoEligibleDevice { .. }));
        assert!(err.is_configuration());

        assert!(HybridBroker::quantum_then_classical(&only_cpus, Selection::Random).is_err());
        assert!(HybridBroker::new(&only_cpus, vec![], Selection::Random).is_err());
        assert!(
            HybridBroker::new(&only_cpus, vec![DeviceClass::Classical], Selection::Random).is_ok()
        );
    }

    #[test]
    fn test_round_robin_cycles() {
        let ctx = context();
        let cpus = devices(ctx.env(), 0, 3);
        let selector = DeviceSelector::new(Selection::RoundRobin);

        let names: Vec<String> = (0..5)
            .map(|_| selector.select(&cpus, &ctx).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["cpu-0", "cpu-1", "cpu-2", "cpu-0", "cpu-1"]);
        assert!(selector.select(&[], &ctx).is_none());
    }

    #[test]
    fn test_random_selection_is_seeded() {
        let pick = |seed| {
            let ctx = SimContext::new(Env::new(), Ledger::default(), EventBus::new(), seed);
            let cpus = devices(ctx.env(), 0, 4);
            let selector = DeviceSelector::new(Selection::Random);
            (0..16)
                .map(|_| selector.select(&cpus, &ctx).unwrap().name().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(pick(99), pick(99));
    }

    #[test]
    fn test_least_loaded_prefers_idle_device() {
        let ctx = context();
        let cpus = devices(ctx.env(), 0, 2);
        let busy = Rc::clone(&cpus[0]);
        ctx.env().spawn(async move {
            busy.core()
                .compute()
                .acquire(50, Default::default())
                .await
                .unwrap();
        });
        ctx.env().run(None).unwrap();

        let selector = DeviceSelector::new(Selection::LeastLoaded);
        assert_eq!(selector.select(&cpus, &ctx).unwrap().name(), "cpu-1");
    }

    #[test]
    fn test_hybrid_runs_phases_in_order() {
        let ctx = context();
        let devs = devices(ctx.env(), 1, 1);
        let broker = HybridBroker::quantum_then_classical(&devs, Selection::RoundRobin).unwrap();
        let job = Job::new(JobId(1), 0.0)
            .with_demand(DeviceClass::Quantum, PhaseDemand::new().duration(2.0))
            .with_demand(DeviceClass::Classical, PhaseDemand::new().duration(1.0));

        let c = ctx.clone();
        let handle = ctx.env().spawn(async move { broker.handle(job, &c).await });
        ctx.env().run(None).unwrap();

        let outcome = handle.try_take().unwrap().unwrap();
        let classes: Vec<_> = outcome.phases.iter().map(|p| p.class).collect();
        assert_eq!(classes, vec![DeviceClass::Quantum, DeviceClass::Classical]);
        assert_eq!(outcome.phases[1].start, outcome.phases[0].finish);
        assert_eq!(outcome.finish(), Some(3.0));

        let record = ctx.ledger().record(JobId(1)).unwrap();
        assert!(record.is_paired(DeviceClass::Quantum));
        assert!(record.is_paired(DeviceClass::Classical));
        assert_eq!(record.count("devc_name"), 2);
    }

    #[test]
    fn test_broker_config_deserialize() {
        let spec: BrokerSpec =
            serde_json::from_str(r#"{"policy": "serial", "class": "CPU"}"#).unwrap();
        assert_eq!(
            spec,
            BrokerSpec::Serial {
                class: DeviceClass::Classical,
                selection: Selection::RoundRobin
            }
        );

        let spec: BrokerSpec =
            serde_json::from_str(r#"{"policy": "hybrid", "selection": "least_loaded"}"#).unwrap();
        assert_eq!(
            spec.required_classes(),
            vec![DeviceClass::Quantum, DeviceClass::Classical]
        );
    }
}
