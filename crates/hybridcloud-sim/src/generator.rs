//! Job arrival feeds.
//!
//! The generator is itself a clock process. For each arrival it creates a
//! [`Job`], logs the arrival, and spawns a separate process that hands the
//! job to the broker. It never touches device capacity itself.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::bus::BusEvent;
use crate::clock::SimTime;
use crate::error::{SimError, SimResult};
use crate::job::{Job, JobId, JobSpec};
use crate::ledger::ARRIVAL;
use crate::sim::SimContext;

/// Callable returning the next inter-arrival delay.
pub type ArrivalModel = Box<dyn FnMut(&mut StdRng) -> SimTime>;

/// Consecutive zero delays an uncapped generator may produce before the run
/// is declared stuck at one instant.
pub const MAX_ZERO_DELAY_ARRIVALS: u64 = 1_000;

/// Built-in inter-arrival distributions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum InterArrival {
    /// Fixed spacing.
    Constant { interval: f64 },
    /// Poisson arrivals with `rate` jobs per time unit.
    Exponential { rate: f64 },
}

impl Default for InterArrival {
    fn default() -> Self {
        InterArrival::Exponential { rate: 1.0 }
    }
}

impl InterArrival {
    /// Draw one delay.
    pub fn sample(&self, rng: &mut StdRng) -> SimTime {
        match *self {
            InterArrival::Constant { interval } => interval,
            InterArrival::Exponential { rate } => {
                let u: f64 = rng.gen_range(0.0..1.0);
                -(1.0 - u).ln() / rate
            }
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        let (name, value) = match *self {
            InterArrival::Constant { interval } => ("interval", interval),
            InterArrival::Exponential { rate } => ("rate", rate),
        };
        // A zero interval would never let the clock move.
        if value.is_finite() && value > 0.0 {
            Ok(())
        } else {
            Err(SimError::ConfigError(format!(
                "inter-arrival {name} is invalid: {value}"
            )))
        }
    }

    /// Box as a generic [`ArrivalModel`].
    pub fn into_model(self) -> ArrivalModel {
        Box::new(move |rng| self.sample(rng))
    }
}

/// One replayed arrival: an offset from the start of the run plus job attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalRecord {
    pub timestamp: SimTime,
    #[serde(flatten)]
    pub job: JobSpec,
}

impl ArrivalRecord {
    pub fn new(timestamp: SimTime, job: JobSpec) -> Self {
        Self { timestamp, job }
    }
}

/// Where arrivals come from.
pub enum JobFeed {
    /// Synthetic arrivals spaced by `model`, optionally capped at `max_jobs`.
    Generator {
        model: ArrivalModel,
        template: JobSpec,
        max_jobs: Option<u64>,
    },
    /// Replay of an ordered arrival sequence.
    Dispatcher { arrivals: Vec<ArrivalRecord> },
}

impl fmt::Debug for JobFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFeed::Generator {
                template, max_jobs, ..
            } => f
                .debug_struct("Generator")
                .field("template", template)
                .field("max_jobs", max_jobs)
                .finish_non_exhaustive(),
            JobFeed::Dispatcher { arrivals } => f
                .debug_struct("Dispatcher")
                .field("arrivals", &arrivals.len())
                .finish(),
        }
    }
}

impl JobFeed {
    /// Synthetic feed with default job attributes and no cap.
    pub fn generator(model: impl FnMut(&mut StdRng) -> SimTime + 'static) -> Self {
        JobFeed::Generator {
            model: Box::new(model),
            template: JobSpec::default(),
            max_jobs: None,
        }
    }

    /// Replay feed. Records are checked and stably ordered by timestamp.
    pub fn dispatcher(mut arrivals: Vec<ArrivalRecord>) -> SimResult<Self> {
        for (index, record) in arrivals.iter().enumerate() {
            if !record.timestamp.is_finite() || record.timestamp < 0.0 {
                return Err(SimError::InvalidArrival {
                    index,
                    reason: format!("timestamp {} must be finite and >= 0", record.timestamp),
                });
            }
        }
        arrivals.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Ok(JobFeed::Dispatcher { arrivals })
    }

    /// Attributes given to every synthetic job. No effect on a replay feed.
    pub fn with_template(mut self, spec: JobSpec) -> Self {
        if let JobFeed::Generator { template, .. } = &mut self {
            *template = spec;
        }
        self
    }

    /// Stop a synthetic feed after `n` jobs. No effect on a replay feed.
    pub fn with_max_jobs(mut self, n: u64) -> Self {
        if let JobFeed::Generator { max_jobs, .. } = &mut self {
            *max_jobs = Some(n);
        }
        self
    }

    /// Whether the feed ends on its own.
    pub fn is_bounded(&self) -> bool {
        match self {
            JobFeed::Generator { max_jobs, .. } => max_jobs.is_some(),
            JobFeed::Dispatcher { .. } => true,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            JobFeed::Generator { .. } => "generator",
            JobFeed::Dispatcher { .. } => "dispatcher",
        }
    }
}

/// Job counters shared between the generator and the job processes it spawns.
#[derive(Debug, Default)]
pub struct RunTally {
    arrived: Cell<u64>,
    completed: Cell<u64>,
    failed: Cell<u64>,
}

impl RunTally {
    pub fn arrived(&self) -> u64 {
        self.arrived.get()
    }

    pub fn completed(&self) -> u64 {
        self.completed.get()
    }

    pub fn failed(&self) -> u64 {
        self.failed.get()
    }

    /// Jobs that arrived and have neither completed nor failed.
    pub fn in_flight(&self) -> u64 {
        self.arrived() - self.completed() - self.failed()
    }

    fn bump(cell: &Cell<u64>) {
        cell.set(cell.get() + 1);
    }
}

/// Drives a [`JobFeed`] inside the simulation.
pub struct JobGenerator {
    feed: JobFeed,
    emitter: Emitter,
}

struct Emitter {
    ctx: SimContext,
    broker: Rc<dyn Broker>,
    tally: Rc<RunTally>,
}

impl Emitter {
    fn emit(&self, spec: JobSpec) {
        let env = self.ctx.env();
        let now = env.now();
        let job = Job::from_spec(JobId(self.tally.arrived()), now, spec);
        RunTally::bump(&self.tally.arrived);

        self.ctx.ledger().log_job_event(job.id, ARRIVAL, now);
        self.ctx.bus().publish(&BusEvent::JobArrived {
            job_id: job.id,
            timestamp: now,
        });
        debug!(job_id = %job.id, at = now, priority = job.priority.value(), "job arrived");

        let ctx = self.ctx.clone();
        let broker = Rc::clone(&self.broker);
        let tally = Rc::clone(&self.tally);
        env.spawn(async move {
            let job_id = job.id;
            match broker.handle(job, &ctx).await {
                Ok(outcome) => {
                    RunTally::bump(&tally.completed);
                    ctx.ledger().finalize_job_energy_cost(job_id);
                    debug!(job_id = %job_id, finish = outcome.finish(), "job completed");
                }
                Err(err) => {
                    RunTally::bump(&tally.failed);
                    warn!(job_id = %job_id, error = %err, "job dispatch failed");
                    ctx.bus().publish(&BusEvent::JobFailed {
                        job_id,
                        reason: err.to_string(),
                        timestamp: ctx.env().now(),
                    });
                }
            }
        });
    }
}

impl JobGenerator {
    pub fn new(
        feed: JobFeed,
        broker: Rc<dyn Broker>,
        ctx: SimContext,
        tally: Rc<RunTally>,
    ) -> Self {
        Self {
            feed,
            emitter: Emitter { ctx, broker, tally },
        }
    }

    /// Emit every arrival of the feed. Returns the number of jobs emitted.
    pub async fn run(self) -> SimResult<u64> {
        let JobGenerator { feed, emitter } = self;
        let env = emitter.ctx.env().clone();
        let mut emitted = 0u64;
        let mut zero_delays = 0u64;
        info!(method = feed.method(), "job feed started");

        match feed {
            JobFeed::Generator {
                mut model,
                template,
                max_jobs,
            } => loop {
                if max_jobs.is_some_and(|max| emitted >= max) {
                    break;
                }
                let delay = emitter.ctx.with_rng(|rng| model(rng));
                if delay == 0.0 {
                    zero_delays += 1;
                } else {
                    zero_delays = 0;
                }
                // Without a cap the clock would never leave this instant.
                if max_jobs.is_none() && zero_delays > MAX_ZERO_DELAY_ARRIVALS {
                    warn!(emitted, at = env.now(), "arrival model stopped advancing time");
                    return Err(SimError::UnboundedRun(format!(
                        "arrival model returned {MAX_ZERO_DELAY_ARRIVALS} zero delays in a row"
                    )));
                }
                env.timeout(delay)?.await;
                emitter.emit(template.clone());
                emitted += 1;
            },
            JobFeed::Dispatcher { arrivals } => {
                let start = env.now();
                for record in arrivals {
                    // Records sharing a timestamp are emitted in one poll, so
                    // they all queue before any device dispatch runs.
                    let delay = start + record.timestamp - env.now();
                    if delay > 0.0 {
                        env.timeout(delay)?.await;
                    }
                    emitter.emit(record.job);
                    emitted += 1;
                }
            }
        }

        info!(emitted, "job feed exhausted");
        Ok(emitted)
    }
}
