//! Per-job event log and energy/cost finalization.
//!
//! Each job owns a map from event type to an ordered list of values. A job
//! that visits the same device class twice appends a second entry to each
//! of that class's lists, so `qpu_start[i]` and `qpu_finish[i]` always
//! describe the same visit.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Serialize, Serializer};
use tracing::debug;

use crate::bus::{self, BusEvent, EventBus, SubscriptionId};
use crate::cost::CostConfig;
use crate::device::DeviceClass;
use crate::job::JobId;

/// Event type logged once when a job is created.
pub const ARRIVAL: &str = "arrival";

/// Device name of every phase, in visit order regardless of class.
pub const DEVICE_NAME: &str = "devc_name";

/// Per-class phase events. The full key is `<class tag>_<suffix>`,
/// e.g. `qpu_start` or `cpu_units`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseEvent {
    /// Name of the device serving the phase.
    Device,
    /// Time the job reached the device.
    Arrive,
    /// Compute units requested.
    Units,
    /// Bandwidth units requested.
    Bandwidth,
    /// Compute capacity of the device.
    Capacity,
    /// Time service began (all capacity granted).
    Start,
    /// Time service ended.
    Finish,
}

impl PhaseEvent {
    fn suffix(self) -> &'static str {
        match self {
            PhaseEvent::Device => "devc",
            PhaseEvent::Arrive => "arrive",
            PhaseEvent::Units => "units",
            PhaseEvent::Bandwidth => "bw",
            PhaseEvent::Capacity => "capacity",
            PhaseEvent::Start => "start",
            PhaseEvent::Finish => "finish",
        }
    }

    /// Ledger key for this event on the given device class.
    pub fn key(self, class: DeviceClass) -> String {
        format!("{}_{}", class.tag(), self.suffix())
    }
}

/// One logged value.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Int(u64),
    Float(f64),
    Text(String),
}

impl EventValue {
    /// Numeric view of the value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EventValue::Int(v) => Some(*v as f64),
            EventValue::Float(v) => Some(*v),
            EventValue::Text(_) => None,
        }
    }

    /// Integer view of the value.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            EventValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String view of the value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EventValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<u64> for EventValue {
    fn from(v: u64) -> Self {
        EventValue::Int(v)
    }
}

impl From<u32> for EventValue {
    fn from(v: u32) -> Self {
        EventValue::Int(u64::from(v))
    }
}

impl From<f64> for EventValue {
    fn from(v: f64) -> Self {
        EventValue::Float(v)
    }
}

impl From<&str> for EventValue {
    fn from(v: &str) -> Self {
        EventValue::Text(v.to_string())
    }
}

impl From<String> for EventValue {
    fn from(v: String) -> Self {
        EventValue::Text(v)
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventValue::Int(v) => write!(f, "{v}"),
            EventValue::Float(v) => write!(f, "{v:.4}"),
            EventValue::Text(s) => f.write_str(s),
        }
    }
}

impl Serialize for EventValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EventValue::Int(v) => serializer.serialize_u64(*v),
            EventValue::Float(v) => serializer.serialize_f64(round4(*v)),
            EventValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

/// Round to 4 decimals. Applied on output only.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn serialize_round4<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round4(*value))
}

/// Energy accounting for one completed device visit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub device: String,
    #[serde(serialize_with = "serialize_round4")]
    pub time_s: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub energy_kwh: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub power_kw: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub utilization: f64,
}

/// Totals written back into a job record by finalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobCost {
    #[serde(serialize_with = "serialize_round4")]
    pub qpu_time_s: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub cpu_time_s: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub energy_qpu_kwh: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub energy_cpu_kwh: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub energy_total_kwh: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub cost_energy_total: f64,
    pub qpu_segments: Vec<Segment>,
    pub cpu_segments: Vec<Segment>,
}

impl JobCost {
    /// Segments of one device class.
    pub fn segments(&self, class: DeviceClass) -> &[Segment] {
        match class {
            DeviceClass::Quantum => &self.qpu_segments,
            DeviceClass::Classical => &self.cpu_segments,
        }
    }
}

/// Everything known about one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobRecord {
    #[serde(flatten)]
    pub events: BTreeMap<String, Vec<EventValue>>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub cost: Option<JobCost>,
}

impl JobRecord {
    /// Values logged under `event_type`, empty if none.
    pub fn values(&self, event_type: &str) -> &[EventValue] {
        self.events
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of values logged under `event_type`.
    pub fn count(&self, event_type: &str) -> usize {
        self.values(event_type).len()
    }

    fn floats(&self, event_type: &str) -> Vec<f64> {
        self.values(event_type)
            .iter()
            .filter_map(EventValue::as_f64)
            .collect()
    }

    /// Whether every started phase of `class` has also finished.
    pub fn is_paired(&self, class: DeviceClass) -> bool {
        self.count(&PhaseEvent::Start.key(class)) == self.count(&PhaseEvent::Finish.key(class))
    }

    /// Whether some phase has started but not finished.
    pub fn is_in_flight(&self) -> bool {
        !(self.is_paired(DeviceClass::Quantum) && self.is_paired(DeviceClass::Classical))
    }

    fn class_segments(&self, class: DeviceClass, cost: &CostConfig) -> (f64, f64, Vec<Segment>) {
        let starts = self.floats(&PhaseEvent::Start.key(class));
        let finishes = self.floats(&PhaseEvent::Finish.key(class));
        let devices = self.values(&PhaseEvent::Device.key(class));
        let units = self.values(&PhaseEvent::Units.key(class));
        let capacity = self.values(&PhaseEvent::Capacity.key(class));

        let mut time_s = 0.0;
        let mut energy_kwh = 0.0;
        let mut segments = Vec::new();

        for (i, (start, finish)) in starts.iter().zip(&finishes).enumerate() {
            let t = finish - start;
            let device = devices
                .get(i)
                .and_then(EventValue::as_str)
                .unwrap_or(class.unknown_device())
                .to_string();
            let utilization = match (
                units.get(i).and_then(EventValue::as_f64),
                capacity.get(i).and_then(EventValue::as_f64),
            ) {
                (Some(u), Some(c)) if c > 0.0 => u / c,
                _ => 1.0,
            };
            let power_kw = cost.power_model(class, &device).power_kw(utilization);
            let e = CostConfig::energy_kwh(power_kw, t);

            time_s += t;
            energy_kwh += e;
            segments.push(Segment {
                device,
                time_s: t,
                energy_kwh: e,
                power_kw,
                utilization,
            });
        }

        (time_s, energy_kwh, segments)
    }
}

struct LedgerState {
    records: BTreeMap<JobId, JobRecord>,
    cost: CostConfig,
}

/// Job records store. Clones share one store.
#[derive(Clone)]
pub struct Ledger {
    state: Rc<RefCell<LedgerState>>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger").field("jobs", &self.len()).finish()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(CostConfig::default())
    }
}

impl Ledger {
    /// Create an empty ledger priced with `cost`.
    pub fn new(cost: CostConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(LedgerState {
                records: BTreeMap::new(),
                cost,
            })),
        }
    }

    /// The cost configuration used by finalization.
    pub fn cost_config(&self) -> CostConfig {
        self.state.borrow().cost.clone()
    }

    /// Append `value` to `records[job_id][event_type]`, creating both on first use.
    pub fn log_job_event(
        &self,
        job_id: JobId,
        event_type: impl Into<String>,
        value: impl Into<EventValue>,
    ) {
        self.state
            .borrow_mut()
            .records
            .entry(job_id)
            .or_default()
            .events
            .entry(event_type.into())
            .or_default()
            .push(value.into());
    }

    /// Append a per-class phase event.
    pub fn log_phase_event(
        &self,
        job_id: JobId,
        class: DeviceClass,
        event: PhaseEvent,
        value: impl Into<EventValue>,
    ) {
        self.log_job_event(job_id, event.key(class), value);
    }

    /// Snapshot of one job's record.
    pub fn record(&self, job_id: JobId) -> Option<JobRecord> {
        self.state.borrow().records.get(&job_id).cloned()
    }

    /// Values logged for one job under one event type.
    pub fn events(&self, job_id: JobId, event_type: &str) -> Vec<EventValue> {
        self.state
            .borrow()
            .records
            .get(&job_id)
            .map(|r| r.values(event_type).to_vec())
            .unwrap_or_default()
    }

    /// Snapshot of every record, ordered by job id.
    pub fn records(&self) -> BTreeMap<JobId, JobRecord> {
        self.state.borrow().records.clone()
    }

    /// Ids of every job with at least one event.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.state.borrow().records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `job_id` has every started phase finished.
    pub fn is_paired(&self, job_id: JobId, class: DeviceClass) -> bool {
        self.state
            .borrow()
            .records
            .get(&job_id)
            .is_none_or(|r| r.is_paired(class))
    }

    /// Derive per-segment and total energy and cost from the job's phase
    /// events and store them in its record.
    ///
    /// Returns `None` for a job with no records. Re-running with no new
    /// events produces identical output.
    pub fn finalize_job_energy_cost(&self, job_id: JobId) -> Option<JobCost> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let record = state.records.get_mut(&job_id)?;

        let (qpu_time_s, energy_qpu_kwh, qpu_segments) =
            record.class_segments(DeviceClass::Quantum, &state.cost);
        let (cpu_time_s, energy_cpu_kwh, cpu_segments) =
            record.class_segments(DeviceClass::Classical, &state.cost);
        let energy_total_kwh = energy_qpu_kwh + energy_cpu_kwh;

        let cost = JobCost {
            qpu_time_s,
            cpu_time_s,
            energy_qpu_kwh,
            energy_cpu_kwh,
            energy_total_kwh,
            cost_energy_total: state.cost.cost(energy_total_kwh),
            qpu_segments,
            cpu_segments,
        };
        debug!(
            job_id = %job_id,
            energy_kwh = energy_total_kwh,
            cost = cost.cost_energy_total,
            "finalized job cost"
        );
        record.cost = Some(cost.clone());
        Some(cost)
    }

    /// Finalize every job currently in the ledger.
    pub fn finalize_all(&self) {
        for job_id in self.job_ids() {
            self.finalize_job_energy_cost(job_id);
        }
    }

    /// Energy per device over all finalized jobs.
    pub fn energy_by_device(&self) -> BTreeMap<String, f64> {
        let mut totals = BTreeMap::new();
        let state = self.state.borrow();
        for cost in state.records.values().filter_map(|r| r.cost.as_ref()) {
            for seg in cost.qpu_segments.iter().chain(&cost.cpu_segments) {
                *totals.entry(seg.device.clone()).or_insert(0.0) += seg.energy_kwh;
            }
        }
        totals
    }

    /// Record every `device_finish` published on `bus`.
    pub fn attach(&self, bus: &EventBus) -> SubscriptionId {
        let ledger = self.clone();
        bus.subscribe(bus::DEVICE_FINISH, move |event| {
            if let BusEvent::DeviceFinish {
                job_id, timestamp, ..
            } = event
            {
                ledger.log_job_event(*job_id, bus::DEVICE_FINISH, *timestamp);
            }
        })
    }
}
