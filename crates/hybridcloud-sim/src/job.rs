//! Job types for the hybrid cloud simulator.

use serde::{Deserialize, Serialize};

use crate::clock::SimTime;
use crate::device::DeviceClass;

/// Unique identifier for a simulated job, assigned in arrival order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job priority. Higher values mean higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u32);

impl Priority {
    /// Default priority (100).
    pub const DEFAULT: Priority = Priority(100);

    /// Low priority (50).
    pub const LOW: Priority = Priority(50);

    /// High priority (150).
    pub const HIGH: Priority = Priority(150);

    /// Critical priority (200).
    pub const CRITICAL: Priority = Priority(200);

    /// Create a new priority with the given value.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Create a low priority.
    pub fn low() -> Self {
        Self::LOW
    }

    /// Create a high priority.
    pub fn high() -> Self {
        Self::HIGH
    }

    /// Create a critical priority.
    pub fn critical() -> Self {
        Self::CRITICAL
    }

    /// Get the numeric value.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Parse a named priority class (low, default, high, critical) or a number.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::LOW),
            "default" | "normal" => Some(Self::DEFAULT),
            "high" => Some(Self::HIGH),
            "critical" => Some(Self::CRITICAL),
            other => other.parse().ok().map(Self),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// What a job asks of one device class.
///
/// Every field is optional: a device fills the gaps from its own sizing
/// policy (fixed defaults, a random draw, or its performance model).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseDemand {
    /// Compute units (qubits on a QPU, CPU units on a classical device).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_units: Option<u64>,

    /// Bandwidth units (control channels / memory bandwidth).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_units: Option<u64>,

    /// Abstract amount of computation for performance-scaled devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work: Option<f64>,

    /// Explicit service duration; overrides any device policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl PhaseDemand {
    /// Create an empty demand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the compute-unit demand.
    pub fn compute(mut self, units: u64) -> Self {
        self.compute_units = Some(units);
        self
    }

    /// Set the bandwidth-unit demand.
    pub fn bandwidth(mut self, units: u64) -> Self {
        self.bandwidth_units = Some(units);
        self
    }

    /// Set the work quantity.
    pub fn work(mut self, work: f64) -> Self {
        self.work = Some(work);
        self
    }

    /// Set an explicit duration.
    pub fn duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Job attributes as supplied by an arrival feed, before an id is assigned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    /// Priority class.
    pub priority: Priority,

    /// Demand for the quantum phase.
    pub quantum: PhaseDemand,

    /// Demand for the classical phase.
    pub classical: PhaseDemand,
}

impl JobSpec {
    /// Default priority, empty demands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the demand for a device class.
    pub fn with_demand(mut self, class: DeviceClass, demand: PhaseDemand) -> Self {
        match class {
            DeviceClass::Quantum => self.quantum = demand,
            DeviceClass::Classical => self.classical = demand,
        }
        self
    }
}

/// A job flowing through the simulated cloud. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,

    /// Simulated arrival time.
    pub arrival: SimTime,

    /// Priority class used when contending for device admission.
    pub priority: Priority,

    /// Demand for the quantum phase.
    pub quantum: PhaseDemand,

    /// Demand for the classical phase.
    pub classical: PhaseDemand,
}

impl Job {
    /// Create a job with default priority and empty demands.
    pub fn new(id: JobId, arrival: SimTime) -> Self {
        Self::from_spec(id, arrival, JobSpec::default())
    }

    /// Create a job from feed attributes.
    pub fn from_spec(id: JobId, arrival: SimTime, spec: JobSpec) -> Self {
        Self {
            id,
            arrival,
            priority: spec.priority,
            quantum: spec.quantum,
            classical: spec.classical,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the demand for a device class.
    pub fn with_demand(mut self, class: DeviceClass, demand: PhaseDemand) -> Self {
        match class {
            DeviceClass::Quantum => self.quantum = demand,
            DeviceClass::Classical => self.classical = demand,
        }
        self
    }

    /// Demand for the given device class.
    pub fn demand(&self, class: DeviceClass) -> &PhaseDemand {
        match class {
            DeviceClass::Quantum => &self.quantum,
            DeviceClass::Classical => &self.classical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::critical() > Priority::high());
        assert!(Priority::high() > Priority::default());
        assert!(Priority::default() > Priority::low());
        assert_eq!(Priority::default().value(), 100);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::parse("HIGH"), Some(Priority::HIGH));
        assert_eq!(Priority::parse("normal"), Some(Priority::DEFAULT));
        assert_eq!(Priority::parse("175"), Some(Priority(175)));
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn test_job_demand_by_class() {
        let job = Job::new(JobId(7), 1.5)
            .with_priority(Priority::high())
            .with_demand(DeviceClass::Quantum, PhaseDemand::new().compute(27))
            .with_demand(
                DeviceClass::Classical,
                PhaseDemand::new().compute(6).bandwidth(5).work(120.0),
            );

        assert_eq!(job.demand(DeviceClass::Quantum).compute_units, Some(27));
        assert_eq!(job.demand(DeviceClass::Classical).bandwidth_units, Some(5));
        assert_eq!(job.demand(DeviceClass::Classical).work, Some(120.0));
        assert_eq!(job.priority, Priority::HIGH);
    }

    #[test]
    fn test_job_attributes_deserialize_defaults() {
        let spec: JobSpec =
            serde_json::from_str(r#"{"classical": {"compute_units": 8, "duration": 2.0}}"#)
                .unwrap();
        assert_eq!(spec.priority, Priority::DEFAULT);
        assert_eq!(spec.quantum, PhaseDemand::default());
        assert_eq!(spec.classical.compute_units, Some(8));
        assert_eq!(spec.classical.duration, Some(2.0));

        let job = Job::from_spec(JobId(1), 0.0, spec);
        assert_eq!(job.id.to_string(), "1");
    }
}
