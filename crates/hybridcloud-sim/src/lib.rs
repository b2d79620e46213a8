//! `hybridcloud-sim`: discrete-event simulation of hybrid QPU/CPU clouds.
//!
//! Jobs arrive on a simulated clock, a broker routes them to quantum and
//! classical devices, devices hand out compute and bandwidth capacity from
//! blocking pools, and every phase transition is logged so energy and cost
//! can be reconstructed afterwards.
//!
//! - [`clock`]: single-threaded cooperative executor and simulated time
//! - [`resource`]: capacity pools with priority-then-FIFO waiters
//! - [`device`]: QPU and CPU variants sharing one phase protocol
//! - [`broker`]: serial and hybrid routing policies
//! - [`generator`]: synthetic and replayed arrival feeds
//! - [`bus`] / [`ledger`]: completion notifications and the per-job event log
//! - [`cost`]: power models and electricity price
//!
//! # Quick start
//!
//! ```rust
//! use hybridcloud_sim::broker::{BrokerSpec, Selection};
//! use hybridcloud_sim::device::{CpuSpec, DeviceClass, DeviceSpec, QpuSpec};
//! use hybridcloud_sim::generator::{InterArrival, JobFeed};
//! use hybridcloud_sim::HybridCloudSim;
//!
//! let mut sim = HybridCloudSim::builder()
//!     .seed(1)
//!     .device(DeviceSpec::Qpu(QpuSpec::new("eagle", 127)))
//!     .device(DeviceSpec::Cpu(CpuSpec::new("cpu-0")))
//!     .broker(BrokerSpec::Hybrid {
//!         phases: vec![DeviceClass::Quantum, DeviceClass::Classical],
//!         selection: Selection::RoundRobin,
//!     })
//!     .build()
//!     .unwrap();
//!
//! let feed = JobFeed::generator(InterArrival::Constant { interval: 5.0 }.into_model())
//!     .with_max_jobs(4);
//! let summary = sim.run(feed, None).unwrap();
//! assert_eq!(summary.completed, 4);
//! ```

pub mod broker;
pub mod bus;
pub mod clock;
pub mod config;
pub mod cost;
pub mod device;
pub mod error;
pub mod generator;
pub mod job;
pub mod ledger;
pub mod resource;
pub mod sim;

pub use broker::{Broker, BrokerSpec, HybridBroker, Selection, SerialBroker};
pub use bus::{BusEvent, EventBus};
pub use clock::{Env, SimTime};
pub use config::SimConfig;
pub use cost::{CostConfig, PowerModel};
pub use device::{Device, DeviceClass, DeviceSpec};
pub use error::{SimError, SimResult};
pub use generator::{ArrivalRecord, InterArrival, JobFeed};
pub use job::{Job, JobId, JobSpec, PhaseDemand, Priority};
pub use ledger::{JobCost, JobRecord, Ledger};
pub use resource::Pool;
pub use sim::{HybridCloudSim, RunSummary, SimBuilder, SimContext, run_config};
