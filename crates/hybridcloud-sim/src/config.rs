//! Simulation configuration.
//!
//! Loaded from YAML or JSON (by file extension), then overridden by
//! environment variables, then validated:
//!
//! - `HYBRIDCLOUD_SEED`: random seed
//! - `HYBRIDCLOUD_HORIZON`: simulated-time horizon
//! - `HYBRIDCLOUD_PRICE_PER_KWH`: electricity price
//! - `HYBRIDCLOUD_LOG_LEVEL`: log level filter
//! - `HYBRIDCLOUD_LOG_FORMAT`: "console" or "json"

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::broker::BrokerSpec;
use crate::cost::CostConfig;
use crate::device::{CpuSpec, DeviceSpec, QpuSpec};
use crate::error::{SimError, SimResult};
use crate::generator::{InterArrival, JobFeed};
use crate::job::JobSpec;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Stop the clock here. Required unless the workload caps its job count.
    #[serde(default)]
    pub horizon: Option<f64>,

    #[serde(default)]
    pub broker: BrokerSpec,

    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceSpec>,

    #[serde(default)]
    pub workload: WorkloadConfig,

    #[serde(default)]
    pub cost: CostConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Synthetic workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default)]
    pub inter_arrival: InterArrival,

    /// Stop after this many jobs.
    #[serde(default)]
    pub max_jobs: Option<u64>,

    /// Attributes given to every generated job.
    #[serde(default)]
    pub job: JobSpec,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_seed() -> u64 {
    42
}

fn default_devices() -> Vec<DeviceSpec> {
    vec![
        DeviceSpec::Qpu(QpuSpec::default()),
        DeviceSpec::Cpu(CpuSpec::default()),
    ]
}

fn default_max_jobs() -> Option<u64> {
    Some(100)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "console".to_string()
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            horizon: None,
            broker: BrokerSpec::default(),
            devices: default_devices(),
            workload: WorkloadConfig::default(),
            cost: CostConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            inter_arrival: InterArrival::default(),
            max_jobs: default_max_jobs(),
            job: JobSpec::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WorkloadConfig {
    /// Build the synthetic feed this workload describes.
    pub fn feed(&self) -> JobFeed {
        let feed =
            JobFeed::generator(self.inter_arrival.into_model()).with_template(self.job.clone());
        match self.max_jobs {
            Some(n) => feed.with_max_jobs(n),
            None => feed,
        }
    }
}

impl SimConfig {
    /// Load from a YAML (`.yaml`/`.yml`) or JSON (`.json`) file and validate
    /// it, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SimResult<Self> {
        let config = Self::parse_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Load with precedence: environment > file > defaults.
    pub fn load(config_file: Option<&Path>) -> SimResult<Self> {
        Self::load_with_env(config_file, |key| std::env::var(key).ok())
    }

    /// Like [`SimConfig::load`], reading overrides through `lookup`.
    /// Validation runs once, after the overrides are applied.
    pub fn load_with_env(
        config_file: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> SimResult<Self> {
        let config = match config_file {
            Some(path) => Self::parse_file(path)?,
            None => SimConfig::default(),
        };

        let config = config.merge_env_with(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variables that are set. Unparseable values are an
    /// error rather than silently ignored.
    pub fn merge_env(self) -> SimResult<Self> {
        self.merge_env_with(|key| std::env::var(key).ok())
    }

    fn merge_env_with(mut self, lookup: impl Fn(&str) -> Option<String>) -> SimResult<Self> {
        if let Some(v) = lookup("HYBRIDCLOUD_SEED") {
            self.seed = parse_env("HYBRIDCLOUD_SEED", &v)?;
        }
        if let Some(v) = lookup("HYBRIDCLOUD_HORIZON") {
            self.horizon = Some(parse_env("HYBRIDCLOUD_HORIZON", &v)?);
        }
        if let Some(v) = lookup("HYBRIDCLOUD_PRICE_PER_KWH") {
            self.cost.electricity_price_per_kwh = parse_env("HYBRIDCLOUD_PRICE_PER_KWH", &v)?;
        }
        if let Some(v) = lookup("HYBRIDCLOUD_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("HYBRIDCLOUD_LOG_FORMAT") {
            self.logging.format = v;
        }
        Ok(self)
    }

    fn parse_file(path: &Path) -> SimResult<Self> {
        let contents = std::fs::read_to_string(path)?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        match ext.as_deref() {
            Some("json") => Ok(serde_json::from_str(&contents)?),
            Some("yaml" | "yml") | None => Ok(serde_yaml_ng::from_str(&contents)?),
            Some(other) => Err(SimError::ConfigError(format!(
                "unsupported config extension: .{other}"
            ))),
        }
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> SimResult<()> {
        if let Some(h) = self.horizon {
            if !h.is_finite() || h < 0.0 {
                return Err(SimError::ConfigError(format!(
                    "horizon must be finite and >= 0, got {h}"
                )));
            }
        }

        if self.devices.is_empty() {
            return Err(SimError::ConfigError(
                "at least one device must be configured".to_string(),
            ));
        }
        for device in &self.devices {
            device.validate()?;
        }
        for class in self.broker.required_classes() {
            if !self.devices.iter().any(|d| d.class() == class) {
                return Err(SimError::NoEligibleDevice {
                    class: class.to_string(),
                    reason: "broker requires it but no device of that class is configured"
                        .to_string(),
                });
            }
        }

        self.workload.inter_arrival.validate()?;
        if self.workload.max_jobs.is_none() && self.horizon.is_none() {
            return Err(SimError::UnboundedRun(
                "set workload.max_jobs or horizon".to_string(),
            ));
        }

        self.cost.validate()?;

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(SimError::ConfigError(format!("Invalid log level: {other}")));
            }
        }
        match self.logging.format.as_str() {
            "console" | "json" => {}
            other => {
                return Err(SimError::ConfigError(format!("Invalid log format: {other}")));
            }
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> SimResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SimError::ConfigError(format!("{name} has an invalid value: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Selection;
    use crate::device::DeviceClass;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimConfig::default();
        assert_eq!(config.seed, 42);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.workload.max_jobs, Some(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
seed: 7
horizon: 500.0
broker:
  policy: serial
  class: CPU
  selection: least_loaded
devices:
  - kind: cpu
    name: cpu-a
    compute_capacity: 10
    bandwidth_capacity: 20
  - kind: profiled_cpu
    name: ryzen-a
    threads: 24
workload:
  inter_arrival:
    model: constant
    interval: 2.5
  job:
    priority: 150
    classical:
      work: 40.0
cost:
  electricity_price_per_kwh: 0.22
  cpu_power_kw:
    ryzen-a:
      idle_kw: 0.05
      peak_kw: 0.2
logging:
  level: debug
"#
        )
        .unwrap();

        let config = SimConfig::from_file(file.path()).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.horizon, Some(500.0));
        assert_eq!(
            config.broker,
            BrokerSpec::Serial {
                class: DeviceClass::Classical,
                selection: Selection::LeastLoaded
            }
        );
        assert_eq!(config.devices[1].name(), "ryzen-a");
        assert_eq!(
            config.workload.inter_arrival,
            InterArrival::Constant { interval: 2.5 }
        );
        assert_eq!(config.workload.job.classical.work, Some(40.0));
        assert_eq!(config.cost.electricity_price_per_kwh, 0.22);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "console");
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"seed": 3, "devices": [{{"kind": "qpu", "name": "q"}}, {{"kind": "cpu", "name": "c"}}]}}"#
        )
        .unwrap();

        let config = SimConfig::from_file(file.path()).unwrap();
        assert_eq!(config.seed, 3);
        assert_eq!(config.devices.len(), 2);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        assert!(matches!(
            SimConfig::from_file(file.path()),
            Err(SimError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_missing_class() {
        let config = SimConfig {
            devices: vec![DeviceSpec::Cpu(CpuSpec::default())],
            ..SimConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SimError::NoEligibleDevice { .. })
        ));
    }

    #[test]
    fn test_validate_unbounded_workload() {
        let mut config = SimConfig::default();
        config.workload.max_jobs = None;
        assert!(matches!(
            config.validate(),
            Err(SimError::UnboundedRun(_))
        ));
        config.horizon = Some(100.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_logging() {
        let mut config = SimConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = SimConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_horizon_completes_file_before_validation() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "workload:\n  max_jobs: null\n").unwrap();

        // On its own the file describes an unbounded run.
        assert!(matches!(
            SimConfig::from_file(file.path()),
            Err(SimError::UnboundedRun(_))
        ));
        assert!(matches!(
            SimConfig::load_with_env(Some(file.path()), |_| None),
            Err(SimError::UnboundedRun(_))
        ));

        let config = SimConfig::load_with_env(Some(file.path()), |key| {
            (key == "HYBRIDCLOUD_HORIZON").then(|| "50".to_string())
        })
        .unwrap();
        assert_eq!(config.horizon, Some(50.0));
        assert_eq!(config.workload.max_jobs, None);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "seed: 9\nlogging:\n  level: info\n").unwrap();

        let config = SimConfig::load_with_env(Some(file.path()), |key| match key {
            "HYBRIDCLOUD_SEED" => Some("21".to_string()),
            "HYBRIDCLOUD_LOG_LEVEL" => Some("warn".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.seed, 21);
        assert_eq!(config.logging.level, "warn");

        let bad = SimConfig::load_with_env(Some(file.path()), |key| {
            (key == "HYBRIDCLOUD_LOG_FORMAT").then(|| "xml".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_parse_env_value() {
        assert_eq!(parse_env::<u64>("X", " 12 ").unwrap(), 12);
        assert!(parse_env::<f64>("X", "soon").is_err());
    }

    #[test]
    fn test_workload_feed() {
        let mut workload = WorkloadConfig::default();
        assert!(workload.feed().is_bounded());
        workload.max_jobs = None;
        assert!(!workload.feed().is_bounded());
    }
}
