//! Tracing setup for the CLI.
//!
//! Console output for interactive use, JSON lines for log collectors. Logs go
//! to stderr so a JSON summary on stdout stays machine-readable.

use anyhow::{Result, anyhow};
use hybridcloud_sim::config::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Tracing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable console output.
    Console,
    /// JSON structured logging.
    Json,
}

impl TracingFormat {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "console" => Ok(Self::Console),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("Invalid log format: {other}")),
        }
    }
}

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Filter directive (e.g. "info", "hybridcloud_sim=debug").
    pub log_level: String,
    pub format: TracingFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            format: TracingFormat::Console,
        }
    }
}

impl TracingConfig {
    /// Derive from the simulation's logging section. Each `-v` replaces the
    /// configured level with a louder one.
    pub fn from_logging(logging: &LoggingConfig, verbose: u8) -> Result<Self> {
        let log_level = match verbose {
            0 => logging.level.to_lowercase(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        };
        Ok(Self {
            log_level,
            format: TracingFormat::parse(&logging.format)?,
        })
    }
}

/// Install the global subscriber.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_new(&config.log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match config.format {
        TracingFormat::Console => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        TracingFormat::Json => fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .json()
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.format, TracingFormat::Console);
    }

    #[test]
    fn test_from_logging() {
        let logging = LoggingConfig {
            level: "WARN".to_string(),
            format: "json".to_string(),
        };
        let config = TracingConfig::from_logging(&logging, 0).unwrap();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.format, TracingFormat::Json);

        assert_eq!(
            TracingConfig::from_logging(&logging, 1).unwrap().log_level,
            "debug"
        );
        assert_eq!(
            TracingConfig::from_logging(&logging, 4).unwrap().log_level,
            "trace"
        );
    }

    #[test]
    fn test_unknown_format() {
        let logging = LoggingConfig {
            level: "info".to_string(),
            format: "xml".to_string(),
        };
        assert!(TracingConfig::from_logging(&logging, 0).is_err());
    }
}
