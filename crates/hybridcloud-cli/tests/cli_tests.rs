//! CLI argument parsing and end-to-end tests.
//!
//! Parsing is checked against a mirror of the binary's clap structs; the
//! end-to-end tests run the built `hybridcloud` binary on temporary configs.

// ============================================================================
// Clap argument parsing
// ============================================================================

mod clap_parsing {
    use std::path::PathBuf;

    use clap::{Parser, Subcommand};

    // Mirror the CLI struct for testing (since main.rs is a binary)
    #[derive(Parser)]
    #[command(name = "hybridcloud")]
    struct TestCli {
        #[arg(short, long, action = clap::ArgAction::Count, global = true)]
        verbose: u8,

        #[arg(short, long, global = true)]
        config: Option<PathBuf>,

        #[command(subcommand)]
        command: TestCommands,
    }

    #[derive(Subcommand)]
    enum TestCommands {
        Run {
            #[arg(short, long)]
            arrivals: Option<PathBuf>,
            #[arg(long)]
            seed: Option<u64>,
            #[arg(long)]
            horizon: Option<f64>,
            #[arg(long)]
            max_jobs: Option<u64>,
            #[arg(short, long, default_value = "table")]
            format: String,
            #[arg(short, long)]
            output: Option<PathBuf>,
        },
        Validate,
        Devices,
    }

    #[test]
    fn test_run_defaults() {
        let cli = TestCli::try_parse_from(["hybridcloud", "run"]).unwrap();
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
        match cli.command {
            TestCommands::Run {
                arrivals,
                seed,
                horizon,
                max_jobs,
                format,
                output,
            } => {
                assert!(arrivals.is_none());
                assert!(seed.is_none());
                assert!(horizon.is_none());
                assert!(max_jobs.is_none());
                assert_eq!(format, "table");
                assert!(output.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_all_flags() {
        let cli = TestCli::try_parse_from([
            "hybridcloud",
            "-vv",
            "run",
            "--config",
            "cloud.yaml",
            "-a",
            "trace.json",
            "--seed",
            "7",
            "--horizon",
            "120.5",
            "--max-jobs",
            "30",
            "-f",
            "json",
            "-o",
            "out.json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("cloud.yaml")));
        match cli.command {
            TestCommands::Run {
                arrivals,
                seed,
                horizon,
                max_jobs,
                format,
                output,
            } => {
                assert_eq!(arrivals, Some(PathBuf::from("trace.json")));
                assert_eq!(seed, Some(7));
                assert_eq!(horizon, Some(120.5));
                assert_eq!(max_jobs, Some(30));
                assert_eq!(format, "json");
                assert_eq!(output, Some(PathBuf::from("out.json")));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_validate_and_devices() {
        let cli = TestCli::try_parse_from(["hybridcloud", "validate", "-c", "a.yaml"]).unwrap();
        assert!(matches!(cli.command, TestCommands::Validate));
        assert_eq!(cli.config, Some(PathBuf::from("a.yaml")));

        let cli = TestCli::try_parse_from(["hybridcloud", "devices"]).unwrap();
        assert!(matches!(cli.command, TestCommands::Devices));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(TestCli::try_parse_from(["hybridcloud", "run", "--seed", "minus"]).is_err());
        assert!(TestCli::try_parse_from(["hybridcloud", "run", "--max-jobs", "-3"]).is_err());
        assert!(TestCli::try_parse_from(["hybridcloud", "simulate"]).is_err());
        assert!(TestCli::try_parse_from(["hybridcloud"]).is_err());
    }
}

// ============================================================================
// End-to-end runs of the binary
// ============================================================================

mod binary {
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::process::{Command, Output};

    const SMALL_CONFIG: &str = r#"
seed: 5
broker:
  policy: hybrid
devices:
  - kind: qpu
    name: q0
    qubits: 5
  - kind: cpu
    name: c0
    compute_capacity: 10
    bandwidth_capacity: 20
workload:
  inter_arrival:
    model: constant
    interval: 1.0
  max_jobs: 6
logging:
  level: warn
"#;

    fn hybridcloud(args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_hybridcloud"))
            .args(args)
            .env_remove("HYBRIDCLOUD_CONFIG")
            .env_remove("HYBRIDCLOUD_SEED")
            .env_remove("HYBRIDCLOUD_HORIZON")
            .env_remove("HYBRIDCLOUD_PRICE_PER_KWH")
            .env_remove("HYBRIDCLOUD_LOG_LEVEL")
            .env_remove("HYBRIDCLOUD_LOG_FORMAT")
            .output()
            .expect("failed to launch hybridcloud")
    }

    fn write_config(contents: &str, suffix: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn bundled(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("configs").join(name)
    }

    fn run_json(args: &[&str]) -> serde_json::Value {
        let output = hybridcloud(args);
        assert!(
            output.status.success(),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }

    #[test]
    fn test_run_json_summary() {
        let config = write_config(SMALL_CONFIG, ".yaml");
        let path = config.path().to_str().unwrap();

        let summary = run_json(&["run", "--config", path, "--format", "json"]);
        assert_eq!(summary["seed"], 5);
        assert_eq!(summary["arrived"], 6);
        assert_eq!(summary["completed"], 6);
        assert_eq!(summary["failed"], 0);
        assert_eq!(summary["jobs"].as_object().unwrap().len(), 6);
        assert!(summary["jobs"]["0"]["qpu_start"].is_array());
        assert!(summary["jobs"]["0"]["energy_total_kwh"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_run_overrides_and_output_file() {
        let config = write_config(SMALL_CONFIG, ".yaml");
        let out = tempfile::Builder::new().suffix(".json").tempfile().unwrap();

        let output = hybridcloud(&[
            "run",
            "--config",
            config.path().to_str().unwrap(),
            "--max-jobs",
            "2",
            "--seed",
            "11",
            "--output",
            out.path().to_str().unwrap(),
        ]);
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("Simulation finished"));

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.path()).unwrap()).unwrap();
        assert_eq!(written["seed"], 11);
        assert_eq!(written["completed"], 2);
    }

    #[test]
    fn test_run_is_reproducible() {
        let config = write_config(SMALL_CONFIG, ".yaml");
        let path = config.path().to_str().unwrap();

        let first = run_json(&["run", "-c", path, "-f", "json"]);
        let second = run_json(&["run", "-c", path, "-f", "json"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_replay_bundled_arrivals() {
        let config = write_config(SMALL_CONFIG, ".yaml");
        let arrivals = bundled("arrivals.json");

        let summary = run_json(&[
            "run",
            "-c",
            config.path().to_str().unwrap(),
            "--arrivals",
            arrivals.to_str().unwrap(),
            "-f",
            "json",
        ]);
        assert_eq!(summary["arrived"], 4);
        assert_eq!(summary["completed"], 4);
        // Both t=0 jobs want the whole chip; the high-priority one goes first.
        assert_eq!(summary["jobs"]["1"]["qpu_start"][0], 0.0);
        assert_eq!(summary["jobs"]["0"]["qpu_start"][0], 1.0);
    }

    #[test]
    fn test_validate_bundled_config() {
        let output = hybridcloud(&["validate", "-c", bundled("hybrid.yaml").to_str().unwrap()]);
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("Configuration OK"));
        assert!(stdout.contains("QPU -> CPU"));
    }

    #[test]
    fn test_devices_lists_capacities() {
        let output = hybridcloud(&["devices", "-c", bundled("hybrid.yaml").to_str().unwrap()]);
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("eagle"));
        assert!(stdout.contains("ryzen-0"));
        assert!(stdout.contains("Compute units: 128"));
        assert!(stdout.contains("15..30 kW"));
    }

    #[test]
    fn test_invalid_config_fails() {
        let config = write_config(
            "devices:\n  - kind: cpu\n    name: c0\nlogging:\n  level: loud\n",
            ".yaml",
        );
        let output = hybridcloud(&["validate", "-c", config.path().to_str().unwrap()]);
        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
    }

    #[test]
    fn test_missing_config_fails() {
        let output = hybridcloud(&["validate", "-c", "/nonexistent/cloud.yaml"]);
        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("File not found"));
    }

    #[test]
    fn test_unknown_format_fails() {
        let config = write_config(SMALL_CONFIG, ".yaml");
        let output = hybridcloud(&[
            "run",
            "-c",
            config.path().to_str().unwrap(),
            "-f",
            "csv",
        ]);
        assert!(!output.status.success());
    }
}
