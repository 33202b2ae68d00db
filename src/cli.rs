//! Command-line interface definitions.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::profile::SizeMode;
use crate::session::Scenario;

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "linkprobe",
    version,
    about = "Latency, jitter and loss characterization for radio serial links"
)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured log level (e.g. debug, linkprobe=trace).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a single measurement scenario.
    Run(RunArgs),
    /// Run the full suite: baseline plus the three load tiers.
    Suite(SuiteArgs),
    /// Four-timestamp latency decomposition (no background traffic).
    Detailed(DetailedArgs),
    /// Inspect the packet size profile.
    Profile(ProfileArgs),
    /// Print the effective configuration, or write a default file.
    Config(ConfigArgs),
}

/// Named load tier for the CLI; `--bandwidth` switches to a custom rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioArg {
    Baseline,
    Light,
    Medium,
    Heavy,
}

impl ScenarioArg {
    pub fn to_scenario(self, bandwidth_override: Option<f64>) -> Scenario {
        match bandwidth_override {
            Some(b) => Scenario::Custom(b),
            None => match self {
                Self::Baseline => Scenario::Baseline,
                Self::Light => Scenario::Light,
                Self::Medium => Scenario::Medium,
                Self::Heavy => Scenario::Heavy,
            },
        }
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Load tier to run under.
    #[arg(value_enum, default_value = "baseline")]
    pub scenario: ScenarioArg,

    /// Custom background bandwidth in bytes per second (overrides the tier).
    #[arg(long)]
    pub bandwidth: Option<f64>,

    /// Override the configured traffic size sampling mode.
    #[arg(long, value_enum)]
    pub size_mode: Option<SizeMode>,

    /// Draw probe sizes from the size profile in this mode instead of the
    /// fixed packet size.
    #[arg(long, value_enum)]
    pub probe_size_mode: Option<SizeMode>,

    /// How long to run.
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub duration: Duration,

    #[command(flatten)]
    pub common: CommonRunArgs,
}

#[derive(Debug, Args)]
pub struct SuiteArgs {
    /// How long to run each scenario.
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub duration: Duration,

    #[command(flatten)]
    pub common: CommonRunArgs,
}

#[derive(Debug, Args)]
pub struct DetailedArgs {
    /// Number of sequential measurements.
    #[arg(long, default_value_t = 50)]
    pub count: usize,

    #[command(flatten)]
    pub common: CommonRunArgs,
}

#[derive(Debug, Args)]
pub struct CommonRunArgs {
    /// Use an in-memory loopback instead of the serial ports (self-test).
    #[arg(long)]
    pub loopback: bool,

    /// One-way delay of the loopback link.
    #[arg(long, default_value = "5ms", value_parser = parse_duration)]
    pub loopback_delay: Duration,

    /// Write the JSON report here instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ProfileArgs {
    /// Profile JSON file to inspect (default: the built-in profile).
    #[arg(long)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Write a default configuration file here.
    #[arg(long)]
    pub save: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "linkprobe", "run", "heavy", "--duration", "10s", "--loopback",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.scenario, ScenarioArg::Heavy);
                assert_eq!(args.duration, Duration::from_secs(10));
                assert!(args.common.loopback);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn bandwidth_override_makes_custom_scenario() {
        assert_eq!(
            ScenarioArg::Light.to_scenario(Some(999.0)),
            Scenario::Custom(999.0)
        );
        assert_eq!(ScenarioArg::Light.to_scenario(None), Scenario::Light);
    }

    #[test]
    fn bad_duration_is_rejected() {
        assert!(Cli::try_parse_from(["linkprobe", "run", "--duration", "xyz"]).is_err());
    }
}
