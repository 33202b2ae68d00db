//! Scenario runner.
//!
//! A scenario is one measurement run at a fixed background load. The suite
//! runs the baseline plus the three load tiers back to back and correlates
//! achieved bandwidth against the latency figures, which is the question
//! the whole tool exists to answer: how much does telemetry load cost in
//! latency, jitter and loss.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::channel::{
    arbiter, drain_input, open_split, LoopbackPair, SerialChannel, SerialLink, WriteArbiter,
};
use crate::config::Config;
use crate::error::Result;
use crate::probe::{DetailedReport, DetailedTester, ProbeExchange};
use crate::profile::SizeProfile;
use crate::stats::{pearson_correlation, PerSizeStats, ProbeStatistics};
use crate::traffic::TrafficGenerator;
use crate::types::TrafficSnapshot;

/// Background load level for a run.
///
/// The fixed tiers are the rates measured on the reference link: light is
/// a single telemetry stream, heavy is near the radio's usable ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    Baseline,
    Light,
    Medium,
    Heavy,
    Custom(f64),
}

impl Scenario {
    /// Target background bandwidth in bytes per second.
    pub fn bandwidth(&self) -> f64 {
        match self {
            Self::Baseline => 0.0,
            Self::Light => 5_760.0,
            Self::Medium => 28_800.0,
            Self::Heavy => 51_840.0,
            Self::Custom(b) => *b,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Baseline => "baseline".to_string(),
            Self::Light => "light".to_string(),
            Self::Medium => "medium".to_string(),
            Self::Heavy => "heavy".to_string(),
            Self::Custom(b) => format!("custom({b:.0} B/s)"),
        }
    }

    /// The fixed suite, in running order.
    pub fn suite() -> [Self; 4] {
        [Self::Baseline, Self::Light, Self::Medium, Self::Heavy]
    }
}

/// Which physical layer to run against.
#[derive(Debug, Clone, Copy)]
pub enum LinkBackend {
    /// The configured serial ports.
    Serial,
    /// In-memory pair with the given one-way delay (self-test mode).
    Loopback { delay: Duration },
}

/// Result of one scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub target_bandwidth: f64,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub probes: ProbeStatistics,
    pub per_size: PerSizeStats,
    pub traffic: Option<TrafficSnapshot>,
}

/// Correlation of achieved load against the latency figures across a suite.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CorrelationSummary {
    pub bandwidth_vs_rtt: Option<f64>,
    pub bandwidth_vs_jitter: Option<f64>,
    pub bandwidth_vs_loss: Option<f64>,
}

/// Result of a full suite run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub scenarios: Vec<ScenarioReport>,
    pub correlation: CorrelationSummary,
}

/// Wires profile, channels and engines together for complete runs.
pub struct Session {
    config: Config,
    profile: Arc<SizeProfile>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        let profile = match &config.traffic.profile_path {
            Some(path) => SizeProfile::load_or_default(path),
            None => SizeProfile::default_telemetry(),
        };
        Self {
            config,
            profile: Arc::new(profile),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn profile(&self) -> &SizeProfile {
        &self.profile
    }

    /// Run one scenario for `duration` and report, whatever the loss.
    pub fn run_scenario(
        &self,
        backend: LinkBackend,
        scenario: Scenario,
        duration: Duration,
    ) -> Result<ScenarioReport> {
        let (write, reader, slave) = self.open_channels(backend)?;
        let bandwidth = scenario.bandwidth();

        info!(
            scenario = scenario.label(),
            bandwidth = format!("{bandwidth:.0} B/s"),
            duration = ?duration,
            "scenario starting"
        );

        let mut exchange =
            ProbeExchange::new(Arc::clone(&write), reader, &self.config.probe)
                .with_responder(slave);
        if let Some(mode) = self.config.probe.size_mode {
            exchange = exchange.with_size_profile(Arc::clone(&self.profile), mode);
        }

        let mut traffic = if bandwidth > 0.0 {
            let mut generator = TrafficGenerator::new(
                Arc::clone(&write),
                Arc::clone(&self.profile),
                self.config.traffic.size_mode,
                bandwidth,
            )
            .with_ids(self.config.traffic.source_id, self.config.traffic.dest_id);
            generator.start()?;
            Some(generator)
        } else {
            None
        };

        exchange.start()?;
        thread::sleep(duration);

        // Traffic first so the last probes stop competing for the channel.
        let traffic_snapshot = match traffic.as_mut() {
            Some(generator) => {
                generator.stop()?;
                Some(generator.snapshot())
            }
            None => None,
        };
        exchange.stop()?;

        let report = ScenarioReport {
            scenario: scenario.label(),
            target_bandwidth: bandwidth,
            duration,
            probes: exchange.statistics(),
            per_size: exchange.per_size_statistics(),
            traffic: traffic_snapshot,
        };

        if report.probes.received == 0 && report.probes.sent > 0 {
            warn!(scenario = scenario.label(), "no probe responses received");
        }
        Ok(report)
    }

    /// Run baseline plus the three load tiers and correlate.
    pub fn run_suite(&self, backend: LinkBackend, per_scenario: Duration) -> Result<SuiteReport> {
        let mut scenarios = Vec::with_capacity(4);
        for scenario in Scenario::suite() {
            scenarios.push(self.run_scenario(backend, scenario, per_scenario)?);
        }

        let achieved: Vec<f64> = scenarios
            .iter()
            .map(|r| r.traffic.map_or(0.0, |t| t.achieved_bandwidth.bytes_per_sec))
            .collect();
        let rtts: Vec<f64> = scenarios.iter().map(|r| r.probes.rtt.mean_ms()).collect();
        let jitters: Vec<f64> = scenarios
            .iter()
            .map(|r| r.probes.jitter.mean_ms())
            .collect();
        let losses: Vec<f64> = scenarios.iter().map(|r| r.probes.loss_rate).collect();

        let correlation = CorrelationSummary {
            bandwidth_vs_rtt: pearson_correlation(&achieved, &rtts),
            bandwidth_vs_jitter: pearson_correlation(&achieved, &jitters),
            bandwidth_vs_loss: pearson_correlation(&achieved, &losses),
        };

        info!(
            rtt_corr = ?correlation.bandwidth_vs_rtt,
            jitter_corr = ?correlation.bandwidth_vs_jitter,
            loss_corr = ?correlation.bandwidth_vs_loss,
            "suite finished"
        );

        Ok(SuiteReport {
            scenarios,
            correlation,
        })
    }

    /// Run the four-timestamp decomposition with no background traffic.
    pub fn run_detailed(&self, backend: LinkBackend, count: usize) -> Result<DetailedReport> {
        let (write, reader, slave) = self.open_channels(backend)?;
        let mut tester = DetailedTester::new(write, reader, self.config.probe.timeout)
            .with_responder(slave);
        let measurements = tester.run(count)?;
        Ok(DetailedReport::from_measurements(&measurements))
    }

    #[allow(clippy::type_complexity)]
    fn open_channels(
        &self,
        backend: LinkBackend,
    ) -> Result<(WriteArbiter, Box<dyn SerialChannel>, Box<dyn SerialChannel>)> {
        match backend {
            LinkBackend::Serial => {
                let (mut reader, writer) = open_split(
                    &self.config.link.master_port,
                    self.config.link.baud_rate,
                )?;
                let mut slave =
                    SerialLink::open(&self.config.link.slave_port, self.config.link.baud_rate)?;
                // Stale bytes from a previous run would corrupt the first
                // scans on both sides.
                drain_input(reader.as_mut())?;
                drain_input(&mut slave)?;
                Ok((arbiter(writer), reader, Box::new(slave)))
            }
            LinkBackend::Loopback { delay } => {
                let pair = LoopbackPair::symmetric(delay);
                let reader = pair.master.clone();
                Ok((
                    arbiter(Box::new(pair.master)),
                    Box::new(reader),
                    Box::new(pair.slave),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_bandwidth_tiers() {
        assert_eq!(Scenario::Baseline.bandwidth(), 0.0);
        assert_eq!(Scenario::Light.bandwidth(), 5_760.0);
        assert_eq!(Scenario::Medium.bandwidth(), 28_800.0);
        assert_eq!(Scenario::Heavy.bandwidth(), 51_840.0);
        assert_eq!(Scenario::Custom(1234.0).bandwidth(), 1234.0);
    }

    #[test]
    fn baseline_scenario_over_loopback() {
        let mut config = Config::default();
        config.probe.interval = Duration::from_millis(25);
        config.probe.timeout = Duration::from_millis(250);

        let session = Session::new(config);
        let report = session
            .run_scenario(
                LinkBackend::Loopback {
                    delay: Duration::ZERO,
                },
                Scenario::Baseline,
                Duration::from_millis(300),
            )
            .unwrap();

        assert!(report.probes.sent >= 8);
        assert!(report.probes.received > 0);
        assert!(report.traffic.is_none());
    }

    #[test]
    fn loaded_scenario_attaches_traffic_snapshot() {
        let mut config = Config::default();
        config.probe.interval = Duration::from_millis(25);
        config.probe.timeout = Duration::from_millis(250);

        let session = Session::new(config);
        let report = session
            .run_scenario(
                LinkBackend::Loopback {
                    delay: Duration::ZERO,
                },
                Scenario::Custom(20_000.0),
                Duration::from_millis(300),
            )
            .unwrap();

        let traffic = report.traffic.expect("traffic snapshot");
        assert!(traffic.packets_sent > 0);
        assert!((report.target_bandwidth - 20_000.0).abs() < f64::EPSILON);
    }
}
