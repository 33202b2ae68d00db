//! TOML configuration and logging setup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};
use crate::profile::SizeMode;
use crate::DEFAULT_BAUD_RATE;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub probe: ProbeConfig,
    pub traffic: TrafficConfig,
    pub logging: LoggingConfig,
}

/// Serial link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Master-side port (the probing end).
    pub master_port: String,
    /// Slave-side port (the echoing end). Both ports are usually two USB
    /// adapters on the same host, one per radio.
    pub slave_port: String,
    pub baud_rate: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            master_port: default_master_port(),
            slave_port: default_slave_port(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Probe injection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Time between probe requests.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long a probe may stay pending before it counts as lost.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Declared probe packet size in bytes.
    pub packet_size: u16,
    /// When set, probe sizes are drawn from the traffic size profile in
    /// this mode instead of using the fixed `packet_size`.
    pub size_mode: Option<SizeMode>,
    /// Resolved probes kept in the history ring.
    pub history_capacity: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
            packet_size: default_packet_size(),
            size_mode: None,
            history_capacity: default_history_capacity(),
        }
    }
}

/// Background traffic settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Target load in bytes per second; zero disables the generator.
    pub bandwidth_bytes_per_sec: f64,
    pub size_mode: SizeMode,
    /// Optional JSON size-profile file; the built-in default is used when
    /// absent or unreadable.
    pub profile_path: Option<PathBuf>,
    pub source_id: u8,
    pub dest_id: u8,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            bandwidth_bytes_per_sec: default_bandwidth(),
            size_mode: SizeMode::Realistic,
            profile_path: None,
            source_id: default_source_id(),
            dest_id: default_dest_id(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `linkprobe=debug`.
    pub level: String,
    pub format: LogFormat,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            ansi: true,
        }
    }
}

fn default_master_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_slave_port() -> String {
    "/dev/ttyUSB1".to_string()
}

fn default_probe_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_packet_size() -> u16 {
    64
}

fn default_history_capacity() -> usize {
    10_000
}

fn default_bandwidth() -> f64 {
    5_760.0
}

fn default_source_id() -> u8 {
    1
}

fn default_dest_id() -> u8 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| Error::Config(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the current configuration out as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text =
            toml::to_string_pretty(self).map_err(|e| Error::Config(format!("serialize: {e}")))?;
        fs::write(path, text)
            .map_err(|e| Error::Config(format!("cannot write {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe.interval.is_zero() {
            return Err(Error::InvalidConfig("probe interval must be > 0".to_string()));
        }
        if self.probe.timeout < self.probe.interval {
            return Err(Error::InvalidConfig(
                "probe timeout must be at least the interval".to_string(),
            ));
        }
        if self.probe.history_capacity == 0 {
            return Err(Error::InvalidConfig(
                "history capacity must be > 0".to_string(),
            ));
        }
        if self.traffic.bandwidth_bytes_per_sec < 0.0 {
            return Err(Error::InvalidConfig(
                "traffic bandwidth cannot be negative".to_string(),
            ));
        }
        if self.link.baud_rate == 0 {
            return Err(Error::InvalidConfig("baud rate must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Install the global tracing subscriber per the logging section.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Config(format!("bad log filter {:?}: {e}", config.level)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(false);

    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.map_err(|e| Error::Config(format!("logger init: {e}")))
}
