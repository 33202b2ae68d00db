//! Core types used throughout linkprobe.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier for a probe request/response pair.
///
/// Monotonically increasing, wraps at the u32 boundary. The wrap distance is
/// far larger than the in-flight window (at most `timeout / interval`
/// probes), so a resolved id is never reused while it could still match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProbeId(pub u32);

impl ProbeId {
    pub const ZERO: Self = Self(0);

    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a single probe.
///
/// `Pending → Received` or `Pending → TimedOut`; no other transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Request sent, response outstanding.
    Pending,
    /// Response matched within the timeout window.
    Received,
    /// No response within the timeout window (counted as loss).
    TimedOut,
}

impl ProbeStatus {
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Received => write!(f, "received"),
            Self::TimedOut => write!(f, "timed-out"),
        }
    }
}

/// A single resolved (or pending) probe measurement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProbeRecord {
    /// Probe identifier.
    pub probe_id: ProbeId,
    /// Declared packet size in bytes.
    pub size: u16,
    /// Microseconds since the engine epoch when the request was written.
    pub sent_at_us: u64,
    /// Microseconds since the engine epoch when the response arrived
    /// (zero for timed-out probes).
    pub received_at_us: u64,
    /// Final status.
    pub status: ProbeStatus,
    /// Round-trip time (zero for timed-out probes).
    #[serde(with = "humantime_serde")]
    pub rtt: Duration,
    /// Absolute difference against the previous resolved RTT.
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
}

/// Outcome of a single detailed (four-timestamp) measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementStatus {
    /// Response matched and decomposed.
    Ok,
    /// No response within the per-packet deadline.
    Timeout,
    /// A response arrived but carried an unexpected packet id.
    Mismatch,
}

impl fmt::Display for MeasurementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Timeout => write!(f, "timeout"),
            Self::Mismatch => write!(f, "mismatch"),
        }
    }
}

/// Full round-trip decomposition from the four-timestamp exchange.
///
/// `t1`/`t4` are Master-clock microseconds; `t2`/`t3` are Slave-clock
/// microseconds. The one-way quantities assume the clock offset cancels over
/// the round trip, which holds only to the extent the two clocks do not
/// drift within one RTT — treat `forward_delay` and `return_delay` as
/// relative indicators, not synchronized measurements.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DetailedMeasurement {
    pub packet_id: ProbeId,
    /// Total frame size in bytes.
    pub size: u16,
    /// Master send time (µs).
    pub t1: u64,
    /// Slave receive time (µs).
    pub t2: u64,
    /// Slave send time (µs).
    pub t3: u64,
    /// Master receive time (µs).
    pub t4: u64,
    pub status: MeasurementStatus,
}

impl DetailedMeasurement {
    /// Estimated Master→Slave delay, `t2 − t1`.
    pub fn forward_delay(&self) -> Duration {
        Duration::from_micros(self.t2.saturating_sub(self.t1))
    }

    /// Estimated Slave→Master delay, `t4 − t3`.
    pub fn return_delay(&self) -> Duration {
        Duration::from_micros(self.t4.saturating_sub(self.t3))
    }

    /// Round-trip time, `t4 − t1`.
    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.t4.saturating_sub(self.t1))
    }

    /// Slave turnaround time, `t3 − t2`.
    pub fn processing_time(&self) -> Duration {
        Duration::from_micros(self.t3.saturating_sub(self.t2))
    }

    /// Forward minus return delay; positive means the forward leg is slower.
    pub fn asymmetry(&self) -> f64 {
        self.forward_delay().as_secs_f64() - self.return_delay().as_secs_f64()
    }
}

/// Bandwidth measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Bandwidth {
    /// Bytes per second
    pub bytes_per_sec: f64,
}

impl Bandwidth {
    pub const ZERO: Self = Self { bytes_per_sec: 0.0 };

    pub fn from_bps(bytes_per_sec: f64) -> Self {
        Self { bytes_per_sec }
    }

    pub fn as_kbps(self) -> f64 {
        self.bytes_per_sec * 8.0 / 1000.0
    }

    pub fn as_human_readable(self) -> String {
        let bps = self.bytes_per_sec * 8.0;
        if bps >= 1_000_000.0 {
            format!("{:.2} Mbps", bps / 1_000_000.0)
        } else if bps >= 1_000.0 {
            format!("{:.2} Kbps", bps / 1_000.0)
        } else {
            format!("{bps:.0} bps")
        }
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_human_readable())
    }
}

/// Read-only snapshot of the traffic generator's counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Seconds since the generator started.
    pub elapsed_secs: f64,
    /// Configured target rate.
    pub target_bandwidth: Bandwidth,
    /// `bytes_sent / elapsed`.
    pub achieved_bandwidth: Bandwidth,
    /// Write failures on the serial channel.
    pub errors: u64,
    /// Packets deferred because the token bucket was empty.
    pub rate_limited: u64,
    /// Packets dropped because the write arbiter could not be acquired.
    pub write_conflicts: u64,
}

impl TrafficSnapshot {
    /// Achieved rate as a fraction of the target (0 when no target is set).
    pub fn accuracy(&self) -> f64 {
        if self.target_bandwidth.bytes_per_sec > 0.0 {
            self.achieved_bandwidth.bytes_per_sec / self.target_bandwidth.bytes_per_sec
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_formats_by_magnitude() {
        assert_eq!(Bandwidth::from_bps(50.0).as_human_readable(), "400 bps");
        assert_eq!(Bandwidth::from_bps(5_760.0).as_human_readable(), "46.08 Kbps");
        assert_eq!(Bandwidth::from_bps(250_000.0).as_human_readable(), "2.00 Mbps");
        assert_eq!(Bandwidth::ZERO.to_string(), "0 bps");
        assert!((Bandwidth::from_bps(1_000.0).as_kbps() - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_accuracy_is_achieved_over_target() {
        let snapshot = TrafficSnapshot {
            target_bandwidth: Bandwidth::from_bps(10_000.0),
            achieved_bandwidth: Bandwidth::from_bps(9_500.0),
            ..TrafficSnapshot::default()
        };
        assert!((snapshot.accuracy() - 0.95).abs() < 1e-12);

        let idle = TrafficSnapshot::default();
        assert_eq!(idle.accuracy(), 0.0);
    }

    #[test]
    fn probe_id_wraps_at_u32_boundary() {
        assert_eq!(ProbeId(u32::MAX).next(), ProbeId::ZERO);
        assert_eq!(ProbeId::ZERO.next(), ProbeId(1));
    }
}
