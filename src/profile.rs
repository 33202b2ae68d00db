//! Packet size distribution model for background traffic.
//!
//! A [`SizeProfile`] describes how big telemetry packets are on a real link:
//! coarse size categories with probabilities, the most common individual
//! messages with their rates and weights, and summary statistics. The
//! built-in default carries a measured autopilot telemetry distribution;
//! a custom profile can be loaded from a JSON document with the same shape.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Probabilities must sum to 1.0 within this tolerance.
const PROBABILITY_TOLERANCE: f64 = 0.01;

/// Fraction of realistic samples drawn from the common-message table.
const COMMON_MESSAGE_FRACTION: f64 = 0.7;

/// How packet sizes are chosen for generated traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SizeMode {
    /// Deterministic cycle through the representative size list.
    Representative,
    /// Uniform over the profile's global size range.
    Random,
    /// Weighted mix of common messages and the category distribution.
    Realistic,
}

/// One coarse size bucket of the distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeCategory {
    pub name: String,
    pub probability: f64,
    pub min_bytes: u16,
    pub max_bytes: u16,
    /// Typical size used for the representative list.
    pub representative: u16,
}

/// A frequently seen message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonMessage {
    pub label: String,
    pub size: u16,
    pub frequency_hz: f64,
    pub weight: f64,
}

/// Summary statistics of the captured traffic the profile was built from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProfileStatistics {
    pub min_size: u16,
    pub max_size: u16,
    pub mean_size: f64,
    pub median_size: f64,
    pub std_dev: f64,
    pub total_packets: u64,
    pub unique_message_types: u32,
}

/// JSON document shape for custom profiles.
#[derive(Debug, Deserialize)]
struct ProfileDocument {
    #[serde(default)]
    size_distribution: Vec<SizeCategory>,
    #[serde(default)]
    common_messages: Vec<CommonMessage>,
    statistics: Option<ProfileStatistics>,
}

/// Packet size distribution with thread-safe sampling.
#[derive(Debug)]
pub struct SizeProfile {
    categories: Vec<SizeCategory>,
    messages: Vec<CommonMessage>,
    statistics: ProfileStatistics,
    representative: Vec<u16>,
    /// Cursor for the deterministic representative cycle.
    cursor: AtomicUsize,
}

impl Default for SizeProfile {
    fn default() -> Self {
        Self::default_telemetry()
    }
}

impl SizeProfile {
    /// The built-in profile, from a measured autopilot telemetry capture.
    pub fn default_telemetry() -> Self {
        let categories = vec![
            category("tiny", 0.2934, 0, 25, 13),
            category("small", 0.2088, 25, 40, 30),
            category("medium", 0.4063, 40, 50, 40),
            category("large", 0.0096, 50, 60, 55),
            category("xlarge", 0.0819, 60, 280, 82),
        ];
        let messages = vec![
            message("ATTITUDE", 40, 5.74, 0.2837),
            message("MISSION_CURRENT", 13, 9.54, 0.206),
            message("GLOBAL_POSITION_INT", 40, 1.91, 0.0944),
            message("VFR_HUD", 31, 1.53, 0.0755),
            message("HEARTBEAT", 21, 1.0, 0.0494),
            message("SYS_STATUS", 44, 0.95, 0.0426),
            message("GPS_RAW_INT", 37, 0.88, 0.038),
            message("NAV_CONTROLLER_OUTPUT", 33, 0.67, 0.0243),
            message("RC_CHANNELS", 52, 0.52, 0.0189),
            message("SERVO_OUTPUT_RAW", 53, 0.45, 0.0163),
        ];
        let statistics = ProfileStatistics {
            min_size: 13,
            max_size: 82,
            mean_size: 34.69,
            median_size: 40.0,
            std_dev: 15.77,
            total_packets: 6067,
            unique_message_types: 27,
        };

        Self {
            categories,
            messages,
            statistics,
            representative: vec![13, 21, 30, 31, 33, 37, 40, 44, 52, 82],
            cursor: AtomicUsize::new(0),
        }
    }

    /// Load a profile from a JSON file, falling back to the default on any
    /// failure. A bad profile file degrades the run, it does not abort it.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(profile) => {
                debug!(path = %path.display(), "size profile loaded");
                profile
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "profile load failed, using default");
                Self::default_telemetry()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let profile = Self::from_json(&text)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let doc: ProfileDocument =
            serde_json::from_str(text).map_err(|e| Error::Profile(e.to_string()))?;
        if doc.size_distribution.is_empty() {
            return Err(Error::Profile("no size categories".to_string()));
        }

        let statistics = doc.statistics.unwrap_or_else(|| derive_statistics(&doc));
        let representative = derive_representative(&doc.size_distribution, &doc.common_messages);

        Ok(Self {
            categories: doc.size_distribution,
            messages: doc.common_messages,
            statistics,
            representative,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Check the distribution is internally consistent.
    pub fn validate(&self) -> Result<()> {
        let sum: f64 = self.categories.iter().map(|c| c.probability).sum();
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(Error::Profile(format!(
                "category probabilities sum to {sum:.4}, expected 1.0"
            )));
        }
        for c in &self.categories {
            if c.min_bytes > c.max_bytes {
                return Err(Error::Profile(format!(
                    "category {} has min {} > max {}",
                    c.name, c.min_bytes, c.max_bytes
                )));
            }
        }
        if self.statistics.min_size > self.statistics.max_size {
            return Err(Error::Profile("min_size exceeds max_size".to_string()));
        }
        if self.representative.is_empty() {
            return Err(Error::Profile("empty representative list".to_string()));
        }
        Ok(())
    }

    /// Draw one packet size. Always within `[min_size, max_size]`.
    pub fn sample(&self, mode: SizeMode) -> u16 {
        self.sample_with(mode, &mut rand::thread_rng())
    }

    /// Sampling with a caller-provided RNG, for deterministic tests.
    pub fn sample_with<R: Rng>(&self, mode: SizeMode, rng: &mut R) -> u16 {
        let size = match mode {
            SizeMode::Representative => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.representative.len();
                self.representative[idx]
            }
            SizeMode::Random => {
                rng.gen_range(self.statistics.min_size..=self.statistics.max_size)
            }
            SizeMode::Realistic => {
                if !self.messages.is_empty() && rng.gen::<f64>() < COMMON_MESSAGE_FRACTION {
                    self.sample_common_message(rng)
                } else {
                    self.sample_category(rng)
                }
            }
        };
        size.clamp(self.statistics.min_size, self.statistics.max_size)
    }

    fn sample_common_message<R: Rng>(&self, rng: &mut R) -> u16 {
        let total: f64 = self.messages.iter().map(|m| m.weight).sum();
        if total <= 0.0 {
            return self.statistics.min_size;
        }
        let mut r = rng.gen::<f64>() * total;
        for m in &self.messages {
            r -= m.weight;
            if r < 0.0 {
                return m.size;
            }
        }
        // Floating-point leftover lands on the last entry.
        self.messages[self.messages.len() - 1].size
    }

    fn sample_category<R: Rng>(&self, rng: &mut R) -> u16 {
        let r = rng.gen::<f64>();
        let mut cumulative = 0.0;
        for c in &self.categories {
            cumulative += c.probability;
            if r < cumulative {
                let lo = c.min_bytes.max(self.statistics.min_size);
                let hi = c.max_bytes.min(self.statistics.max_size).max(lo);
                return rng.gen_range(lo..=hi);
            }
        }
        // Probabilities summing slightly under 1.0 can fall through.
        self.representative[rng.gen_range(0..self.representative.len())]
    }

    /// The sorted representative size list (at most ten entries).
    pub fn representative_sizes(&self) -> &[u16] {
        &self.representative
    }

    /// Expected bandwidth of the common messages, bytes per second.
    pub fn estimated_bandwidth(&self) -> f64 {
        self.messages
            .iter()
            .filter(|m| m.frequency_hz > 0.0)
            .map(|m| f64::from(m.size) * m.frequency_hz)
            .sum()
    }

    pub fn statistics(&self) -> &ProfileStatistics {
        &self.statistics
    }

    pub fn categories(&self) -> &[SizeCategory] {
        &self.categories
    }

    pub fn common_messages(&self) -> &[CommonMessage] {
        &self.messages
    }
}

fn category(name: &str, probability: f64, min: u16, max: u16, representative: u16) -> SizeCategory {
    SizeCategory {
        name: name.to_string(),
        probability,
        min_bytes: min,
        max_bytes: max,
        representative,
    }
}

fn message(label: &str, size: u16, frequency_hz: f64, weight: f64) -> CommonMessage {
    CommonMessage {
        label: label.to_string(),
        size,
        frequency_hz,
        weight,
    }
}

fn derive_representative(categories: &[SizeCategory], messages: &[CommonMessage]) -> Vec<u16> {
    let mut sizes: Vec<u16> = messages
        .iter()
        .take(10)
        .map(|m| m.size)
        .chain(categories.iter().map(|c| c.representative))
        .collect();
    sizes.sort_unstable();
    sizes.dedup();
    sizes.truncate(10);
    sizes
}

fn derive_statistics(doc: &ProfileDocument) -> ProfileStatistics {
    let min_size = doc
        .size_distribution
        .iter()
        .map(|c| c.min_bytes)
        .min()
        .unwrap_or(0);
    let max_size = doc
        .size_distribution
        .iter()
        .map(|c| c.max_bytes)
        .max()
        .unwrap_or(0);
    let mean_size = doc
        .size_distribution
        .iter()
        .map(|c| c.probability * f64::from(c.min_bytes + c.max_bytes) / 2.0)
        .sum();
    ProfileStatistics {
        min_size,
        max_size,
        mean_size,
        median_size: mean_size,
        std_dev: 0.0,
        total_packets: 0,
        unique_message_types: doc.common_messages.len() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_profile_validates() {
        SizeProfile::default_telemetry().validate().unwrap();
    }

    #[test]
    fn representative_mode_cycles_deterministically() {
        let profile = SizeProfile::default_telemetry();
        let expected = profile.representative_sizes().to_vec();
        let mut rng = StdRng::seed_from_u64(1);

        let first: Vec<u16> = (0..expected.len())
            .map(|_| profile.sample_with(SizeMode::Representative, &mut rng))
            .collect();
        assert_eq!(first, expected);

        let second: Vec<u16> = (0..expected.len())
            .map(|_| profile.sample_with(SizeMode::Representative, &mut rng))
            .collect();
        assert_eq!(second, expected);
    }

    #[test]
    fn samples_stay_within_global_range() {
        let profile = SizeProfile::default_telemetry();
        let stats = *profile.statistics();
        let mut rng = StdRng::seed_from_u64(7);

        for mode in [SizeMode::Representative, SizeMode::Random, SizeMode::Realistic] {
            for _ in 0..2000 {
                let size = profile.sample_with(mode, &mut rng);
                assert!(
                    size >= stats.min_size && size <= stats.max_size,
                    "{size} outside [{}, {}] in {mode:?}",
                    stats.min_size,
                    stats.max_size
                );
            }
        }
    }

    #[test]
    fn realistic_mode_favors_common_sizes() {
        let profile = SizeProfile::default_telemetry();
        let mut rng = StdRng::seed_from_u64(42);

        let samples: Vec<u16> = (0..5000)
            .map(|_| profile.sample_with(SizeMode::Realistic, &mut rng))
            .collect();

        // ATTITUDE (40 B) and MISSION_CURRENT (13 B) dominate the weights;
        // together they should account for a large share of samples.
        let dominant = samples.iter().filter(|&&s| s == 40 || s == 13).count();
        assert!(
            dominant > samples.len() / 4,
            "only {dominant} of {} samples hit dominant sizes",
            samples.len()
        );
    }

    #[test]
    fn estimated_bandwidth_matches_profile() {
        let profile = SizeProfile::default_telemetry();
        let bw = profile.estimated_bandwidth();
        // Σ size × frequency for the ten default messages.
        assert!((bw - 645.81).abs() < 0.5, "unexpected bandwidth {bw}");
    }

    #[test]
    fn bad_probability_sum_fails_validation() {
        let mut profile = SizeProfile::default_telemetry();
        profile.categories[0].probability += 0.5;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn json_round_trip_and_fallback() {
        let json = r#"{
            "size_distribution": [
                {"name": "small", "probability": 0.6, "min_bytes": 10, "max_bytes": 40, "representative": 20},
                {"name": "large", "probability": 0.4, "min_bytes": 40, "max_bytes": 100, "representative": 60}
            ],
            "common_messages": [
                {"label": "STATUS", "size": 24, "frequency_hz": 2.0, "weight": 1.0}
            ],
            "statistics": {
                "min_size": 10, "max_size": 100, "mean_size": 40.0,
                "median_size": 35.0, "std_dev": 12.0,
                "total_packets": 100, "unique_message_types": 3
            }
        }"#;

        let profile = SizeProfile::from_json(json).unwrap();
        profile.validate().unwrap();
        assert_eq!(profile.representative_sizes(), &[20, 24, 60]);

        assert!(SizeProfile::from_json("{not json").is_err());

        // Missing file falls back without error.
        let fallback = SizeProfile::load_or_default(Path::new("/nonexistent/profile.json"));
        assert_eq!(fallback.statistics().max_size, 82);
    }
}
