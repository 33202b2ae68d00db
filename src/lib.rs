//! # Linkprobe
//!
//! Latency, jitter and loss characterization for point-to-point radio serial
//! links (e.g. a P900 pair in Master/Slave configuration), with and without
//! realistic background telemetry traffic.
//!
//! ## Architecture
//!
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Scenario Runner / CLI                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │   ProbeExchange                       TrafficGenerator       │
//! │  ┌───────────┐ ┌───────────┐         ┌─────────────────┐     │
//! │  │ Injector  │ │ Collector │         │  token bucket   │     │
//! │  └─────┬─────┘ └─────┬─────┘         └────────┬────────┘     │
//! ├────────┼─────────────┼────────────────────────┼──────────────┤
//! │        └───── shared write arbiter ───────────┘              │
//! │                 (Master serial channel)                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Probe / Traffic codecs  ·  SizeProfile  ·  StatsAggregator │
//! ├──────────────────────────────────────────────────────────────┤
//! │      SerialChannel (real serial port or loopback pair)       │
//! └──────────────────────────────────────────────────────────────┘
//!
//! The Master end injects timestamped probe requests at a fixed cadence while
//! the traffic generator competes for the same physical channel; the Slave
//! end echoes probes back. Matching responses to outstanding requests yields
//! RTT, jitter and loss; the four-timestamp detailed mode additionally splits
//! forward and return delay.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)] // Intentional wire-field narrowing
#![allow(clippy::cast_precision_loss)] // Acceptable for stats
#![allow(clippy::cast_sign_loss)] // Durations are non-negative
#![allow(clippy::doc_markdown)] // ASCII diagrams in docs
#![allow(clippy::similar_names)] // t1..t4 are the protocol's names

pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod probe;
pub mod profile;
pub mod protocol;
pub mod ratelimit;
pub mod session;
pub mod stats;
pub mod traffic;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default serial baud rate for the radio pair.
pub const DEFAULT_BAUD_RATE: u32 = 57_600;

/// Largest frame either codec will produce or accept.
pub const MAX_FRAME_SIZE: usize = 512;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::{LoopbackPair, SerialChannel, WriteArbiter};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::probe::{DetailedTester, ProbeExchange};
    pub use crate::profile::{SizeMode, SizeProfile};
    pub use crate::ratelimit::TokenBucket;
    pub use crate::session::{Scenario, Session};
    pub use crate::stats::DelayStats;
    pub use crate::traffic::TrafficGenerator;
    pub use crate::types::*;
}
