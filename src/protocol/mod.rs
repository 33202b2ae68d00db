//! Wire formats for the probe, traffic and detailed-echo packets.
//!
//! All formats are little-endian and self-delimiting within a byte stream:
//! a fixed two-byte marker locates a candidate frame and a checksum rejects
//! corrupted or mis-aligned candidates. Scan loops treat every rejection as
//! a silent discard, never an error.

mod detailed;
mod probe;
mod traffic;

pub use detailed::{DetailedCodec, DetailedFrame, DETAILED_FRAME_SIZE, REQUEST_MARKER, RESPONSE_MARKER};
pub use probe::{FrameScanner, ProbeFrame, ProbeType, PROBE_HEADER_SIZE, PROBE_MARKER};
pub use traffic::{TrafficFrameBuilder, TRAFFIC_MAX_SIZE, TRAFFIC_MIN_SIZE, TRAFFIC_START_BYTE};

/// Scan buffers are cleared past this bound if no marker is found (resync).
pub const RESYNC_LIMIT: usize = 4096;

/// XOR checksum over a byte slice (probe and detailed headers).
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// 16-bit ones-complement-folded additive checksum (traffic frames).
pub fn fold_checksum(data: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for &b in data {
        sum = sum.wrapping_add(u16::from(b));
        sum = (sum & 0xff).wrapping_add(sum >> 8);
    }
    sum
}
