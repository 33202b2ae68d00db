//! Background traffic frames.
//!
//! These mimic a small telemetry transport frame so the background load has
//! the same on-wire shape as real traffic:
//!
//! ```text
//! start(1) | length(1) | seq(1) | source_id(1) | dest_id(1) | message_id(1) |
//! payload(length − 2) | checksum(2)
//! ```
//!
//! The `length` field counts the payload plus the trailing checksum, so a
//! frame of total size `n` carries `n − 8` payload bytes. The receiver never
//! validates these frames; they exist purely to occupy bandwidth with a
//! realistic size distribution.

use byteorder::{ByteOrder, LittleEndian};

use super::fold_checksum;

/// Start byte of a traffic frame.
pub const TRAFFIC_START_BYTE: u8 = 0xfe;

/// Smallest frame the builder will produce (header + empty payload + checksum).
pub const TRAFFIC_MIN_SIZE: usize = 10;

/// Largest frame the one-byte length field can describe.
pub const TRAFFIC_MAX_SIZE: usize = HEADER_SIZE + 0xff;

const HEADER_SIZE: usize = 6;
const CHECKSUM_SIZE: usize = 2;

/// Stateful builder carrying the wrapping sequence counter.
#[derive(Debug)]
pub struct TrafficFrameBuilder {
    sequence: u8,
    source_id: u8,
    dest_id: u8,
}

impl TrafficFrameBuilder {
    pub fn new(source_id: u8, dest_id: u8) -> Self {
        Self {
            sequence: 0,
            source_id,
            dest_id,
        }
    }

    /// Build one frame of exactly `size` bytes, clamped to
    /// `[TRAFFIC_MIN_SIZE, TRAFFIC_MAX_SIZE]` so the length byte always
    /// agrees with the actual payload.
    pub fn build(&mut self, size: usize, message_id: u8) -> Vec<u8> {
        let size = size.clamp(TRAFFIC_MIN_SIZE, TRAFFIC_MAX_SIZE);
        let payload_len = size - HEADER_SIZE - CHECKSUM_SIZE;

        let mut buf = Vec::with_capacity(size);
        buf.push(TRAFFIC_START_BYTE);
        buf.push((payload_len + CHECKSUM_SIZE) as u8);
        buf.push(self.sequence);
        buf.push(self.source_id);
        buf.push(self.dest_id);
        buf.push(message_id);

        // Mixed-width pattern resembling packed telemetry fields.
        for i in 0..payload_len {
            let b = match i % 4 {
                0 => (i.wrapping_mul(37) ^ usize::from(self.sequence)) as u8,
                2 => (i >> 1) as u8,
                _ => (i % 16) as u8,
            };
            buf.push(b);
        }

        let mut checksum = [0u8; 2];
        LittleEndian::write_u16(&mut checksum, fold_checksum(&buf));
        buf.extend_from_slice(&checksum);

        self.sequence = self.sequence.wrapping_add(1);
        buf
    }

    /// Current sequence counter value.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_have_exact_size() {
        let mut builder = TrafficFrameBuilder::new(1, 2);
        for size in [10usize, 13, 40, 82, 261] {
            let frame = builder.build(size, 30);
            assert_eq!(frame.len(), size);
            assert_eq!(frame[0], TRAFFIC_START_BYTE);
            assert_eq!(frame[1] as usize, size - HEADER_SIZE);
        }
    }

    #[test]
    fn undersized_request_clamps_to_minimum() {
        let mut builder = TrafficFrameBuilder::new(1, 2);
        assert_eq!(builder.build(3, 0).len(), TRAFFIC_MIN_SIZE);
    }

    #[test]
    fn oversized_request_clamps_to_length_field_range() {
        let mut builder = TrafficFrameBuilder::new(1, 2);
        // 280 exceeds what the one-byte length field can carry.
        let frame = builder.build(280, 30);
        assert_eq!(frame.len(), TRAFFIC_MAX_SIZE);
        assert_eq!(frame[1], 0xff);
        assert_eq!(frame[1] as usize, frame.len() - HEADER_SIZE);
    }

    #[test]
    fn sequence_wraps_mod_256() {
        let mut builder = TrafficFrameBuilder::new(1, 2);
        for _ in 0..256 {
            builder.build(16, 0);
        }
        assert_eq!(builder.sequence(), 0);
        let frame = builder.build(16, 0);
        assert_eq!(frame[2], 0);
    }
}
