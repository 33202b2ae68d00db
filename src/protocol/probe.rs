//! Probe packet codec and stream scanner.
//!
//! Layout (24-byte header, little-endian, filler to the declared size):
//!
//! ```text
//! marker(2) | probe_id(4) | type(1) | timestamp_us(8) |
//! declared_size(2) | reserved(6) | checksum(1) | filler(declared_size − 24)
//! ```
//!
//! The checksum is the XOR of the 23 header bytes before it. The filler is a
//! deterministic pattern seeded by the probe id so a corrupted tail is
//! distinguishable from a mis-framed one in captures.

use byteorder::{ByteOrder, LittleEndian};

use super::{xor_checksum, RESYNC_LIMIT};
use crate::error::ProtocolError;
use crate::types::ProbeId;
use crate::MAX_FRAME_SIZE;

/// Marker locating a probe frame in the byte stream.
pub const PROBE_MARKER: [u8; 2] = [0xbb, 0x44];

/// Fixed probe header size in bytes.
pub const PROBE_HEADER_SIZE: usize = 24;

const OFFSET_ID: usize = 2;
const OFFSET_TYPE: usize = 6;
const OFFSET_TIMESTAMP: usize = 7;
const OFFSET_SIZE: usize = 15;
const OFFSET_CHECKSUM: usize = 23;

/// Probe packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProbeType {
    /// Master → Slave, carries the Master send timestamp.
    Request = 0x10,
    /// Slave → Master, echoes the original timestamp.
    Response = 0x11,
}

impl ProbeType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x10 => Some(Self::Request),
            0x11 => Some(Self::Response),
            _ => None,
        }
    }
}

/// A decoded probe frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeFrame {
    pub probe_id: ProbeId,
    pub probe_type: ProbeType,
    /// Microseconds since the sender's epoch.
    pub timestamp_us: u64,
    /// Total frame size declared by the sender.
    pub declared_size: u16,
}

impl ProbeFrame {
    pub fn new(probe_id: ProbeId, probe_type: ProbeType, timestamp_us: u64, size: usize) -> Self {
        let declared_size = size.clamp(PROBE_HEADER_SIZE, MAX_FRAME_SIZE) as u16;
        Self {
            probe_id,
            probe_type,
            timestamp_us,
            declared_size,
        }
    }

    /// Encode to exactly `declared_size` bytes.
    ///
    /// A requested size below the header size was already clamped up in
    /// [`ProbeFrame::new`], so the result is never shorter than the header.
    pub fn encode(&self) -> Vec<u8> {
        let total = self.declared_size as usize;
        let mut buf = vec![0u8; total];

        buf[..2].copy_from_slice(&PROBE_MARKER);
        LittleEndian::write_u32(&mut buf[OFFSET_ID..OFFSET_ID + 4], self.probe_id.0);
        buf[OFFSET_TYPE] = self.probe_type as u8;
        LittleEndian::write_u64(
            &mut buf[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8],
            self.timestamp_us,
        );
        LittleEndian::write_u16(&mut buf[OFFSET_SIZE..OFFSET_SIZE + 2], self.declared_size);
        // reserved bytes 17..23 stay zero
        buf[OFFSET_CHECKSUM] = xor_checksum(&buf[..OFFSET_CHECKSUM]);

        for (i, b) in buf[PROBE_HEADER_SIZE..].iter_mut().enumerate() {
            *b = ((i as u32) ^ self.probe_id.0) as u8;
        }

        buf
    }

    /// Parse a frame header from the start of `data`, reporting the exact
    /// reason a candidate is rejected. Filler bytes are not validated.
    pub fn parse(data: &[u8]) -> std::result::Result<Self, ProtocolError> {
        if data.len() < PROBE_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                got: data.len(),
                need: PROBE_HEADER_SIZE,
            });
        }
        if data[..2] != PROBE_MARKER {
            return Err(ProtocolError::BadMarker);
        }
        if xor_checksum(&data[..OFFSET_CHECKSUM]) != data[OFFSET_CHECKSUM] {
            return Err(ProtocolError::ChecksumMismatch);
        }

        let probe_type = ProbeType::from_u8(data[OFFSET_TYPE])
            .ok_or(ProtocolError::InvalidType(data[OFFSET_TYPE]))?;
        let declared_size = LittleEndian::read_u16(&data[OFFSET_SIZE..OFFSET_SIZE + 2]);
        if (declared_size as usize) < PROBE_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                got: declared_size as usize,
                need: PROBE_HEADER_SIZE,
            });
        }
        if declared_size as usize > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: declared_size as usize,
                max: MAX_FRAME_SIZE,
            });
        }

        Ok(Self {
            probe_id: ProbeId(LittleEndian::read_u32(&data[OFFSET_ID..OFFSET_ID + 4])),
            probe_type,
            timestamp_us: LittleEndian::read_u64(&data[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8]),
            declared_size,
        })
    }

    /// Scan-loop decode: every rejection is a silent discard and the caller
    /// keeps scanning.
    pub fn decode(data: &[u8]) -> Option<Self> {
        Self::parse(data).ok()
    }

    /// Build the echo for a request: same id, same size, original timestamp.
    pub fn to_response(self) -> Self {
        Self {
            probe_type: ProbeType::Response,
            ..self
        }
    }
}

/// Rolling scanner that extracts complete probe frames from a byte stream.
///
/// Serial reads arrive arbitrarily split and coalesced; the scanner buffers
/// input, aligns on the marker, and yields frames whose declared size has
/// fully arrived. Bytes before a marker and frames failing the checksum are
/// discarded. If the buffer exceeds [`RESYNC_LIMIT`] without producing a
/// frame it is cleared entirely.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: Vec<u8>,
    /// Frames dropped for checksum or type errors.
    discarded: u64,
    /// Full-buffer resyncs.
    resyncs: u64,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<ProbeFrame> {
        loop {
            // Align on the marker, dropping leading garbage.
            match find_marker(&self.buf, &PROBE_MARKER) {
                Some(pos) => {
                    if pos > 0 {
                        self.buf.drain(..pos);
                    }
                }
                None => {
                    // Keep a trailing byte in case it is half a marker.
                    if self.buf.len() > 1 {
                        let keep = self.buf.len() - 1;
                        self.buf.drain(..keep);
                    }
                    self.check_resync();
                    return None;
                }
            }

            if self.buf.len() < PROBE_HEADER_SIZE {
                return None;
            }

            let declared = LittleEndian::read_u16(&self.buf[OFFSET_SIZE..OFFSET_SIZE + 2]) as usize;
            match ProbeFrame::decode(&self.buf) {
                Some(frame) => {
                    if self.buf.len() < declared {
                        // Header is valid; wait for the rest of the frame.
                        return None;
                    }
                    self.buf.drain(..declared);
                    return Some(frame);
                }
                None => {
                    // Corrupted candidate: skip the marker byte and rescan.
                    self.buf.drain(..1);
                    self.discarded += 1;
                    self.check_resync();
                }
            }
        }
    }

    fn check_resync(&mut self) {
        if self.buf.len() > RESYNC_LIMIT {
            self.buf.clear();
            self.resyncs += 1;
        }
    }

    /// Frames dropped for checksum/type errors since construction.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Number of full-buffer resyncs since construction.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Bytes currently buffered.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack
        .windows(2)
        .position(|w| w == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, size: usize) -> ProbeFrame {
        ProbeFrame::new(ProbeId(id), ProbeType::Request, 1_234_567, size)
    }

    #[test]
    fn round_trip_preserves_fields() {
        for size in [24usize, 40, 108, 280] {
            let f = ProbeFrame::new(ProbeId(42), ProbeType::Response, 987_654_321, size);
            let bytes = f.encode();
            assert_eq!(bytes.len(), size);

            let decoded = ProbeFrame::decode(&bytes).expect("decode");
            assert_eq!(decoded.probe_id, ProbeId(42));
            assert_eq!(decoded.probe_type, ProbeType::Response);
            assert_eq!(decoded.timestamp_us, 987_654_321);
            assert_eq!(decoded.declared_size as usize, size);
        }
    }

    #[test]
    fn undersized_request_clamps_to_header() {
        let f = frame(1, 5);
        assert_eq!(f.encode().len(), PROBE_HEADER_SIZE);
    }

    #[test]
    fn decode_rejects_short_input_and_bad_marker() {
        let bytes = frame(7, 40).encode();
        assert!(ProbeFrame::decode(&bytes[..10]).is_none());

        let mut bad = bytes.clone();
        bad[0] = 0x00;
        assert!(ProbeFrame::decode(&bad).is_none());
    }

    #[test]
    fn parse_names_the_rejection_reason() {
        let bytes = frame(7, 40).encode();

        assert!(matches!(
            ProbeFrame::parse(&bytes[..10]),
            Err(ProtocolError::Truncated { got: 10, need: PROBE_HEADER_SIZE })
        ));

        let mut bad_marker = bytes.clone();
        bad_marker[0] = 0x00;
        assert!(matches!(
            ProbeFrame::parse(&bad_marker),
            Err(ProtocolError::BadMarker)
        ));

        let mut bad_checksum = bytes.clone();
        bad_checksum[OFFSET_CHECKSUM] ^= 0xff;
        assert!(matches!(
            ProbeFrame::parse(&bad_checksum),
            Err(ProtocolError::ChecksumMismatch)
        ));

        // Reseal the header after each field edit so only the field under
        // test is at fault.
        let mut bad_type = bytes.clone();
        bad_type[OFFSET_TYPE] = 0x7f;
        bad_type[OFFSET_CHECKSUM] = xor_checksum(&bad_type[..OFFSET_CHECKSUM]);
        assert!(matches!(
            ProbeFrame::parse(&bad_type),
            Err(ProtocolError::InvalidType(0x7f))
        ));

        let mut oversized = bytes.clone();
        LittleEndian::write_u16(
            &mut oversized[OFFSET_SIZE..OFFSET_SIZE + 2],
            (MAX_FRAME_SIZE + 1) as u16,
        );
        oversized[OFFSET_CHECKSUM] = xor_checksum(&oversized[..OFFSET_CHECKSUM]);
        assert!(matches!(
            ProbeFrame::parse(&oversized),
            Err(ProtocolError::FrameTooLarge { max: MAX_FRAME_SIZE, .. })
        ));

        let mut undersized = bytes;
        LittleEndian::write_u16(&mut undersized[OFFSET_SIZE..OFFSET_SIZE + 2], 4);
        undersized[OFFSET_CHECKSUM] = xor_checksum(&undersized[..OFFSET_CHECKSUM]);
        assert!(matches!(
            ProbeFrame::parse(&undersized),
            Err(ProtocolError::Truncated { got: 4, need: PROBE_HEADER_SIZE })
        ));
    }

    #[test]
    fn any_header_byte_flip_fails_checksum() {
        let bytes = frame(99, 64).encode();
        for i in 2..PROBE_HEADER_SIZE - 1 {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x01;
            assert!(
                ProbeFrame::decode(&corrupted).is_none(),
                "flip at byte {i} accepted"
            );
        }
    }

    #[test]
    fn scanner_handles_split_and_coalesced_reads() {
        let a = frame(1, 40).encode();
        let b = frame(2, 64).encode();

        let mut stream = Vec::new();
        stream.extend_from_slice(b"\x00\x17garbage");
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        let mut scanner = FrameScanner::new();
        // Feed in awkward 7-byte chunks.
        let mut got = Vec::new();
        for chunk in stream.chunks(7) {
            scanner.extend(chunk);
            while let Some(f) = scanner.next_frame() {
                got.push(f.probe_id.0);
            }
        }
        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    fn scanner_skips_corrupted_frame_and_recovers() {
        let mut bad = frame(5, 40).encode();
        bad[OFFSET_CHECKSUM] ^= 0xff;
        let good = frame(6, 40).encode();

        let mut scanner = FrameScanner::new();
        scanner.extend(&bad);
        scanner.extend(&good);

        let f = scanner.next_frame().expect("good frame after corrupt one");
        assert_eq!(f.probe_id.0, 6);
        assert!(scanner.discarded() >= 1);
    }

    #[test]
    fn scanner_resyncs_on_markerless_flood() {
        let mut scanner = FrameScanner::new();
        scanner.extend(&vec![0x00u8; RESYNC_LIMIT + 100]);
        assert!(scanner.next_frame().is_none());
        assert!(scanner.pending_bytes() <= RESYNC_LIMIT);
    }
}
