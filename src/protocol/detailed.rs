//! Four-timestamp echo frames for the high-detail measurement mode.
//!
//! Unlike the regular probe packet, which carries a single timestamp, this
//! frame has slots for three: the Master stamps `t1` into the request; the
//! Slave stamps its receive time `t2` and send time `t3` into the response
//! while passing `t1` through. The Master's receive time `t4` completes the
//! decomposition without any clock exchange beyond the payload itself.
//!
//! ```text
//! marker(2) | packet_id(4) | type(1) | t1(4) | t2(4) | t3(4) | reserved(1) |
//! payload(size − 20)
//! ```
//!
//! Timestamps are u32 microseconds (little-endian), which wraps after ~71
//! minutes; runs are far shorter and only differences are ever used. Request
//! and response use distinct markers so each side scans only for the
//! direction it expects.

use byteorder::{ByteOrder, LittleEndian};

use crate::types::ProbeId;

/// Marker of a Master → Slave request.
pub const REQUEST_MARKER: [u8; 2] = [0xaa, 0x55];

/// Marker of a Slave → Master response.
pub const RESPONSE_MARKER: [u8; 2] = [0x55, 0xaa];

/// Total size of a detailed-mode frame.
pub const DETAILED_FRAME_SIZE: usize = 108;

const HEADER_SIZE: usize = 20;
const TYPE_REQUEST: u8 = 0x01;
const TYPE_RESPONSE: u8 = 0x02;

/// A decoded detailed-mode frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetailedFrame {
    pub packet_id: ProbeId,
    pub is_response: bool,
    /// Master send time, µs (set on request, echoed on response).
    pub t1_us: u32,
    /// Slave receive time, µs (response only).
    pub t2_us: u32,
    /// Slave send time, µs (response only).
    pub t3_us: u32,
}

/// Encoder/decoder for detailed-mode frames of a fixed total size.
#[derive(Debug, Clone, Copy)]
pub struct DetailedCodec {
    frame_size: usize,
}

impl Default for DetailedCodec {
    fn default() -> Self {
        Self::new(DETAILED_FRAME_SIZE)
    }
}

impl DetailedCodec {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(HEADER_SIZE),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Encode a request carrying only `t1`.
    pub fn encode_request(&self, packet_id: ProbeId, t1_us: u32) -> Vec<u8> {
        self.encode(packet_id, false, t1_us, 0, 0)
    }

    /// Encode a response echoing `t1` with the Slave's `t2`/`t3` stamped in.
    pub fn encode_response(&self, packet_id: ProbeId, t1_us: u32, t2_us: u32, t3_us: u32) -> Vec<u8> {
        self.encode(packet_id, true, t1_us, t2_us, t3_us)
    }

    fn encode(&self, packet_id: ProbeId, response: bool, t1: u32, t2: u32, t3: u32) -> Vec<u8> {
        let mut buf = vec![0u8; self.frame_size];

        let marker = if response { RESPONSE_MARKER } else { REQUEST_MARKER };
        buf[..2].copy_from_slice(&marker);
        LittleEndian::write_u32(&mut buf[2..6], packet_id.0);
        buf[6] = if response { TYPE_RESPONSE } else { TYPE_REQUEST };
        LittleEndian::write_u32(&mut buf[7..11], t1);
        LittleEndian::write_u32(&mut buf[11..15], t2);
        LittleEndian::write_u32(&mut buf[15..19], t3);
        // reserved byte 19 stays zero

        for (i, b) in buf[HEADER_SIZE..].iter_mut().enumerate() {
            *b = (i as u32).wrapping_add(packet_id.0) as u8;
        }

        buf
    }

    /// Decode a frame from the start of `data`.
    ///
    /// The marker must match the direction implied by the type byte;
    /// anything else is `None` and the scan continues.
    pub fn decode(&self, data: &[u8]) -> Option<DetailedFrame> {
        if data.len() < self.frame_size {
            return None;
        }

        let is_response = if data[..2] == REQUEST_MARKER {
            false
        } else if data[..2] == RESPONSE_MARKER {
            true
        } else {
            return None;
        };

        let expected_type = if is_response { TYPE_RESPONSE } else { TYPE_REQUEST };
        if data[6] != expected_type {
            return None;
        }

        Some(DetailedFrame {
            packet_id: ProbeId(LittleEndian::read_u32(&data[2..6])),
            is_response,
            t1_us: LittleEndian::read_u32(&data[7..11]),
            t2_us: LittleEndian::read_u32(&data[11..15]),
            t3_us: LittleEndian::read_u32(&data[15..19]),
        })
    }

    /// Find the next frame with `marker` in `buf`, draining consumed bytes.
    ///
    /// Returns `None` until a full frame has arrived. Leading garbage and
    /// mismatched candidates are discarded.
    pub fn scan(&self, buf: &mut Vec<u8>, marker: &[u8; 2]) -> Option<DetailedFrame> {
        loop {
            let pos = buf.windows(2).position(|w| w == marker)?;
            if pos > 0 {
                buf.drain(..pos);
            }
            if buf.len() < self.frame_size {
                return None;
            }
            match self.decode(buf) {
                Some(frame) => {
                    buf.drain(..self.frame_size);
                    return Some(frame);
                }
                None => {
                    buf.drain(..1);
                }
            }
        }
    }
}
