//! Four-timestamp latency decomposition.
//!
//! One request in flight at a time, no background traffic: the point of
//! this mode is to split the round trip into forward delay, turnaround and
//! return delay rather than to stress the link. See
//! [`crate::types::DetailedMeasurement`] for the clock-offset caveat on the
//! one-way figures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::channel::{SerialChannel, WriteArbiter, ARBITER_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::{DetailedCodec, RESPONSE_MARKER};
use crate::stats::DelayStats;
use crate::types::{DetailedMeasurement, MeasurementStatus, ProbeId};

/// Pause between consecutive measurements.
const DEFAULT_GAP: Duration = Duration::from_millis(100);

/// Sequential four-timestamp tester. `Stopped → Running → Stopped`.
pub struct DetailedTester {
    write: WriteArbiter,
    reader: Option<Box<dyn SerialChannel>>,
    slave: Option<Box<dyn SerialChannel>>,
    codec: DetailedCodec,
    timeout: Duration,
    gap: Duration,
    epoch: Instant,
}

impl DetailedTester {
    pub fn new(
        write: WriteArbiter,
        reader: Box<dyn SerialChannel>,
        timeout: Duration,
    ) -> Self {
        Self {
            write,
            reader: Some(reader),
            slave: None,
            codec: DetailedCodec::default(),
            timeout,
            gap: DEFAULT_GAP,
            epoch: Instant::now(),
        }
    }

    /// Drive the Slave port from this process as well.
    pub fn with_responder(mut self, slave: Box<dyn SerialChannel>) -> Self {
        self.slave = Some(slave);
        self
    }

    pub fn with_gap(mut self, gap: Duration) -> Self {
        self.gap = gap;
        self
    }

    /// Run `count` sequential measurements and return them all; timeouts
    /// and mismatches appear as records, not errors.
    pub fn run(&mut self, count: usize) -> Result<Vec<DetailedMeasurement>> {
        // The read handle is consumed by the run; a second run has no
        // channel left to listen on.
        let mut reader = self.reader.take().ok_or(Error::ChannelClosed)?;

        let stop = Arc::new(AtomicBool::new(false));
        let responder = match self.slave.take() {
            Some(slave) => Some(spawn_detailed_responder(
                slave,
                self.codec,
                Arc::clone(&stop),
            )?),
            None => None,
        };

        info!(count, timeout = ?self.timeout, "detailed test starting");

        let mut measurements = Vec::with_capacity(count);
        for i in 0..count {
            let packet_id = ProbeId(i as u32);
            measurements.push(self.measure_one(&mut reader, packet_id));
            if i + 1 < count {
                thread::sleep(self.gap);
            }
        }

        stop.store(true, Ordering::SeqCst);
        if let Some(handle) = responder {
            if handle.join().is_err() {
                return Err(Error::Internal("detailed responder panicked".to_string()));
            }
        }

        let ok = measurements
            .iter()
            .filter(|m| m.status == MeasurementStatus::Ok)
            .count();
        info!(ok, total = measurements.len(), "detailed test finished");
        Ok(measurements)
    }

    fn measure_one(
        &self,
        reader: &mut Box<dyn SerialChannel>,
        packet_id: ProbeId,
    ) -> DetailedMeasurement {
        let size = self.codec.frame_size() as u16;
        let blank = |status| DetailedMeasurement {
            packet_id,
            size,
            t1: 0,
            t2: 0,
            t3: 0,
            t4: 0,
            status,
        };

        let t1 = self.now_us();
        let request = self.codec.encode_request(packet_id, t1);

        let written = match self.write.try_lock_for(ARBITER_TIMEOUT) {
            Some(mut channel) => channel.write_all(&request).and_then(|()| channel.flush()),
            None => {
                warn!(packet_id = %packet_id, "arbiter busy in detailed mode");
                return blank(MeasurementStatus::Timeout);
            }
        };
        if let Err(e) = written {
            warn!(error = %e, "detailed request write failed");
            return blank(MeasurementStatus::Timeout);
        }

        // Wait for the echo, scanning past any noise.
        let deadline = Instant::now() + self.timeout;
        let mut rx_buf = Vec::new();
        let mut read_buf = [0u8; 512];
        while Instant::now() < deadline {
            let n = match reader.read(&mut read_buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "detailed read failed");
                    break;
                }
            };
            if n == 0 {
                continue;
            }
            rx_buf.extend_from_slice(&read_buf[..n]);

            if let Some(frame) = self.codec.scan(&mut rx_buf, &RESPONSE_MARKER) {
                let t4 = self.now_us();
                if frame.packet_id != packet_id {
                    trace!(
                        got = %frame.packet_id,
                        want = %packet_id,
                        "detailed response id mismatch"
                    );
                    return DetailedMeasurement {
                        packet_id,
                        size,
                        t1: u64::from(t1),
                        t2: 0,
                        t3: 0,
                        t4: u64::from(t4),
                        status: MeasurementStatus::Mismatch,
                    };
                }
                return DetailedMeasurement {
                    packet_id,
                    size,
                    t1: u64::from(frame.t1_us),
                    t2: u64::from(frame.t2_us),
                    t3: u64::from(frame.t3_us),
                    t4: u64::from(t4),
                    status: MeasurementStatus::Ok,
                };
            }
        }

        trace!(packet_id = %packet_id, "detailed response timed out");
        let mut m = blank(MeasurementStatus::Timeout);
        m.t1 = u64::from(t1);
        m
    }

    fn now_us(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }
}

fn spawn_detailed_responder(
    mut slave: Box<dyn SerialChannel>,
    codec: DetailedCodec,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("detailed-respond".to_string())
        .spawn(move || {
            // The Slave side keeps its own clock; t2/t3 are on this epoch.
            let epoch = Instant::now();
            let mut rx_buf = Vec::new();
            let mut read_buf = [0u8; 512];

            while !stop.load(Ordering::Relaxed) {
                let n = match slave.read(&mut read_buf) {
                    Ok(0) => continue,
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "detailed responder read failed");
                        break;
                    }
                };
                rx_buf.extend_from_slice(&read_buf[..n]);

                while let Some(frame) =
                    codec.scan(&mut rx_buf, &crate::protocol::REQUEST_MARKER)
                {
                    // Receive time is when the frame completed, not when
                    // its first chunk arrived.
                    let t2 = epoch.elapsed().as_micros() as u32;
                    let t3 = epoch.elapsed().as_micros() as u32;
                    let response =
                        codec.encode_response(frame.packet_id, frame.t1_us, t2, t3);
                    if let Err(e) = slave.write_all(&response).and_then(|()| slave.flush()) {
                        warn!(error = %e, "detailed echo write failed");
                    }
                }
            }
            debug!("detailed responder stopped");
        })
        .map_err(|e| Error::Internal(format!("spawn detailed responder: {e}")))
}

/// Per-quantity summary of a detailed run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetailedReport {
    pub ok: u64,
    pub timeouts: u64,
    pub mismatches: u64,
    pub forward: DelayStats,
    #[serde(rename = "return")]
    pub return_: DelayStats,
    pub rtt: DelayStats,
    pub processing: DelayStats,
    /// Mean of forward − return in milliseconds; positive means the
    /// forward leg is slower.
    pub mean_asymmetry_ms: f64,
}

impl DetailedReport {
    pub fn from_measurements(measurements: &[DetailedMeasurement]) -> Self {
        let ok: Vec<&DetailedMeasurement> = measurements
            .iter()
            .filter(|m| m.status == MeasurementStatus::Ok)
            .collect();

        let forward: Vec<Duration> = ok.iter().map(|m| m.forward_delay()).collect();
        let return_: Vec<Duration> = ok.iter().map(|m| m.return_delay()).collect();
        let rtt: Vec<Duration> = ok.iter().map(|m| m.rtt()).collect();
        let processing: Vec<Duration> = ok.iter().map(|m| m.processing_time()).collect();
        let mean_asymmetry_ms = if ok.is_empty() {
            0.0
        } else {
            ok.iter().map(|m| m.asymmetry()).sum::<f64>() / ok.len() as f64 * 1000.0
        };

        Self {
            ok: ok.len() as u64,
            timeouts: measurements
                .iter()
                .filter(|m| m.status == MeasurementStatus::Timeout)
                .count() as u64,
            mismatches: measurements
                .iter()
                .filter(|m| m.status == MeasurementStatus::Mismatch)
                .count() as u64,
            forward: DelayStats::from_samples(&forward),
            return_: DelayStats::from_samples(&return_),
            rtt: DelayStats::from_samples(&rtt),
            processing: DelayStats::from_samples(&processing),
            mean_asymmetry_ms,
        }
    }
}
