//! Background traffic generator.
//!
//! Emits telemetry-shaped frames at a target byte rate through the shared
//! write arbiter, competing with the probe injector exactly the way real
//! telemetry competes with measurement traffic. Admission is controlled by
//! a token bucket; a busy arbiter means the frame is dropped and counted,
//! never queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{WriteArbiter, ARBITER_TIMEOUT};
use crate::error::{Error, Result};
use crate::profile::{SizeMode, SizeProfile};
use crate::protocol::TrafficFrameBuilder;
use crate::ratelimit::TokenBucket;
use crate::types::{Bandwidth, TrafficSnapshot};

/// Message ids cycled through the generated frames, matching the common
/// telemetry set the default profile was measured from.
const MESSAGE_IDS: [u8; 10] = [30, 42, 33, 74, 0, 1, 24, 62, 65, 36];

/// Upper bound on the post-rejection sleep so stop stays responsive.
const MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    errors: AtomicU64,
    rate_limited: AtomicU64,
    write_conflicts: AtomicU64,
}

/// Rate-limited background load source. `Stopped → Running → Stopped`.
pub struct TrafficGenerator {
    arbiter: WriteArbiter,
    profile: Arc<SizeProfile>,
    mode: SizeMode,
    bucket: Arc<Mutex<TokenBucket>>,
    counters: Arc<Counters>,
    source_id: u8,
    dest_id: u8,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    started_at: Option<Instant>,
}

impl TrafficGenerator {
    pub fn new(
        arbiter: WriteArbiter,
        profile: Arc<SizeProfile>,
        mode: SizeMode,
        bandwidth_bytes_per_sec: f64,
    ) -> Self {
        Self {
            arbiter,
            profile,
            mode,
            bucket: Arc::new(Mutex::new(TokenBucket::new(bandwidth_bytes_per_sec))),
            counters: Arc::new(Counters::default()),
            source_id: 1,
            dest_id: 2,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
            started_at: None,
        }
    }

    pub fn with_ids(mut self, source_id: u8, dest_id: u8) -> Self {
        self.source_id = source_id;
        self.dest_id = dest_id;
        self
    }

    /// Spawn the generator thread.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.stop.store(false, Ordering::SeqCst);
        self.started_at = Some(Instant::now());

        let arbiter = Arc::clone(&self.arbiter);
        let profile = Arc::clone(&self.profile);
        let bucket = Arc::clone(&self.bucket);
        let counters = Arc::clone(&self.counters);
        let stop = Arc::clone(&self.stop);
        let mode = self.mode;
        let mut builder = TrafficFrameBuilder::new(self.source_id, self.dest_id);

        info!(
            rate = bucket.lock().rate(),
            mode = ?mode,
            "traffic generator starting"
        );

        let handle = thread::Builder::new()
            .name("traffic-gen".to_string())
            .spawn(move || {
                let mut message_cursor = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let size = profile.sample(mode) as usize;
                    let message_id = MESSAGE_IDS[message_cursor % MESSAGE_IDS.len()];
                    message_cursor = message_cursor.wrapping_add(1);
                    let frame = builder.build(size, message_id);

                    let admitted = bucket.lock().try_consume(frame.len());
                    if !admitted {
                        counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                        let backoff = bucket.lock().backoff_for(frame.len()).min(MAX_BACKOFF);
                        thread::sleep(backoff);
                        continue;
                    }

                    match arbiter.try_lock_for(ARBITER_TIMEOUT) {
                        Some(mut channel) => {
                            let written = channel.write_all(&frame).and_then(|()| channel.flush());
                            drop(channel);
                            match written {
                                Ok(()) => {
                                    counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                                    counters
                                        .bytes_sent
                                        .fetch_add(frame.len() as u64, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    counters.errors.fetch_add(1, Ordering::Relaxed);
                                    warn!(error = %e, "traffic write failed");
                                }
                            }
                        }
                        None => {
                            // Channel held by the probe injector; drop the frame.
                            counters.write_conflicts.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                debug!("traffic generator stopped");
            })
            .map_err(|e| Error::Internal(format!("spawn traffic thread: {e}")))?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Raise the stop flag and join the thread.
    pub fn stop(&mut self) -> Result<()> {
        let handle = self.handle.take().ok_or(Error::NotRunning)?;
        self.stop.store(true, Ordering::SeqCst);
        if handle.join().is_err() {
            return Err(Error::Internal("traffic thread panicked".to_string()));
        }
        let snapshot = self.snapshot();
        info!(
            packets = snapshot.packets_sent,
            bytes = snapshot.bytes_sent,
            achieved = %snapshot.achieved_bandwidth,
            "traffic generator stopped"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Retarget the byte rate while running; accumulated tokens are kept.
    pub fn adjust_rate(&self, bandwidth_bytes_per_sec: f64) {
        self.bucket.lock().adjust_rate(bandwidth_bytes_per_sec);
        debug!(rate = bandwidth_bytes_per_sec, "traffic rate adjusted");
    }

    /// Point-in-time view of the counters.
    pub fn snapshot(&self) -> TrafficSnapshot {
        let elapsed = self
            .started_at
            .map_or(0.0, |t| t.elapsed().as_secs_f64());
        let bytes_sent = self.counters.bytes_sent.load(Ordering::Relaxed);
        TrafficSnapshot {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent,
            elapsed_secs: elapsed,
            target_bandwidth: Bandwidth::from_bps(self.bucket.lock().rate()),
            achieved_bandwidth: Bandwidth::from_bps(if elapsed > 0.0 {
                bytes_sent as f64 / elapsed
            } else {
                0.0
            }),
            errors: self.counters.errors.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            write_conflicts: self.counters.write_conflicts.load(Ordering::Relaxed),
        }
    }
}

impl Drop for TrafficGenerator {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{arbiter, LoopbackPair, SerialChannel};

    fn generator(rate: f64) -> (TrafficGenerator, Box<dyn SerialChannel>) {
        let pair = LoopbackPair::instant();
        let gen = TrafficGenerator::new(
            arbiter(Box::new(pair.master)),
            Arc::new(SizeProfile::default_telemetry()),
            SizeMode::Realistic,
            rate,
        );
        (gen, Box::new(pair.slave))
    }

    #[test]
    fn double_start_and_stop_errors() {
        let (mut gen, _rx) = generator(1000.0);
        assert!(matches!(gen.stop(), Err(Error::NotRunning)));
        gen.start().unwrap();
        assert!(matches!(gen.start(), Err(Error::AlreadyRunning)));
        gen.stop().unwrap();
        assert!(!gen.is_running());
    }

    #[test]
    fn generates_bytes_onto_the_wire() {
        let (mut gen, mut rx) = generator(50_000.0);
        gen.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        gen.stop().unwrap();

        let snapshot = gen.snapshot();
        assert!(snapshot.packets_sent > 0);
        assert!(snapshot.bytes_sent > 0);

        let mut buf = [0u8; 4096];
        let n = rx.read(&mut buf).unwrap();
        assert!(n > 0, "nothing crossed the loopback");
        assert_eq!(buf[0], crate::protocol::TRAFFIC_START_BYTE);
    }

    #[test]
    fn rate_limiting_engages_at_low_rates() {
        let (mut gen, _rx) = generator(500.0);
        gen.start().unwrap();
        thread::sleep(Duration::from_millis(300));
        gen.stop().unwrap();

        let snapshot = gen.snapshot();
        // 500 B/s admits only a handful of frames in 300 ms beyond the
        // initial burst; the bucket must have pushed back.
        assert!(snapshot.rate_limited > 0);
        assert!(snapshot.bytes_sent < 5_000);
    }

    #[test]
    fn adjust_rate_takes_effect() {
        let (gen, _rx) = generator(1000.0);
        gen.adjust_rate(2000.0);
        assert!((gen.snapshot().target_bandwidth.bytes_per_sec - 2000.0).abs() < f64::EPSILON);
    }
}
