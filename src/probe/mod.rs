//! Probe exchange engine.
//!
//! Three loops cooperate around the shared channel:
//!
//! - the **injector** sends timestamped requests at a fixed cadence through
//!   the write arbiter and sweeps timed-out probes,
//! - the **collector** reads the Master side, reassembles response frames
//!   and matches them against the pending table,
//! - the **responder** (when this process drives the Slave port too) echoes
//!   every valid request straight back.
//!
//! A probe is `Pending` from the moment its request is written until a
//! matching response arrives (`Received`) or the timeout sweep claims it
//! (`TimedOut`). The sweep is the only loss mechanism; nothing else removes
//! a pending entry.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::channel::{SerialChannel, WriteArbiter, ARBITER_TIMEOUT};
use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::profile::{SizeMode, SizeProfile};
use crate::protocol::{FrameScanner, ProbeFrame, ProbeType};
use crate::stats::{self, DelayStats, PerSizeStats, ProbeStatistics};
use crate::types::{ProbeId, ProbeRecord, ProbeStatus};

mod detailed;

pub use detailed::{DetailedReport, DetailedTester};

/// Idle sleep inside the injector when the next tick is not yet due.
const TICK_POLL: Duration = Duration::from_millis(5);

struct PendingProbe {
    sent_at: Instant,
    sent_at_us: u64,
    size: u16,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    timed_out: AtomicU64,
    mismatches: AtomicU64,
    skipped_ticks: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

struct Shared {
    pending: Mutex<HashMap<u32, PendingProbe>>,
    history: Mutex<VecDeque<ProbeRecord>>,
    counters: Counters,
    last_rtt: Mutex<Option<Duration>>,
    history_capacity: usize,
    epoch: Instant,
}

impl Shared {
    fn record(&self, record: ProbeRecord) {
        let mut history = self.history.lock();
        if history.len() == self.history_capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Move pending probes older than `timeout` to `TimedOut`.
    fn sweep_timeouts(&self, timeout: Duration) {
        let now = Instant::now();
        let expired: Vec<(u32, PendingProbe)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u32> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.sent_at) > timeout)
                .map(|(&id, _)| id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        for (id, probe) in expired {
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            trace!(probe_id = id, "probe timed out");
            self.record(ProbeRecord {
                probe_id: ProbeId(id),
                size: probe.size,
                sent_at_us: probe.sent_at_us,
                received_at_us: 0,
                status: ProbeStatus::TimedOut,
                rtt: Duration::ZERO,
                jitter: Duration::ZERO,
            });
        }
    }

    fn handle_response(&self, frame: &ProbeFrame) {
        let now = Instant::now();
        let now_us = self.epoch.elapsed().as_micros() as u64;

        let probe = self.pending.lock().remove(&frame.probe_id.0);
        let Some(probe) = probe else {
            // Late or duplicate response; its probe already resolved.
            self.counters.mismatches.fetch_add(1, Ordering::Relaxed);
            trace!(probe_id = %frame.probe_id, "unmatched response");
            return;
        };

        let rtt = now.duration_since(probe.sent_at);
        let jitter = {
            let mut last = self.last_rtt.lock();
            let jitter = match *last {
                Some(prev) if prev >= rtt => prev - rtt,
                Some(prev) => rtt - prev,
                None => Duration::ZERO,
            };
            *last = Some(rtt);
            jitter
        };

        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(u64::from(frame.declared_size), Ordering::Relaxed);

        self.record(ProbeRecord {
            probe_id: frame.probe_id,
            size: probe.size,
            sent_at_us: probe.sent_at_us,
            received_at_us: now_us,
            status: ProbeStatus::Received,
            rtt,
            jitter,
        });
    }
}

/// The probe measurement engine. One-shot: `Stopped → Running → Stopped`.
pub struct ProbeExchange {
    write: WriteArbiter,
    reader: Option<Box<dyn SerialChannel>>,
    slave: Option<Box<dyn SerialChannel>>,
    interval: Duration,
    timeout: Duration,
    packet_size: u16,
    sizer: Option<(Arc<SizeProfile>, SizeMode)>,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl ProbeExchange {
    /// Engine over a Master write arbiter and its split read handle.
    pub fn new(write: WriteArbiter, reader: Box<dyn SerialChannel>, config: &ProbeConfig) -> Self {
        Self {
            write,
            reader: Some(reader),
            slave: None,
            interval: config.interval,
            timeout: config.timeout,
            packet_size: config.packet_size,
            sizer: None,
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
                counters: Counters::default(),
                last_rtt: Mutex::new(None),
                history_capacity: config.history_capacity.max(1),
                epoch: Instant::now(),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    /// Also drive the Slave port from this process, echoing requests back.
    pub fn with_responder(mut self, slave: Box<dyn SerialChannel>) -> Self {
        self.slave = Some(slave);
        self
    }

    /// Draw each probe's size from a profile instead of the fixed
    /// `packet_size`, so the per-size breakdown covers the whole
    /// distribution the link actually carries.
    pub fn with_size_profile(mut self, profile: Arc<SizeProfile>, mode: SizeMode) -> Self {
        self.sizer = Some((profile, mode));
        self
    }

    /// Spawn the injector, collector and (optionally) responder loops.
    pub fn start(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(Error::AlreadyRunning);
        }
        // The collector consumed the read handle on the first start; the
        // engine is one-shot.
        let reader = self.reader.take().ok_or(Error::ChannelClosed)?;
        self.stop.store(false, Ordering::SeqCst);

        info!(
            interval = ?self.interval,
            timeout = ?self.timeout,
            size = self.packet_size,
            "probe exchange starting"
        );

        if let Some(slave) = self.slave.take() {
            self.handles.push(spawn_responder(
                slave,
                Arc::clone(&self.stop),
            )?);
        }
        self.handles.push(spawn_collector(
            reader,
            Arc::clone(&self.shared),
            Arc::clone(&self.stop),
        )?);
        self.handles.push(spawn_injector(
            Arc::clone(&self.write),
            Arc::clone(&self.shared),
            Arc::clone(&self.stop),
            self.interval,
            self.timeout,
            self.packet_size,
            self.sizer.clone(),
        )?);

        Ok(())
    }

    /// Raise the stop flag and join every loop.
    pub fn stop(&mut self) -> Result<()> {
        if self.handles.is_empty() {
            return Err(Error::NotRunning);
        }
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                return Err(Error::Internal("probe thread panicked".to_string()));
            }
        }

        let stats = self.statistics();
        info!(
            sent = stats.sent,
            received = stats.received,
            lost = stats.timed_out,
            loss = format!("{:.1}%", stats.loss_percent()),
            mean_rtt = ?stats.rtt.mean,
            "probe exchange stopped"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Outstanding (unresolved) probes.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Aggregate statistics over the resolved history.
    pub fn statistics(&self) -> ProbeStatistics {
        let history = self.shared.history.lock();
        let rtts: Vec<Duration> = history
            .iter()
            .filter(|r| r.status == ProbeStatus::Received)
            .map(|r| r.rtt)
            .collect();
        drop(history);

        let c = &self.shared.counters;
        let sent = c.sent.load(Ordering::Relaxed);
        let timed_out = c.timed_out.load(Ordering::Relaxed);

        ProbeStatistics {
            sent,
            received: c.received.load(Ordering::Relaxed),
            timed_out,
            mismatches: c.mismatches.load(Ordering::Relaxed),
            skipped_ticks: c.skipped_ticks.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            loss_rate: stats::loss_rate(sent, timed_out),
            rtt: DelayStats::from_samples(&rtts),
            jitter: DelayStats::from_samples(&stats::jitter_series(&rtts)),
        }
    }

    /// The most recent `n` resolved probes, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ProbeRecord> {
        let history = self.shared.history.lock();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).copied().collect()
    }

    /// RTT statistics bucketed by declared probe size.
    pub fn per_size_statistics(&self) -> PerSizeStats {
        let history = self.shared.history.lock();
        let mut buckets: BTreeMap<u16, Vec<Duration>> = BTreeMap::new();
        for record in history.iter() {
            if record.status == ProbeStatus::Received {
                buckets.entry(record.size).or_default().push(record.rtt);
            }
        }
        drop(history);
        PerSizeStats::from_buckets(&buckets)
    }
}

impl Drop for ProbeExchange {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            let _ = self.stop();
        }
    }
}

fn spawn_injector(
    write: WriteArbiter,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    interval: Duration,
    timeout: Duration,
    packet_size: u16,
    sizer: Option<(Arc<SizeProfile>, SizeMode)>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("probe-inject".to_string())
        .spawn(move || {
            let mut next_tick = Instant::now();
            let mut next_id = ProbeId::ZERO;

            while !stop.load(Ordering::Relaxed) {
                let now = Instant::now();
                if now < next_tick {
                    thread::sleep((next_tick - now).min(TICK_POLL));
                    continue;
                }
                // Never schedule into the past; late ticks re-anchor on now.
                next_tick = (next_tick + interval).max(now);

                shared.sweep_timeouts(timeout);

                let probe_id = next_id;
                next_id = next_id.next();

                let size = sizer.as_ref().map_or(usize::from(packet_size), |(p, mode)| {
                    usize::from(p.sample(*mode))
                });

                let sent_at_us = shared.epoch.elapsed().as_micros() as u64;
                let frame = ProbeFrame::new(probe_id, ProbeType::Request, sent_at_us, size);
                let bytes = frame.encode();

                // Insert before writing so a fast response can always match.
                shared.pending.lock().insert(
                    probe_id.0,
                    PendingProbe {
                        sent_at: Instant::now(),
                        sent_at_us,
                        size: frame.declared_size,
                    },
                );

                let written = match write.try_lock_for(ARBITER_TIMEOUT) {
                    Some(mut channel) => {
                        channel.write_all(&bytes).and_then(|()| channel.flush())
                    }
                    None => {
                        // Arbiter busy: skip this tick, never delay the next.
                        shared.pending.lock().remove(&probe_id.0);
                        shared.counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };

                match written {
                    Ok(()) => {
                        shared.counters.sent.fetch_add(1, Ordering::Relaxed);
                        shared
                            .counters
                            .bytes_sent
                            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        trace!(probe_id = %probe_id, size = bytes.len(), "probe sent");
                    }
                    Err(e) => {
                        shared.pending.lock().remove(&probe_id.0);
                        shared.counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "probe write failed");
                    }
                }
            }

            // Resolve what can still expire before reporting.
            shared.sweep_timeouts(timeout);
            debug!("injector stopped");
        })
        .map_err(|e| Error::Internal(format!("spawn injector: {e}")))
}

fn spawn_collector(
    mut reader: Box<dyn SerialChannel>,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("probe-collect".to_string())
        .spawn(move || {
            let mut scanner = FrameScanner::new();
            let mut buf = [0u8; 1024];

            while !stop.load(Ordering::Relaxed) {
                let n = match reader.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => n,
                    Err(e) if e.is_recoverable() => {
                        warn!(error = %e, "collector read failed");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "collector channel lost");
                        break;
                    }
                };

                scanner.extend(&buf[..n]);
                while let Some(frame) = scanner.next_frame() {
                    if frame.probe_type == ProbeType::Response {
                        shared.handle_response(&frame);
                    }
                }
            }
            debug!(discarded = scanner.discarded(), "collector stopped");
        })
        .map_err(|e| Error::Internal(format!("spawn collector: {e}")))
}

fn spawn_responder(
    mut slave: Box<dyn SerialChannel>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("probe-respond".to_string())
        .spawn(move || {
            let mut scanner = FrameScanner::new();
            let mut buf = [0u8; 1024];

            while !stop.load(Ordering::Relaxed) {
                let n = match slave.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => n,
                    Err(e) if e.is_recoverable() => continue,
                    Err(e) => {
                        warn!(error = %e, "responder channel lost");
                        break;
                    }
                };

                scanner.extend(&buf[..n]);
                while let Some(frame) = scanner.next_frame() {
                    if frame.probe_type != ProbeType::Request {
                        continue;
                    }
                    // Echo carries the original timestamp back unchanged.
                    let echo = frame.to_response().encode();
                    if let Err(e) = slave.write_all(&echo).and_then(|()| slave.flush()) {
                        warn!(error = %e, "echo write failed");
                    }
                }
            }
            debug!("responder stopped");
        })
        .map_err(|e| Error::Internal(format!("spawn responder: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{arbiter, LoopbackPair};

    fn config(interval_ms: u64, timeout_ms: u64) -> ProbeConfig {
        ProbeConfig {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
            packet_size: 64,
            size_mode: None,
            history_capacity: 1000,
        }
    }

    #[test]
    fn exchange_resolves_probes_over_instant_loopback() {
        let pair = LoopbackPair::instant();
        let reader = pair.master.clone();
        let write = arbiter(Box::new(pair.master));

        let mut exchange = ProbeExchange::new(write, Box::new(reader), &config(20, 500))
            .with_responder(Box::new(pair.slave));
        exchange.start().unwrap();
        thread::sleep(Duration::from_millis(300));
        exchange.stop().unwrap();

        let stats = exchange.statistics();
        assert!(stats.sent >= 10, "sent only {}", stats.sent);
        assert!(stats.received >= stats.sent - 1);
        assert_eq!(stats.timed_out, 0);
        assert!(stats.rtt.mean < Duration::from_millis(30));
    }

    #[test]
    fn without_responder_every_probe_times_out() {
        let pair = LoopbackPair::instant();
        let reader = pair.master.clone();
        let write = arbiter(Box::new(pair.master));
        let _silent_slave = pair.slave;

        let mut exchange = ProbeExchange::new(write, Box::new(reader), &config(30, 100));
        exchange.start().unwrap();
        thread::sleep(Duration::from_millis(400));
        exchange.stop().unwrap();

        let stats = exchange.statistics();
        assert!(stats.sent >= 5);
        assert_eq!(stats.received, 0);
        // Probes younger than the timeout at shutdown stay pending; everything
        // older must have been swept into the loss count.
        assert!(stats.timed_out >= stats.sent.saturating_sub(5));
        assert!(stats.loss_rate > 0.5);
        assert_eq!(stats.rtt.count, 0);
        assert!(exchange.pending_count() <= 5);
    }

    #[test]
    fn profile_sized_probes_fill_multiple_buckets() {
        let pair = LoopbackPair::instant();
        let reader = pair.master.clone();
        let write = arbiter(Box::new(pair.master));

        let profile = Arc::new(SizeProfile::default_telemetry());
        let mut exchange = ProbeExchange::new(write, Box::new(reader), &config(15, 500))
            .with_size_profile(profile, SizeMode::Representative)
            .with_responder(Box::new(pair.slave));
        exchange.start().unwrap();
        thread::sleep(Duration::from_millis(400));
        exchange.stop().unwrap();

        let stats = exchange.statistics();
        assert!(stats.received >= 10, "received only {}", stats.received);

        // The representative cycle spans many sizes, so the per-size
        // breakdown must not collapse into a single bucket.
        let per_size = exchange.per_size_statistics();
        assert!(
            per_size.buckets.len() >= 3,
            "only {} size buckets",
            per_size.buckets.len()
        );
        for (size, bucket) in &per_size.buckets {
            assert!(bucket.count > 0, "empty bucket for size {size}");
        }
    }

    #[test]
    fn double_start_and_stop_are_rejected() {
        let pair = LoopbackPair::instant();
        let reader = pair.master.clone();
        let write = arbiter(Box::new(pair.master));

        let mut exchange = ProbeExchange::new(write, Box::new(reader), &config(50, 500));
        assert!(matches!(exchange.stop(), Err(Error::NotRunning)));
        exchange.start().unwrap();
        assert!(matches!(exchange.start(), Err(Error::AlreadyRunning)));
        exchange.stop().unwrap();

        // One-shot: the collector consumed the read handle, so a restart
        // reports the missing channel rather than a phantom running state.
        assert!(matches!(exchange.start(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn recent_returns_newest_records() {
        let pair = LoopbackPair::instant();
        let reader = pair.master.clone();
        let write = arbiter(Box::new(pair.master));

        let mut exchange = ProbeExchange::new(write, Box::new(reader), &config(15, 500))
            .with_responder(Box::new(pair.slave));
        exchange.start().unwrap();
        thread::sleep(Duration::from_millis(250));
        exchange.stop().unwrap();

        let recent = exchange.recent(3);
        assert!(recent.len() <= 3);
        let all = exchange.recent(usize::MAX);
        assert!(all.len() >= recent.len());
        // Oldest-first ordering by id.
        for pair in all.windows(2) {
            assert!(pair[0].probe_id.0 < pair[1].probe_id.0);
        }
    }
}
