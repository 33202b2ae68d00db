//! In-memory cross-wired channel pair with simulated propagation delay.
//!
//! Two endpoints connected back to back: bytes written on one side become
//! readable on the other once the configured per-direction delay has
//! elapsed. Used by the self-test mode and the integration tests, where the
//! known delay makes the expected RTT exact.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{SerialChannel, READ_TIMEOUT};
use crate::error::Result;

/// Poll granularity while waiting for delayed bytes to mature.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

type Wire = Arc<Mutex<VecDeque<(Instant, u8)>>>;

/// One side of a [`LoopbackPair`].
///
/// Cloning yields another handle on the same wires, which is how the test
/// Master splits its read and write paths.
#[derive(Clone)]
pub struct LoopbackEndpoint {
    /// Bytes headed toward this endpoint, stamped with their ready time.
    incoming: Wire,
    /// The peer's incoming wire.
    outgoing: Wire,
    delay: Duration,
}

impl LoopbackEndpoint {
    fn ready_count(&self, now: Instant) -> usize {
        self.incoming
            .lock()
            .iter()
            .take_while(|(ready_at, _)| *ready_at <= now)
            .count()
    }

    fn take_ready(&self, buf: &mut [u8], now: Instant) -> usize {
        let mut queue = self.incoming.lock();
        let mut n = 0;
        while n < buf.len() {
            match queue.front() {
                Some((ready_at, byte)) if *ready_at <= now => {
                    buf[n] = *byte;
                    n += 1;
                    queue.pop_front();
                }
                _ => break,
            }
        }
        n
    }
}

impl SerialChannel for LoopbackEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let deadline = Instant::now() + READ_TIMEOUT;
        loop {
            let now = Instant::now();
            let n = self.take_ready(buf, now);
            if n > 0 {
                return Ok(n);
            }
            if now >= deadline {
                return Ok(0);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let ready_at = Instant::now() + self.delay;
        let mut queue = self.outgoing.lock();
        for &b in buf {
            queue.push_back((ready_at, b));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.ready_count(Instant::now()))
    }

    fn is_open(&self) -> bool {
        true
    }

    fn try_clone(&self) -> Result<Box<dyn SerialChannel>> {
        Ok(Box::new(self.clone()))
    }
}

/// A cross-wired pair of in-memory channels.
pub struct LoopbackPair {
    pub master: LoopbackEndpoint,
    pub slave: LoopbackEndpoint,
}

impl LoopbackPair {
    /// Build a pair with the given one-way delays.
    pub fn new(master_to_slave: Duration, slave_to_master: Duration) -> Self {
        let wire_to_slave: Wire = Arc::new(Mutex::new(VecDeque::new()));
        let wire_to_master: Wire = Arc::new(Mutex::new(VecDeque::new()));

        Self {
            master: LoopbackEndpoint {
                incoming: Arc::clone(&wire_to_master),
                outgoing: Arc::clone(&wire_to_slave),
                delay: master_to_slave,
            },
            slave: LoopbackEndpoint {
                incoming: wire_to_slave,
                outgoing: wire_to_master,
                delay: slave_to_master,
            },
        }
    }

    /// Symmetric pair with the same delay in both directions.
    pub fn symmetric(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    /// Zero-delay pair for codec-level tests.
    pub fn instant() -> Self {
        Self::symmetric(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_cross_the_wire_in_order() {
        let pair = LoopbackPair::instant();
        let mut master = pair.master;
        let mut slave = pair.slave;

        master.write_all(&[1, 2, 3]).unwrap();
        master.write_all(&[4, 5]).unwrap();

        let mut buf = [0u8; 16];
        let n = slave.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn delay_holds_bytes_back() {
        let pair = LoopbackPair::new(Duration::from_millis(30), Duration::ZERO);
        let mut master = pair.master;
        let mut slave = pair.slave;

        master.write_all(&[0xaa]).unwrap();

        // Within the 10 ms read timeout nothing is ready yet.
        let mut buf = [0u8; 4];
        assert_eq!(slave.read(&mut buf).unwrap(), 0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(slave.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0xaa);
    }

    #[test]
    fn directions_are_independent() {
        let pair = LoopbackPair::instant();
        let mut master = pair.master;
        let mut slave = pair.slave;

        master.write_all(b"up").unwrap();
        slave.write_all(b"down").unwrap();

        let mut buf = [0u8; 8];
        let n = slave.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"up");
        let n = master.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"down");
    }

    #[test]
    fn clone_shares_the_same_wires() {
        let pair = LoopbackPair::instant();
        let mut writer = pair.master.clone();
        let mut reader = pair.slave;

        writer.write_all(&[9]).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 9);
    }
}
