//! Byte channel abstraction over the physical link.
//!
//! Everything above this layer speaks to a [`SerialChannel`]: the real
//! radio pair through [`serial::SerialLink`] and the in-process test double
//! through [`loopback::LoopbackPair`]. Both ends share one half-duplex
//! channel, so all writers on the Master side go through a single
//! [`WriteArbiter`] and acquire it with a bounded wait.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;

mod loopback;
mod serial;

pub use loopback::{LoopbackEndpoint, LoopbackPair};
pub use serial::{drain_input, open_split, SerialLink};

/// Read timeout for a single blocking read. Loops poll the stop flag at
/// this cadence, so it bounds shutdown latency.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Longest a writer may wait for the shared channel before dropping its
/// packet and counting a conflict.
pub const ARBITER_TIMEOUT: Duration = Duration::from_millis(10);

/// A half-duplex byte channel.
///
/// Reads block for at most [`READ_TIMEOUT`] and return `Ok(0)` when nothing
/// arrived; they never wait indefinitely.
pub trait SerialChannel: Send {
    /// Read whatever is available into `buf`, waiting briefly if empty.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Push buffered output onto the wire.
    fn flush(&mut self) -> Result<()>;

    /// Bytes ready to read without blocking.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Whether the underlying channel is still usable.
    fn is_open(&self) -> bool;

    /// Second handle onto the same channel, for split read/write use.
    fn try_clone(&self) -> Result<Box<dyn SerialChannel>>;
}

/// Shared write handle to one end of the channel.
///
/// The probe injector and the traffic generator compete for this; both
/// acquire it with `try_lock_for(ARBITER_TIMEOUT)` and drop their packet on
/// failure rather than stall their cadence.
pub type WriteArbiter = Arc<Mutex<Box<dyn SerialChannel>>>;

/// Wrap a channel in a write arbiter.
pub fn arbiter(channel: Box<dyn SerialChannel>) -> WriteArbiter {
    Arc::new(Mutex::new(channel))
}
