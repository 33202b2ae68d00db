//! Real serial port backend.
//!
//! Thin wrapper over the `serialport` crate configured for the radio pair's
//! usual settings (8N1, no flow control). Read timeouts are short so the
//! engine loops stay responsive to their stop flags.

use std::io::{self, Read, Write};

use tracing::debug;

use super::{SerialChannel, READ_TIMEOUT};
use crate::error::{Error, Result, TransportError};

/// A [`SerialChannel`] backed by a physical serial port.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialLink {
    /// Open `path` at `baud` with the standard radio settings.
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| TransportError::OpenFailed {
                port: path.to_string(),
                reason: e.to_string(),
            })?;

        debug!(port = path, baud, "serial port opened");
        Ok(Self {
            port,
            name: path.to_string(),
        })
    }

    /// Port path this link was opened on.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SerialChannel for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            // A timed-out read is an empty read, not an error.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                Err(Error::Transport(TransportError::Disconnected))
            }
            Err(e) => Err(Error::Transport(TransportError::ReadFailed(e.to_string()))),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.port.write_all(buf).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => Error::Transport(TransportError::WriteTimeout),
            _ => Error::Transport(TransportError::WriteFailed(e.to_string())),
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.port
            .flush()
            .map_err(|e| Error::Transport(TransportError::WriteFailed(e.to_string())))
    }

    fn bytes_available(&mut self) -> Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| Error::Transport(TransportError::ReadFailed(e.to_string())))
    }

    fn is_open(&self) -> bool {
        self.port.bytes_to_read().is_ok()
    }

    fn try_clone(&self) -> Result<Box<dyn SerialChannel>> {
        let port = self
            .port
            .try_clone()
            .map_err(|e| Error::Transport(TransportError::OpenFailed {
                port: self.name.clone(),
                reason: e.to_string(),
            }))?;
        Ok(Box::new(Self {
            port,
            name: self.name.clone(),
        }))
    }
}

/// Open a port and split it into a read handle and a write handle.
///
/// The Master's collector reads on one handle while the injector and traffic
/// generator write on the other, so reads never contend with the arbiter.
pub fn open_split(path: &str, baud: u32) -> Result<(Box<dyn SerialChannel>, Box<dyn SerialChannel>)> {
    let writer = SerialLink::open(path, baud)?;
    let reader = writer.try_clone()?;
    Ok((reader, Box::new(writer)))
}

/// Clear any stale bytes sitting in the OS receive buffer.
pub fn drain_input(channel: &mut dyn SerialChannel) -> Result<usize> {
    let mut total = 0;
    let mut scratch = [0u8; 256];
    while channel.bytes_available()? > 0 {
        let n = channel.read(&mut scratch)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    if total > 0 {
        debug!(bytes = total, "drained stale input");
    }
    Ok(total)
}
