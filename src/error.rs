//! Error types for linkprobe.

use std::io;

use thiserror::Error;

/// Result type alias for linkprobe operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for linkprobe.
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("channel closed")]
    ChannelClosed,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Profile errors
    #[error("size profile error: {0}")]
    Profile(String),

    // Engine lifecycle errors
    #[error("already running")]
    AlreadyRunning,

    #[error("not running")]
    NotRunning,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Serial transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("write timed out")]
    WriteTimeout,

    #[error("port disconnected")]
    Disconnected,
}

/// Packet framing and parsing errors.
///
/// Scan loops recover from these locally (discard and resume); they surface
/// only when a caller decodes an isolated buffer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("truncated packet: {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },

    #[error("unrecognized marker")]
    BadMarker,

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid packet type: {0:#04x}")]
    InvalidType(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

impl Error {
    /// Check if error is transient (the affected loop should back off and retry).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Transport(
                TransportError::WriteFailed(_)
                    | TransportError::ReadFailed(_)
                    | TransportError::WriteTimeout
            ) | Error::Io(_)
        )
    }
}
