//! Error types for coprocessor sessions.
//!
//! Covers every failure mode of a sampling session, from configuration
//! rejection (before any hardware access) to fatal hardware faults.

use daq_core::error::{DaqError, DriverError, DriverErrorKind};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for coprocessor operations.
pub type Result<T> = std::result::Result<T, CoprocError>;

/// Errors that can occur while driving the sampling coprocessor.
#[derive(Error, Debug)]
pub enum CoprocError {
    /// Configuration rejected before hardware was touched
    #[error(transparent)]
    Configuration(#[from] DaqError),

    /// Memory region cannot hold both buffer slots
    #[error("Not enough coprocessor memory: {required} bytes required, {available} available")]
    MemoryTooSmall { required: usize, available: usize },

    /// Memory mapping failed
    #[error("Failed to map coprocessor memory: {message}")]
    Mapping { message: String },

    /// Program could not be loaded or started
    #[error("Failed to load coprocessor program: {message}")]
    ProgramLoad { message: String },

    /// Command rejected by the coprocessor
    #[error("Coprocessor rejected command {command}: {message}")]
    CommandRejected { command: String, message: String },

    /// No buffer-ready event within the handshake deadline
    #[error("Coprocessor not responding (no buffer within {timeout:?})")]
    HandshakeTimeout { timeout: Duration },

    /// Waiting for the buffer-ready event failed
    #[error("Buffer-ready wait failed: {message}")]
    EventWait { message: String },

    /// Sequence counter behind the expected index
    #[error("Buffer sequence went backwards: expected {expected}, got {sequence}")]
    SequenceRegression { expected: u64, sequence: u64 },

    /// Raw buffer shorter than its sample count requires
    #[error("Buffer too short: {len} bytes for {samples} samples")]
    BufferTooShort { len: usize, samples: u32 },

    /// A tick sink failed
    #[error("Sink '{sink}' failed: {message}")]
    Sink { sink: String, message: String },

    /// Status segment could not be written
    #[error("Status publication failed: {message}")]
    Status { message: String },

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),
}

impl CoprocError {
    /// Wrap a sink failure.
    pub fn sink(sink: &str, err: anyhow::Error) -> Self {
        Self::Sink {
            sink: sink.to_string(),
            message: format!("{:#}", err),
        }
    }

    /// Whether the error was raised before any hardware access.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(err) if err.is_configuration())
    }

    /// Whether this is the initial handshake timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::HandshakeTimeout { .. })
    }
}

impl CoprocError {
    fn driver_kind(&self) -> DriverErrorKind {
        match self {
            Self::Configuration(_) => DriverErrorKind::Configuration,
            Self::MemoryTooSmall { .. } | Self::Mapping { .. } | Self::ProgramLoad { .. } => {
                DriverErrorKind::Initialization
            }
            Self::CommandRejected { .. } | Self::SequenceRegression { .. } => {
                DriverErrorKind::Hardware
            }
            Self::HandshakeTimeout { .. } => DriverErrorKind::Timeout,
            Self::EventWait { .. } | Self::BufferTooShort { .. } | Self::StdIoError(_) => {
                DriverErrorKind::Communication
            }
            Self::Sink { .. } | Self::Status { .. } => DriverErrorKind::Unknown,
        }
    }
}

impl From<CoprocError> for DaqError {
    fn from(err: CoprocError) -> Self {
        match err {
            CoprocError::Configuration(inner) => inner,
            other => DaqError::Driver(DriverError::new(
                "coproc",
                other.driver_kind(),
                other.to_string(),
            )),
        }
    }
}
