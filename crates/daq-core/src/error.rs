//! Custom error types shared by the logger crates.
//!
//! `DaqError` is the error type surfaced at crate boundaries. Driver crates
//! keep their own detailed `thiserror` enums and convert into
//! [`DaqError::Driver`] with a [`DriverErrorKind`] classification, so callers
//! can tell a configuration mistake from a hardware fault without matching on
//! driver-specific variants.
//!
//! ## Error Categories
//!
//! 1. **Configuration Errors** - `Config`, `Configuration`, `UnsupportedSampleRate`,
//!    `UnsupportedUpdateRate`
//!    - Raised before any hardware is touched
//!    - Recovery: fix the configuration and start again
//!
//! 2. **Session Errors** - `AlreadySampling`, `Driver`
//!    - Raised while starting or running an acquisition session
//!
//! 3. **I/O Errors** - `Io`
//!    - File and shared-memory segment operations

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Broad classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Hardware could not be brought up (program load, memory mapping).
    Initialization,
    /// Configuration rejected by the driver.
    Configuration,
    /// Failure exchanging commands or data with the hardware.
    Communication,
    /// Fault reported by the hardware itself.
    Hardware,
    /// A bounded wait expired.
    Timeout,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Structured driver error with category.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Short driver identifier, e.g. `"coproc"`.
    pub driver_type: String,
    /// Failure classification.
    pub kind: DriverErrorKind,
    /// Human readable description.
    pub message: String,
}

impl DriverError {
    /// Create a new driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the shared error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the logger.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file could not be parsed or merged.
    ///
    /// **Source**: Wraps `figment::Error` (TOML file + environment overrides).
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    ///
    /// **Error Type**: Permanent - no session is started.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Sample rate outside the supported set.
    #[error("Unsupported sample rate {rate} Hz (supported: {supported})")]
    UnsupportedSampleRate {
        /// Requested rate in Hz.
        rate: u32,
        /// Comma separated list of supported rates.
        supported: String,
    },

    /// Update rate outside the supported set, or not a divisor of the sample rate.
    #[error("Unsupported update rate {rate} Hz for sample rate {sample_rate} Hz")]
    UnsupportedUpdateRate {
        /// Requested update rate in Hz.
        rate: u32,
        /// Configured sample rate in Hz.
        sample_rate: u32,
    },

    /// A session is already running on this host.
    ///
    /// Raised when the status segment reports an active session at start.
    #[error("A sampling session is already running")]
    AlreadySampling,

    /// Standard I/O operation failed.
    ///
    /// **Recovery Strategy**: status read failures are treated as "no session";
    /// status write failures abort the session.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structured driver error with category.
    #[error("{0}")]
    Driver(DriverError),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl From<DriverError> for DaqError {
    fn from(err: DriverError) -> Self {
        DaqError::Driver(err)
    }
}

impl DaqError {
    /// Whether this error was raised before hardware could be touched.
    pub fn is_configuration(&self) -> bool {
        match self {
            DaqError::Config(_)
            | DaqError::Configuration(_)
            | DaqError::UnsupportedSampleRate { .. }
            | DaqError::UnsupportedUpdateRate { .. } => true,
            DaqError::Driver(err) => err.kind == DriverErrorKind::Configuration,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::new("coproc", DriverErrorKind::Timeout, "no response");
        assert_eq!(
            err.to_string(),
            "Driver 'coproc' timeout error: no response"
        );
    }

    #[test]
    fn test_configuration_classification() {
        let err = DaqError::UnsupportedSampleRate {
            rate: 3,
            supported: "1, 10".into(),
        };
        assert!(err.is_configuration());
        assert!(err.to_string().contains("3 Hz"));

        let err: DaqError =
            DriverError::new("coproc", DriverErrorKind::Hardware, "fault").into();
        assert!(!err.is_configuration());
        assert!(!DaqError::AlreadySampling.is_configuration());
    }
}
