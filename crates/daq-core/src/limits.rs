//! Shared hard limits and fixed hardware constants.
//!
//! This module centralizes:
//! - Supported sample and update rates
//! - Timeout durations for the hardware handshake and stop acknowledgment
//! - Web preview dimensions

use crate::error::DaqError;
use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Bound on the wait for the very first buffer-ready event (3 seconds).
///
/// Only the initial handshake is time-bounded. Later buffer waits block
/// without a deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on the wait for the coprocessor to acknowledge the OFF state (3 seconds).
pub const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(3);

// =============================================================================
// Rates
// =============================================================================

/// Supported sample rates in Hz.
pub const SUPPORTED_SAMPLE_RATES: [u32; 10] =
    [1, 10, 100, 1000, 2000, 4000, 8000, 16000, 32000, 64000];

/// Supported update (buffer) rates in Hz.
pub const SUPPORTED_UPDATE_RATES: [u32; 4] = [1, 2, 5, 10];

/// Highest sample rate still sampled with 24-bit precision.
pub const MAX_HIGH_PRECISION_RATE: u32 = 16000;

/// Native ADC rate used when the requested rate is decimated by the coprocessor.
pub const MIN_NATIVE_RATE: u32 = 1000;

// =============================================================================
// Channel Constants
// =============================================================================

/// Number of analog inputs sampled by the hardware (always all of them).
pub const ANALOG_INPUT_COUNT: usize = 8;

/// Number of digital inputs packed in each per-sample status word.
pub const DIGITAL_INPUT_COUNT: usize = 6;

/// Ratio between the low and high current range resolutions.
pub const HIGH_LOW_SCALE: i64 = 100;

/// Bytes of the sequence counter at the start of every hardware buffer.
pub const SEQUENCE_BYTES: usize = 4;

/// Bytes of the per-sample status word (digital inputs and range-valid flags).
pub const STATUS_WORD_BYTES: usize = 4;

// =============================================================================
// Web Preview
// =============================================================================

/// Number of preview ring buffers (fine, medium, coarse).
pub const PREVIEW_LEVELS: usize = 3;

/// Capacity of each preview ring buffer, in elements (ticks).
pub const PREVIEW_POINTS: usize = 1000;

/// Maximum number of channels in one preview element (6 analog + 6 digital).
pub const PREVIEW_CHANNELS: usize = 12;

/// Fold factor between adjacent preview levels (100:10:1).
pub const PREVIEW_FOLD: usize = 10;

/// Check a sample rate against the supported set.
pub fn validate_sample_rate(rate: u32) -> Result<(), DaqError> {
    if SUPPORTED_SAMPLE_RATES.contains(&rate) {
        return Ok(());
    }
    let supported = SUPPORTED_SAMPLE_RATES
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(DaqError::UnsupportedSampleRate { rate, supported })
}

/// Check an update rate against the supported set and the sample rate.
pub fn validate_update_rate(rate: u32, sample_rate: u32) -> Result<(), DaqError> {
    if !SUPPORTED_UPDATE_RATES.contains(&rate) || sample_rate % rate != 0 {
        return Err(DaqError::UnsupportedUpdateRate { rate, sample_rate });
    }
    Ok(())
}

/// Integer division rounding up. A zero divisor yields zero.
pub fn ceil_div(n: u64, d: u64) -> u64 {
    if d == 0 {
        return 0;
    }
    n.div_ceil(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rates() {
        assert!(validate_sample_rate(1000).is_ok());
        assert!(validate_sample_rate(64000).is_ok());
        let err = validate_sample_rate(500).unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn test_update_rates() {
        assert!(validate_update_rate(10, 1000).is_ok());
        assert!(validate_update_rate(1, 1).is_ok());
        // 1 Hz sampling cannot be split into 2 buffers per second
        assert!(validate_update_rate(2, 1).is_err());
        assert!(validate_update_rate(3, 1000).is_err());
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(10, 3), 4);
        assert_eq!(ceil_div(9, 3), 3);
        assert_eq!(ceil_div(0, 3), 0);
        assert_eq!(ceil_div(5, 0), 0);
    }
}
