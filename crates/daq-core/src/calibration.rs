//! Per-channel calibration table.
//!
//! The table is populated once before a session starts and is read-only
//! afterwards. Loading it from disk is left to the caller; the configuration
//! file may carry an inline table.

use serde::{Deserialize, Serialize};

use crate::channel::AnalogInput;
use crate::error::DaqError;
use crate::geometry::Precision;
use crate::limits::ANALOG_INPUT_COUNT;

/// Offsets and scales of every analog input for one precision class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSet {
    /// Additive offset applied to the raw count.
    pub offsets: [i32; ANALOG_INPUT_COUNT],
    /// Multiplicative scale applied after the offset.
    pub scales: [f64; ANALOG_INPUT_COUNT],
}

impl Default for CalibrationSet {
    fn default() -> Self {
        Self {
            offsets: [0; ANALOG_INPUT_COUNT],
            scales: [1.0; ANALOG_INPUT_COUNT],
        }
    }
}

impl CalibrationSet {
    /// Calibrate one raw count of `input`.
    #[inline]
    pub fn apply(&self, input: AnalogInput, raw: i32) -> i32 {
        let n = input.index();
        ((i64::from(raw) + i64::from(self.offsets[n])) as f64 * self.scales[n]) as i32
    }
}

/// Calibration for both precision classes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    /// 16-bit sample calibration.
    #[serde(default)]
    pub low: CalibrationSet,
    /// 24-bit sample calibration.
    #[serde(default)]
    pub high: CalibrationSet,
}

impl CalibrationTable {
    /// Table with zero offsets and unit scales.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Restore the identity calibration.
    pub fn reset(&mut self) {
        *self = Self::identity();
    }

    /// Set for a precision class.
    pub fn for_precision(&self, precision: Precision) -> &CalibrationSet {
        match precision {
            Precision::Low => &self.low,
            Precision::High => &self.high,
        }
    }

    /// Reject non-finite or zero scales.
    pub fn validate(&self) -> Result<(), DaqError> {
        for (class, set) in [("low", &self.low), ("high", &self.high)] {
            for (input, scale) in AnalogInput::ALL.iter().zip(set.scales) {
                if !scale.is_finite() || scale == 0.0 {
                    return Err(DaqError::Configuration(format!(
                        "Invalid {} precision calibration scale {} for {}",
                        class,
                        scale,
                        input.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let table = CalibrationTable::identity();
        assert_eq!(table.high.apply(AnalogInput::V1, -1234), -1234);
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_offset_then_scale() {
        let mut table = CalibrationTable::identity();
        table.high.offsets[AnalogInput::V2.index()] = 10;
        table.high.scales[AnalogInput::V2.index()] = 2.5;
        assert_eq!(table.high.apply(AnalogInput::V2, 30), 100);
        // other precision class untouched
        assert_eq!(table.low.apply(AnalogInput::V2, 30), 30);

        table.reset();
        assert_eq!(table, CalibrationTable::identity());
    }

    #[test]
    fn test_rejects_zero_scale() {
        let mut table = CalibrationTable::identity();
        table.low.scales[0] = 0.0;
        assert!(table.validate().is_err());
    }
}
