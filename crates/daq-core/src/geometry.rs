//! Buffer sizing derived from the sampling configuration.

use serde::{Deserialize, Serialize};

use crate::error::DaqError;
use crate::limits::{
    ceil_div, validate_sample_rate, validate_update_rate, ANALOG_INPUT_COUNT,
    MAX_HIGH_PRECISION_RATE, SEQUENCE_BYTES, STATUS_WORD_BYTES,
};

/// ADC precision class. Selects the raw sample width and calibration set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 16-bit samples, used at the highest sample rates.
    Low,
    /// 24-bit samples.
    High,
}

impl Precision {
    /// Precision used by the hardware at a given sample rate.
    pub fn for_rate(sample_rate: u32) -> Self {
        if sample_rate > MAX_HIGH_PRECISION_RATE {
            Precision::Low
        } else {
            Precision::High
        }
    }

    /// Width of one raw sample in bytes.
    pub fn sample_width(self) -> usize {
        match self {
            Precision::Low => 2,
            Precision::High => 3,
        }
    }
}

/// Sizing of the double-buffered hardware transfer for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Buffers per second.
    pub update_rate: u32,
    /// Raw sample precision.
    pub precision: Precision,
    /// Samples per full buffer.
    pub buffer_size: u32,
    /// Requested sample count, 0 for unbounded sessions.
    pub sample_limit: u64,
    /// Buffers in a bounded session, `None` when unbounded.
    pub number_buffers: Option<u64>,
}

impl BufferGeometry {
    /// Compute the geometry, rejecting unsupported rates.
    ///
    /// `sample_limit == 0` means an unbounded session.
    pub fn new(sample_rate: u32, update_rate: u32, sample_limit: u64) -> Result<Self, DaqError> {
        validate_sample_rate(sample_rate)?;
        validate_update_rate(update_rate, sample_rate)?;

        let buffer_size = sample_rate / update_rate;
        let number_buffers =
            (sample_limit > 0).then(|| ceil_div(sample_limit, u64::from(buffer_size)));

        Ok(Self {
            sample_rate,
            update_rate,
            precision: Precision::for_rate(sample_rate),
            buffer_size,
            sample_limit,
            number_buffers,
        })
    }

    /// Raw sample width in bytes.
    pub fn sample_width(&self) -> usize {
        self.precision.sample_width()
    }

    /// Bytes of one raw tick: status word plus all analog inputs.
    pub fn record_bytes(&self) -> usize {
        STATUS_WORD_BYTES + ANALOG_INPUT_COUNT * self.sample_width()
    }

    /// Bytes of one hardware buffer including its sequence counter.
    pub fn buffer_bytes(&self) -> usize {
        SEQUENCE_BYTES + self.buffer_size as usize * self.record_bytes()
    }

    /// Bytes the hardware needs for both buffer slots.
    pub fn required_memory(&self) -> usize {
        2 * self.buffer_bytes()
    }

    /// Whether both buffer slots fit into a memory region of `available` bytes.
    pub fn fits(&self, available: usize) -> bool {
        self.required_memory() <= available
    }

    /// Whether `index` is the last buffer of a bounded session.
    pub fn is_last(&self, index: u64) -> bool {
        self.number_buffers.is_some_and(|n| index + 1 >= n)
    }

    /// Samples the hardware delivers in buffer `index`.
    ///
    /// Every buffer is full except the last one of a bounded session, which
    /// carries the remainder of the sample limit when it does not divide evenly.
    pub fn samples_in_buffer(&self, index: u64) -> u32 {
        let remainder = self.sample_limit % u64::from(self.buffer_size);
        if self.is_last(index) && remainder != 0 {
            remainder as u32
        } else {
            self.buffer_size
        }
    }
}
