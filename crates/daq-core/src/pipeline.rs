//! Tick sinks fed by the demux engine.
//!
//! Every validated hardware buffer is demultiplexed in a single pass. Each
//! tick is pushed to every active sink before the next tick is decoded, and
//! each sink sees `begin_buffer` / `end_buffer` around the ticks of one buffer.

use anyhow::Result;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall clock and monotonic time of one buffer, as `(seconds, nanoseconds)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferTimestamp {
    /// Realtime clock.
    pub realtime: (i64, i64),
    /// Monotonic clock, relative to an arbitrary session-wide origin.
    pub monotonic: (i64, i64),
}

impl BufferTimestamp {
    /// Capture both clocks. `monotonic` is the time elapsed since session start.
    pub fn capture(monotonic: Duration) -> Self {
        let realtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            realtime: split(realtime),
            monotonic: split(monotonic),
        }
    }

    /// Realtime clock in milliseconds since the UNIX epoch.
    pub fn realtime_millis(&self) -> i64 {
        self.realtime.0 * 1000 + self.realtime.1 / 1_000_000
    }
}

fn split(duration: Duration) -> (i64, i64) {
    (duration.as_secs() as i64, i64::from(duration.subsec_nanos()))
}

/// Metadata of one validated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Buffer index (hardware sequence number).
    pub index: u64,
    /// Ticks contained in the buffer.
    pub samples: u32,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Capture time of the buffer.
    pub timestamp: BufferTimestamp,
}

/// One calibrated tick across all logical channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick<'a> {
    /// Position of the tick inside its buffer.
    pub index: u32,
    /// Packed binary channels, bit `k` is binary channel `k` of the layout.
    pub binary: u32,
    /// Analog channel values in layout order.
    pub analog: &'a [i32],
}

impl Tick<'_> {
    /// Value of binary channel `k`.
    #[inline]
    pub fn bit(&self, k: usize) -> bool {
        self.binary & (1 << k) != 0
    }
}

/// A consumer of demultiplexed ticks (file writer, preview publisher, meter).
pub trait TickSink {
    /// Short sink name for log messages.
    fn name(&self) -> &str;

    /// Called before the first tick of a buffer.
    fn begin_buffer(&mut self, _info: &BufferInfo) -> Result<()> {
        Ok(())
    }

    /// Consume one tick.
    fn push_tick(&mut self, tick: &Tick<'_>) -> Result<()>;

    /// Called after the last tick of a buffer.
    fn end_buffer(&mut self, _info: &BufferInfo) -> Result<()> {
        Ok(())
    }

    /// Flush and finalize at session end.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_bits() {
        let tick = Tick {
            index: 0,
            binary: 0b101,
            analog: &[],
        };
        assert!(tick.bit(0));
        assert!(!tick.bit(1));
        assert!(tick.bit(2));
    }

    #[test]
    fn test_timestamp_millis() {
        let ts = BufferTimestamp {
            realtime: (2, 500_000_000),
            monotonic: (0, 0),
        };
        assert_eq!(ts.realtime_millis(), 2500);
        let now = BufferTimestamp::capture(Duration::from_millis(1500));
        assert_eq!(now.monotonic, (1, 500_000_000));
        assert!(now.realtime.0 > 0);
    }
}
