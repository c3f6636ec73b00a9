//! Demultiplexing and calibration of raw hardware buffers.
//!
//! A raw buffer (without its sequence counter) is a run of tick records:
//!
//! ```text
//! ┌──────────────┬──────┬──────┬────┬────┬──────┬──────┬────┬────┐
//! │ status (u32) │ I1H  │ I1L  │ V1 │ V2 │ I2H  │ I2L  │ V3 │ V4 │
//! └──────────────┴──────┴──────┴────┴────┴──────┴──────┴────┴────┘
//! ```
//!
//! Samples are little-endian signed integers of 2 bytes (low precision) or
//! 3 bytes (high precision, sign-extended). Every tick is decoded once,
//! calibrated, merged and pushed to all sinks before the next tick.

use daq_core::calibration::{CalibrationSet, CalibrationTable};
use daq_core::channel::{AnalogInput, AnalogSource, BinarySource, ChannelLayout, StatusWord};
use daq_core::geometry::Precision;
use daq_core::limits::{HIGH_LOW_SCALE, STATUS_WORD_BYTES};
use daq_core::pipeline::{BufferInfo, Tick, TickSink};

use crate::error::{CoprocError, Result};

/// Decode one raw sample.
#[inline]
pub fn decode_sample(bytes: &[u8], precision: Precision) -> i32 {
    match precision {
        Precision::Low => i32::from(i16::from_le_bytes([bytes[0], bytes[1]])),
        Precision::High => {
            let raw = u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16;
            ((raw << 8) as i32) >> 8
        }
    }
}

/// Converts raw buffers into calibrated ticks.
pub struct DemuxEngine {
    layout: ChannelLayout,
    calibration: CalibrationSet,
    precision: Precision,
    sample_width: usize,
    record_bytes: usize,
    analog: Vec<i32>,
}

impl DemuxEngine {
    /// Engine for one session.
    pub fn new(layout: ChannelLayout, calibration: &CalibrationTable, precision: Precision) -> Self {
        let sample_width = precision.sample_width();
        let analog = vec![0; layout.analog.len()];
        Self {
            calibration: calibration.for_precision(precision).clone(),
            layout,
            precision,
            sample_width,
            record_bytes: STATUS_WORD_BYTES + AnalogInput::ALL.len() * sample_width,
            analog,
        }
    }

    /// Channel layout the engine produces.
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Bytes of one raw tick record.
    pub fn record_bytes(&self) -> usize {
        self.record_bytes
    }

    /// Whether the low range of current input `current_input` is valid.
    #[inline]
    fn low_range_valid(&self, status: StatusWord, current_input: usize) -> bool {
        !self.layout.force_high[current_input]
            && status.contains(StatusWord::range_valid(current_input))
    }

    #[inline]
    fn raw(&self, record: &[u8], input: AnalogInput) -> i32 {
        let start = STATUS_WORD_BYTES + input.index() * self.sample_width;
        decode_sample(&record[start..start + self.sample_width], self.precision)
    }

    #[inline]
    fn calibrated(&self, record: &[u8], input: AnalogInput) -> i32 {
        self.calibration.apply(input, self.raw(record, input))
    }

    /// Decode `info.samples` ticks of `raw` and push them to every sink.
    ///
    /// Returns the number of ticks delivered. With no enabled channels the
    /// buffer is skipped, but sinks still see its boundaries.
    pub fn process(
        &mut self,
        raw: &[u8],
        info: &BufferInfo,
        sinks: &mut [Box<dyn TickSink + Send>],
    ) -> Result<u32> {
        let samples = info.samples;
        let needed = samples as usize * self.record_bytes;
        if raw.len() < needed {
            return Err(CoprocError::BufferTooShort {
                len: raw.len(),
                samples,
            });
        }

        for sink in sinks.iter_mut() {
            sink.begin_buffer(info)
                .map_err(|e| CoprocError::sink(sink.name(), e))?;
        }

        let delivered = if self.layout.is_empty() {
            0
        } else {
            for (index, record) in raw[..needed].chunks_exact(self.record_bytes).enumerate() {
                let binary = self.decode_record(record);
                let tick = Tick {
                    index: index as u32,
                    binary,
                    analog: &self.analog,
                };
                for sink in sinks.iter_mut() {
                    sink.push_tick(&tick)
                        .map_err(|e| CoprocError::sink(sink.name(), e))?;
                }
            }
            samples
        };

        for sink in sinks.iter_mut() {
            sink.end_buffer(info)
                .map_err(|e| CoprocError::sink(sink.name(), e))?;
        }
        Ok(delivered)
    }

    /// Fill the analog scratch values of one record and return its binary word.
    fn decode_record(&mut self, record: &[u8]) -> u32 {
        let status = StatusWord::from_bits_retain(u32::from_le_bytes([
            record[0], record[1], record[2], record[3],
        ]));

        let mut binary = 0u32;
        for (k, channel) in self.layout.binary.iter().enumerate() {
            let set = match channel.source {
                BinarySource::Digital(bit) => status.contains(bit),
                BinarySource::RangeValid { current_input } => {
                    self.low_range_valid(status, current_input)
                }
            };
            if set {
                binary |= 1 << k;
            }
        }

        for n in 0..self.layout.analog.len() {
            let value = match self.layout.analog[n].source {
                AnalogSource::Direct(input) => self.calibrated(record, input),
                AnalogSource::Merged {
                    high,
                    low,
                    current_input,
                } => {
                    if self.low_range_valid(status, current_input) {
                        self.calibrated(record, low)
                    } else {
                        let scaled = i64::from(self.calibrated(record, high)) * HIGH_LOW_SCALE;
                        scaled.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
                    }
                }
            };
            self.analog[n] = value;
        }
        binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::pipeline::BufferTimestamp;

    #[derive(Default)]
    struct Collect {
        ticks: Vec<(u32, Vec<i32>)>,
        buffers: u32,
    }

    impl TickSink for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        fn push_tick(&mut self, tick: &Tick<'_>) -> anyhow::Result<()> {
            self.ticks.push((tick.binary, tick.analog.to_vec()));
            Ok(())
        }

        fn end_buffer(&mut self, _info: &BufferInfo) -> anyhow::Result<()> {
            self.buffers += 1;
            Ok(())
        }
    }

    struct SharedCollect(std::sync::Arc<parking_lot::Mutex<Collect>>);

    impl TickSink for SharedCollect {
        fn name(&self) -> &str {
            "collect"
        }

        fn push_tick(&mut self, tick: &Tick<'_>) -> anyhow::Result<()> {
            self.0.lock().push_tick(tick)
        }

        fn end_buffer(&mut self, info: &BufferInfo) -> anyhow::Result<()> {
            self.0.lock().end_buffer(info)
        }
    }

    fn record(status: u32, values: [i32; 8], precision: Precision) -> Vec<u8> {
        let mut out = status.to_le_bytes().to_vec();
        for v in values {
            match precision {
                Precision::Low => out.extend_from_slice(&(v as i16).to_le_bytes()),
                Precision::High => out.extend_from_slice(&v.to_le_bytes()[..3]),
            }
        }
        out
    }

    fn info(samples: u32) -> BufferInfo {
        BufferInfo {
            index: 0,
            samples,
            sample_rate: 1000,
            timestamp: BufferTimestamp::default(),
        }
    }

    fn run(
        engine: &mut DemuxEngine,
        raw: &[u8],
        samples: u32,
    ) -> (u32, Vec<(u32, Vec<i32>)>, u32) {
        let shared = std::sync::Arc::new(parking_lot::Mutex::new(Collect::default()));
        let mut sinks: Vec<Box<dyn TickSink + Send>> =
            vec![Box::new(SharedCollect(std::sync::Arc::clone(&shared)))];
        let delivered = engine.process(raw, &info(samples), &mut sinks).unwrap();
        let collect = std::mem::take(&mut *shared.lock());
        (delivered, collect.ticks, collect.buffers)
    }

    #[test]
    fn test_decode_sample_sign_extension() {
        assert_eq!(decode_sample(&[0xFF, 0xFF, 0xFF], Precision::High), -1);
        assert_eq!(decode_sample(&[0x00, 0x00, 0x80], Precision::High), -8_388_608);
        assert_eq!(decode_sample(&[0xFF, 0xFF, 0x7F], Precision::High), 8_388_607);
        assert_eq!(decode_sample(&[0x00, 0x80], Precision::Low), -32768);
        assert_eq!(decode_sample(&[0x34, 0x12], Precision::Low), 0x1234);
    }

    #[test]
    fn test_voltage_calibration() {
        let layout = ChannelLayout::new(&[AnalogInput::V1], false, [false; 2]);
        let mut table = CalibrationTable::identity();
        table.high.offsets[AnalogInput::V1.index()] = 10;
        table.high.scales[AnalogInput::V1.index()] = 2.0;
        let mut engine = DemuxEngine::new(layout, &table, Precision::High);

        let mut raw = record(0, [0, 0, 100, 0, 0, 0, 0, 0], Precision::High);
        raw.extend(record(0, [0, 0, -20, 0, 0, 0, 0, 0], Precision::High));
        let (delivered, ticks, buffers) = run(&mut engine, &raw, 2);
        assert_eq!(delivered, 2);
        assert_eq!(buffers, 1);
        assert_eq!(ticks[0].1, vec![220]);
        assert_eq!(ticks[1].1, vec![-20]);
    }

    #[test]
    fn test_current_merge_uses_low_range_while_valid() {
        let layout = ChannelLayout::new(&[AnalogInput::I1H, AnalogInput::I1L], false, [false; 2]);
        let table = CalibrationTable::identity();
        let mut engine = DemuxEngine::new(layout, &table, Precision::Low);

        let valid = StatusWord::I1L_VALID.bits();
        let mut raw = record(valid, [7, 1234, 0, 0, 0, 0, 0, 0], Precision::Low);
        raw.extend(record(0, [7, 1234, 0, 0, 0, 0, 0, 0], Precision::Low));
        let (_, ticks, _) = run(&mut engine, &raw, 2);

        // binary channel 0 is I1L_valid
        assert_eq!(ticks[0], (1, vec![1234]));
        assert_eq!(ticks[1], (0, vec![7 * HIGH_LOW_SCALE as i32]));
    }

    #[test]
    fn test_force_high_ignores_valid_flag() {
        let layout = ChannelLayout::new(&[AnalogInput::I1H, AnalogInput::I1L], false, [true, false]);
        let table = CalibrationTable::identity();
        let mut engine = DemuxEngine::new(layout, &table, Precision::Low);

        let raw = record(StatusWord::I1L_VALID.bits(), [3, 500, 0, 0, 0, 0, 0, 0], Precision::Low);
        let (_, ticks, _) = run(&mut engine, &raw, 1);
        assert_eq!(ticks[0], (0, vec![300]));
    }

    #[test]
    fn test_digital_inputs() {
        let layout = ChannelLayout::new(&[AnalogInput::V2], true, [false; 2]);
        let table = CalibrationTable::identity();
        let mut engine = DemuxEngine::new(layout, &table, Precision::High);

        let status = (StatusWord::DI1 | StatusWord::DI3 | StatusWord::DI6).bits();
        let raw = record(status, [0, 0, 0, 42, 0, 0, 0, 0], Precision::High);
        let (_, ticks, _) = run(&mut engine, &raw, 1);
        assert_eq!(ticks[0], (0b10_0101, vec![42]));
    }

    #[test]
    fn test_no_channels_skips_ticks() {
        let layout = ChannelLayout::new(&[], false, [false; 2]);
        let table = CalibrationTable::identity();
        let mut engine = DemuxEngine::new(layout, &table, Precision::High);

        let raw = record(0, [1; 8], Precision::High);
        let (delivered, ticks, buffers) = run(&mut engine, &raw, 1);
        assert_eq!(delivered, 0);
        assert!(ticks.is_empty());
        assert_eq!(buffers, 1);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let layout = ChannelLayout::new(&[AnalogInput::V1], false, [false; 2]);
        let table = CalibrationTable::identity();
        let mut engine = DemuxEngine::new(layout, &table, Precision::High);

        let raw = record(0, [0; 8], Precision::High);
        let mut sinks: Vec<Box<dyn TickSink + Send>> = vec![Box::new(Collect::default())];
        let err = engine.process(&raw, &info(2), &mut sinks).unwrap_err();
        assert!(matches!(err, CoprocError::BufferTooShort { samples: 2, .. }));
    }
}
