//! Live meter output.
//!
//! Prints the last tick of every buffer as a small table, one line per
//! channel, in physical units.

use std::io::Write;

use anyhow::Result;

use daq_core::channel::{ChannelLayout, Unit};
use daq_core::pipeline::{BufferInfo, Tick, TickSink};

struct MeterRow {
    name: String,
    unit: Unit,
    factor: f64,
}

/// Tick sink printing a live reading per buffer.
pub struct LiveMeter<W: Write + Send> {
    out: W,
    binary: Vec<String>,
    analog: Vec<MeterRow>,
    last_binary: u32,
    last_analog: Vec<i32>,
    has_tick: bool,
}

impl<W: Write + Send> LiveMeter<W> {
    /// Meter for `layout` writing to `out`.
    pub fn new(layout: &ChannelLayout, out: W) -> Self {
        Self {
            out,
            binary: layout.binary.iter().map(|ch| ch.name.clone()).collect(),
            analog: layout
                .analog
                .iter()
                .map(|ch| MeterRow {
                    name: ch.name.clone(),
                    unit: ch.unit,
                    factor: 10f64.powi(ch.scale),
                })
                .collect(),
            last_binary: 0,
            last_analog: vec![0; layout.analog.len()],
            has_tick: false,
        }
    }

    /// Consume the meter and return its writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> TickSink for LiveMeter<W> {
    fn name(&self) -> &str {
        "meter"
    }

    fn begin_buffer(&mut self, _info: &BufferInfo) -> Result<()> {
        self.has_tick = false;
        Ok(())
    }

    fn push_tick(&mut self, tick: &Tick<'_>) -> Result<()> {
        self.last_binary = tick.binary;
        self.last_analog.copy_from_slice(tick.analog);
        self.has_tick = true;
        Ok(())
    }

    fn end_buffer(&mut self, info: &BufferInfo) -> Result<()> {
        if !self.has_tick {
            return Ok(());
        }
        writeln!(self.out, "buffer {} @ {} Hz", info.index, info.sample_rate)?;
        for (row, value) in self.analog.iter().zip(&self.last_analog) {
            writeln!(
                self.out,
                "  {:<10} {:>16.9} {}",
                row.name,
                f64::from(*value) * row.factor,
                row.unit.symbol()
            )?;
        }
        for (k, name) in self.binary.iter().enumerate() {
            writeln!(self.out, "  {:<10} {:>16}", name, (self.last_binary >> k) & 1)?;
        }
        self.out.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::channel::AnalogInput;
    use daq_core::pipeline::BufferTimestamp;

    #[test]
    fn test_prints_last_tick() {
        let layout = ChannelLayout::new(&[AnalogInput::V1, AnalogInput::I1L], false, [false; 2]);
        let mut meter = LiveMeter::new(&layout, Vec::new());
        let info = BufferInfo {
            index: 4,
            samples: 2,
            sample_rate: 100,
            timestamp: BufferTimestamp::default(),
        };

        meter.begin_buffer(&info).unwrap();
        meter
            .push_tick(&Tick { index: 0, binary: 0, analog: &[1, 1] })
            .unwrap();
        meter
            .push_tick(&Tick { index: 1, binary: 1, analog: &[100_000_000, 200] })
            .unwrap();
        meter.end_buffer(&info).unwrap();

        let text = String::from_utf8(meter.into_inner()).unwrap();
        assert!(text.starts_with("buffer 4 @ 100 Hz\n"));
        assert!(text.contains("0.001000000 A"));
        assert!(text.contains("0.000002000 V"));
        assert!(text.contains("I1L_valid"));
    }
}
