//! Comma separated export.
//!
//! The metadata block and column header are written once when the file is
//! created. Unlike the binary format, the header is never updated as the
//! session progresses: each buffer only flushes its rows, and the sample count
//! of a CSV export is only known by counting them.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

use daq_core::channel::{ChannelLayout, Unit};
use daq_core::pipeline::{BufferInfo, Tick, TickSink};

use crate::file_header::FileHeader;

/// Writes ticks as CSV rows.
pub struct CsvFileWriter {
    path: PathBuf,
    writer: csv::Writer<BufWriter<File>>,
    binary_count: usize,
    row: Vec<String>,
    buffer_time: f64,
    sample_period: f64,
    rows: u64,
}

fn column_name(name: &str, unit: Unit, scale: i32) -> String {
    match unit {
        Unit::Voltage | Unit::Current => format!("{} [1e{} {}]", name, scale, unit.symbol()),
        Unit::Binary | Unit::RangeValid => name.to_string(),
    }
}

impl CsvFileWriter {
    /// Create the file and write metadata plus the column header.
    pub fn create(path: impl AsRef<Path>, header: &FileHeader, layout: &ChannelLayout) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file =
            File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;
        let mut out = BufWriter::new(file);

        let lead = &header.lead_in;
        writeln!(out, "# start_time: {}.{:09}", lead.start_time.0, lead.start_time.1)?;
        writeln!(out, "# sample_rate: {}", lead.sample_rate)?;
        writeln!(out, "# sample_limit: {}", lead.sample_limit)?;
        writeln!(out, "# block_size: {}", lead.data_block_size)?;
        if !header.comment.is_empty() {
            for line in header.comment.lines() {
                writeln!(out, "# comment: {}", line)?;
            }
        }

        let mut writer = csv::WriterBuilder::new().from_writer(out);
        let mut columns = vec!["time".to_string()];
        columns.extend(layout.binary.iter().map(|ch| column_name(&ch.name, ch.unit, 0)));
        columns.extend(
            layout
                .analog
                .iter()
                .map(|ch| column_name(&ch.name, ch.unit, ch.scale)),
        );
        writer.write_record(&columns)?;
        writer.flush()?;

        info!(path = ?path, columns = columns.len(), "Created CSV export");

        Ok(Self {
            path,
            writer,
            binary_count: layout.binary.len(),
            row: Vec::with_capacity(columns.len()),
            buffer_time: 0.0,
            sample_period: 1.0 / f64::from(lead.sample_rate.max(1)),
            rows: 0,
        })
    }

    /// Path of the export.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl TickSink for CsvFileWriter {
    fn name(&self) -> &str {
        "csv"
    }

    fn begin_buffer(&mut self, info: &BufferInfo) -> Result<()> {
        let (secs, nanos) = info.timestamp.realtime;
        self.buffer_time = secs as f64 + nanos as f64 * 1e-9;
        Ok(())
    }

    fn push_tick(&mut self, tick: &Tick<'_>) -> Result<()> {
        self.row.clear();
        let time = self.buffer_time + f64::from(tick.index) * self.sample_period;
        self.row.push(format!("{:.6}", time));
        for k in 0..self.binary_count {
            self.row.push(u8::from(tick.bit(k)).to_string());
        }
        for value in tick.analog {
            self.row.push(value.to_string());
        }
        self.writer.write_record(&self.row)?;
        self.rows += 1;
        Ok(())
    }

    fn end_buffer(&mut self, info: &BufferInfo) -> Result<()> {
        self.writer.flush()?;
        trace!(buffer = info.index, rows = self.rows, "Flushed CSV rows");
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        debug!(path = ?self.path, rows = self.rows, "Finalized CSV export");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use daq_core::channel::AnalogInput;
    use daq_core::geometry::BufferGeometry;
    use daq_core::pipeline::BufferTimestamp;
    use tempfile::TempDir;

    #[test]
    fn test_csv_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.csv");

        let layout = ChannelLayout::new(&[AnalogInput::V1, AnalogInput::I1L], false, [false; 2]);
        let geometry = BufferGeometry::new(10, 1, 0).unwrap();
        let header = FileHeader::build(&layout, &geometry, "two\nlines", Utc::now()).unwrap();
        let mut writer = CsvFileWriter::create(&path, &header, &layout).unwrap();

        let info = BufferInfo {
            index: 0,
            samples: 2,
            sample_rate: 10,
            timestamp: BufferTimestamp {
                realtime: (100, 0),
                monotonic: (0, 0),
            },
        };
        writer.begin_buffer(&info).unwrap();
        writer
            .push_tick(&Tick { index: 0, binary: 1, analog: &[5, 6] })
            .unwrap();
        writer
            .push_tick(&Tick { index: 1, binary: 0, analog: &[7, 8] })
            .unwrap();
        writer.end_buffer(&info).unwrap();

        // rows of a completed buffer are on disk before the session ends
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("100.100000,0,7,8\n"));

        writer.finish().unwrap();
        assert_eq!(writer.rows(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert!(lines.contains(&"# comment: two"));
        assert!(lines.contains(&"# sample_rate: 10"));
        assert_eq!(lines[lines.len() - 3], "time,I1L_valid,I1L [1e-11 A],V1 [1e-8 V]");
        assert_eq!(lines[lines.len() - 2], "100.000000,1,5,6");
        assert_eq!(lines[lines.len() - 1], "100.100000,0,7,8");
    }
}
