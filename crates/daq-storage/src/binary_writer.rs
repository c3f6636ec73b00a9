//! Binary recording writer.
//!
//! Writes the header once, then one data block per hardware buffer. After
//! every block the lead-in counters are rewritten in place (see
//! [`update_counters`]), keeping the file a valid, playable recording at all
//! times, including after a crash mid-session.
//!
//! # Example
//!
//! ```no_run
//! use daq_core::{ChannelLayout, AnalogInput, BufferGeometry};
//! use daq_storage::binary_writer::BinaryFileWriter;
//! use daq_storage::file_header::FileHeader;
//!
//! # fn main() -> anyhow::Result<()> {
//! let layout = ChannelLayout::new(&[AnalogInput::V1], false, [false; 2]);
//! let geometry = BufferGeometry::new(1000, 10, 0)?;
//! let header = FileHeader::build(&layout, &geometry, "", chrono::Utc::now())?;
//! let writer = BinaryFileWriter::create("run.dlog", header)?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use daq_core::pipeline::{BufferInfo, Tick, TickSink};

use crate::file_header::{update_counters, FileHeader};

/// Counters of a recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Data blocks written and counted in the header.
    pub data_block_count: u32,
    /// Samples written and counted in the header.
    pub sample_count: u64,
    /// Bytes written including the header.
    pub bytes_written: u64,
}

/// Writes a binary recording.
pub struct BinaryFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    header: FileHeader,
    block: BytesMut,
    stats: WriterStats,
    finished: bool,
}

impl BinaryFileWriter {
    /// Create the file and write its header.
    pub fn create(path: impl AsRef<Path>, header: FileHeader) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file =
            File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;
        let mut writer = BufWriter::new(file);
        header.write(&mut writer)?;
        writer.flush()?;

        info!(
            path = ?path,
            channels = header.channels.len(),
            block_size = header.lead_in.data_block_size,
            "Created binary recording"
        );

        let stats = WriterStats {
            bytes_written: u64::from(header.lead_in.header_length),
            ..WriterStats::default()
        };
        let block = BytesMut::with_capacity(header.block_size(header.lead_in.data_block_size as usize));

        Ok(Self {
            path,
            writer,
            header,
            block,
            stats,
            finished: false,
        })
    }

    /// Path of the recording.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header as written (counters reflect the last update).
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Current counters.
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Rewrite the lead-in counters with the current totals.
    pub fn update(&mut self) -> Result<()> {
        update_counters(
            &mut self.writer,
            self.stats.data_block_count,
            self.stats.sample_count,
        )
        .with_context(|| format!("Failed to update header of {:?}", self.path))?;
        self.writer.flush()?;
        self.header.lead_in.data_block_count = self.stats.data_block_count;
        self.header.lead_in.sample_count = self.stats.sample_count;
        Ok(())
    }
}

impl TickSink for BinaryFileWriter {
    fn name(&self) -> &str {
        "binary"
    }

    fn begin_buffer(&mut self, info: &BufferInfo) -> Result<()> {
        self.block.clear();
        self.block.put_i64_le(info.timestamp.realtime.0);
        self.block.put_i64_le(info.timestamp.realtime.1);
        self.block.put_i64_le(info.timestamp.monotonic.0);
        self.block.put_i64_le(info.timestamp.monotonic.1);
        Ok(())
    }

    fn push_tick(&mut self, tick: &Tick<'_>) -> Result<()> {
        if self.header.has_binary() {
            self.block.put_u32_le(tick.binary);
        }
        for value in tick.analog {
            self.block.put_i32_le(*value);
        }
        Ok(())
    }

    fn end_buffer(&mut self, info: &BufferInfo) -> Result<()> {
        self.writer
            .write_all(&self.block)
            .with_context(|| format!("Failed to write block to {:?}", self.path))?;
        self.stats.bytes_written += self.block.len() as u64;
        self.stats.data_block_count += 1;
        self.stats.sample_count += u64::from(info.samples);
        self.update()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.update()?;
        self.writer.get_ref().sync_all()?;
        self.finished = true;
        debug!(
            path = ?self.path,
            samples = self.stats.sample_count,
            blocks = self.stats.data_block_count,
            "Finalized binary recording"
        );
        Ok(())
    }
}
