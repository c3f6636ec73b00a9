//! Binary recording header.
//!
//! A recording starts with a fixed 64-byte lead-in, followed by the session
//! comment (zero padded to four bytes) and one 36-byte descriptor per logical
//! channel. All integers are little endian.
//!
//! ```text
//! off  field                       type
//!   0  magic "DLOG"                [u8; 4]
//!   4  version                     u16
//!   6  header length               u16
//!   8  data block size (samples)   u32
//!  12  data block count            u32   <- rewritten after every block
//!  16  sample count                u64   <- rewritten after every block
//!  24  sample rate (Hz)            u32
//!  28  comment length (padded)     u32
//!  32  sample limit                u64
//!  40  start time seconds          i64
//!  48  start time nanoseconds      i64
//!  56  binary channel count        u16
//!  58  analog channel count        u16
//!  60  reserved                    u32
//! ```
//!
//! The two counters are the only fields that change after the header is
//! written, so a file cut off at any point is still a valid recording of the
//! blocks counted in its header.

use anyhow::{bail, ensure, Context, Result};
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use daq_core::channel::{ChannelLayout, Unit};
use daq_core::geometry::BufferGeometry;

/// File format tag.
pub const MAGIC: [u8; 4] = *b"DLOG";
/// Current format version.
pub const VERSION: u16 = 1;
/// Size of the lead-in record.
pub const LEAD_IN_SIZE: usize = 64;
/// Size of one channel descriptor.
pub const DESCRIPTOR_SIZE: usize = 36;
/// Bytes reserved for a channel name.
pub const NAME_BYTES: usize = 24;
/// File offset of the mutable counters (block count, then sample count).
pub const COUNTERS_OFFSET: u64 = 12;
/// Valid-data link meaning "no link".
pub const NO_VALID_CHANNEL: u16 = 0xFFFF;
/// Bytes of the realtime + monotonic timestamps heading each data block.
pub const BLOCK_TIMESTAMP_SIZE: usize = 32;
/// Longest accepted comment.
pub const MAX_COMMENT_BYTES: usize = 4096;

/// Fixed lead-in of a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadIn {
    /// Format version.
    pub version: u16,
    /// Total header bytes (lead-in, comment and descriptors).
    pub header_length: u16,
    /// Samples per full data block.
    pub data_block_size: u32,
    /// Data blocks stored so far.
    pub data_block_count: u32,
    /// Samples stored so far.
    pub sample_count: u64,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Padded comment length in bytes.
    pub comment_length: u32,
    /// Requested sample count, 0 for unbounded sessions.
    pub sample_limit: u64,
    /// Session start (seconds, nanoseconds since the UNIX epoch).
    pub start_time: (i64, i64),
    /// Number of binary channels.
    pub binary_channel_count: u16,
    /// Number of analog channels.
    pub analog_channel_count: u16,
}

/// One channel descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    /// Channel name (at most 24 bytes).
    pub name: String,
    /// Unit of the stored values.
    pub unit: Unit,
    /// Power-of-ten exponent of one stored count.
    pub scale: i32,
    /// Bytes per value in a data block, 0 for packed binary channels.
    pub data_size: u16,
    /// Binary channel flagging this channel's range validity.
    pub valid_channel: Option<u16>,
}

/// Complete header of a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Lead-in record.
    pub lead_in: LeadIn,
    /// Free text comment.
    pub comment: String,
    /// Binary channel descriptors followed by analog ones.
    pub channels: Vec<ChannelDescriptor>,
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}

impl FileHeader {
    /// Derive the header of a new recording from the session layout.
    pub fn build(
        layout: &ChannelLayout,
        geometry: &BufferGeometry,
        comment: &str,
        start: DateTime<Utc>,
    ) -> Result<Self> {
        ensure!(
            comment.len() <= MAX_COMMENT_BYTES,
            "Comment too long: {} bytes (max {})",
            comment.len(),
            MAX_COMMENT_BYTES
        );

        let mut channels = Vec::with_capacity(layout.channel_count());
        for ch in &layout.binary {
            channels.push(ChannelDescriptor {
                name: ch.name.clone(),
                unit: ch.unit,
                scale: 0,
                data_size: 0,
                valid_channel: None,
            });
        }
        for ch in &layout.analog {
            channels.push(ChannelDescriptor {
                name: ch.name.clone(),
                unit: ch.unit,
                scale: ch.scale,
                data_size: 4,
                valid_channel: ch.valid_channel.map(|i| i as u16),
            });
        }
        for ch in &channels {
            ensure!(
                ch.name.len() <= NAME_BYTES,
                "Channel name too long: {}",
                ch.name
            );
        }

        let comment_length = padded_len(comment.len());
        let header_length = LEAD_IN_SIZE + comment_length + channels.len() * DESCRIPTOR_SIZE;

        Ok(Self {
            lead_in: LeadIn {
                version: VERSION,
                header_length: u16::try_from(header_length).context("Header too large")?,
                data_block_size: geometry.buffer_size,
                data_block_count: 0,
                sample_count: 0,
                sample_rate: geometry.sample_rate,
                comment_length: comment_length as u32,
                sample_limit: geometry.sample_limit,
                start_time: (start.timestamp(), i64::from(start.timestamp_subsec_nanos())),
                binary_channel_count: layout.binary.len() as u16,
                analog_channel_count: layout.analog.len() as u16,
            },
            comment: comment.to_string(),
            channels,
        })
    }

    /// Whether data blocks carry a packed binary word per tick.
    pub fn has_binary(&self) -> bool {
        self.lead_in.binary_channel_count > 0
    }

    /// Bytes of one stored tick.
    pub fn tick_size(&self) -> usize {
        let binary = if self.has_binary() { 4 } else { 0 };
        binary + 4 * usize::from(self.lead_in.analog_channel_count)
    }

    /// Bytes of a data block holding `samples` ticks.
    pub fn block_size(&self, samples: usize) -> usize {
        BLOCK_TIMESTAMP_SIZE + samples * self.tick_size()
    }

    /// Serialize the full header.
    pub fn encode(&self) -> BytesMut {
        let lead = &self.lead_in;
        let mut buf = BytesMut::with_capacity(usize::from(lead.header_length));

        buf.put_slice(&MAGIC);
        buf.put_u16_le(lead.version);
        buf.put_u16_le(lead.header_length);
        buf.put_u32_le(lead.data_block_size);
        buf.put_u32_le(lead.data_block_count);
        buf.put_u64_le(lead.sample_count);
        buf.put_u32_le(lead.sample_rate);
        buf.put_u32_le(lead.comment_length);
        buf.put_u64_le(lead.sample_limit);
        buf.put_i64_le(lead.start_time.0);
        buf.put_i64_le(lead.start_time.1);
        buf.put_u16_le(lead.binary_channel_count);
        buf.put_u16_le(lead.analog_channel_count);
        buf.put_u32_le(0);

        buf.put_slice(self.comment.as_bytes());
        buf.put_bytes(0, lead.comment_length as usize - self.comment.len());

        for ch in &self.channels {
            buf.put_u32_le(ch.unit.code());
            buf.put_i32_le(ch.scale);
            buf.put_u16_le(ch.data_size);
            buf.put_u16_le(ch.valid_channel.unwrap_or(NO_VALID_CHANNEL));
            let mut name = [0u8; NAME_BYTES];
            let len = ch.name.len().min(NAME_BYTES);
            name[..len].copy_from_slice(&ch.name.as_bytes()[..len]);
            buf.put_slice(&name);
        }

        buf
    }

    /// Parse a header from the start of `bytes`.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= LEAD_IN_SIZE, "Truncated lead-in");

        let mut magic = [0u8; 4];
        bytes.copy_to_slice(&mut magic);
        if magic != MAGIC {
            bail!("Invalid magic {:?}", magic);
        }

        let version = bytes.get_u16_le();
        ensure!(version == VERSION, "Unsupported version {}", version);
        let header_length = bytes.get_u16_le();
        let data_block_size = bytes.get_u32_le();
        let data_block_count = bytes.get_u32_le();
        let sample_count = bytes.get_u64_le();
        let sample_rate = bytes.get_u32_le();
        let comment_length = bytes.get_u32_le();
        let sample_limit = bytes.get_u64_le();
        let start_time = (bytes.get_i64_le(), bytes.get_i64_le());
        let binary_channel_count = bytes.get_u16_le();
        let analog_channel_count = bytes.get_u16_le();
        let _reserved = bytes.get_u32_le();

        let channel_count = usize::from(binary_channel_count) + usize::from(analog_channel_count);
        let expected = comment_length as usize + channel_count * DESCRIPTOR_SIZE;
        ensure!(
            usize::from(header_length) == LEAD_IN_SIZE + expected,
            "Header length {} does not match its content",
            header_length
        );
        ensure!(bytes.len() >= expected, "Truncated header");

        let comment_raw = &bytes[..comment_length as usize];
        let end = comment_raw
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(comment_raw.len());
        let comment = String::from_utf8_lossy(&comment_raw[..end]).into_owned();
        bytes.advance(comment_length as usize);

        let mut channels = Vec::with_capacity(channel_count);
        for _ in 0..channel_count {
            let code = bytes.get_u32_le();
            let unit = Unit::from_code(code)
                .with_context(|| format!("Unknown unit code {}", code))?;
            let scale = bytes.get_i32_le();
            let data_size = bytes.get_u16_le();
            let valid = bytes.get_u16_le();
            let mut name = [0u8; NAME_BYTES];
            bytes.copy_to_slice(&mut name);
            let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_BYTES);
            channels.push(ChannelDescriptor {
                name: String::from_utf8_lossy(&name[..end]).into_owned(),
                unit,
                scale,
                data_size,
                valid_channel: (valid != NO_VALID_CHANNEL).then_some(valid),
            });
        }

        Ok(Self {
            lead_in: LeadIn {
                version,
                header_length,
                data_block_size,
                data_block_count,
                sample_count,
                sample_rate,
                comment_length,
                sample_limit,
                start_time,
                binary_channel_count,
                analog_channel_count,
            },
            comment,
            channels,
        })
    }

    /// Read the header of the recording at `path`.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open {:?}", path.as_ref()))?;
        let mut lead = [0u8; LEAD_IN_SIZE];
        file.read_exact(&mut lead).context("Truncated lead-in")?;
        let header_length = usize::from(u16::from_le_bytes([lead[6], lead[7]]));
        ensure!(header_length >= LEAD_IN_SIZE, "Invalid header length");

        let mut bytes = lead.to_vec();
        bytes.resize(header_length, 0);
        file.read_exact(&mut bytes[LEAD_IN_SIZE..])
            .context("Truncated header")?;
        Self::decode(&bytes)
    }

    /// One-time write of the full header at the current position.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer
            .write_all(&self.encode())
            .context("Failed to write file header")
    }
}

/// Rewrite the block and sample counters in place, then return to the end.
pub fn update_counters<W: Write + Seek>(
    writer: &mut W,
    data_block_count: u32,
    sample_count: u64,
) -> Result<()> {
    let mut counters = [0u8; 12];
    counters[..4].copy_from_slice(&data_block_count.to_le_bytes());
    counters[4..].copy_from_slice(&sample_count.to_le_bytes());

    writer.seek(SeekFrom::Start(COUNTERS_OFFSET))?;
    writer.write_all(&counters)?;
    writer.seek(SeekFrom::End(0))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::channel::AnalogInput;
    use std::io::Cursor;

    fn header() -> FileHeader {
        let layout = ChannelLayout::new(&AnalogInput::ALL, true, [false; 2]);
        let geometry = BufferGeometry::new(1000, 10, 2500).unwrap();
        FileHeader::build(&layout, &geometry, "bench run", Utc::now()).unwrap()
    }

    #[test]
    fn test_build() {
        let header = header();
        assert_eq!(header.lead_in.data_block_size, 100);
        assert_eq!(header.lead_in.binary_channel_count, 8);
        assert_eq!(header.lead_in.analog_channel_count, 6);
        assert_eq!(header.lead_in.comment_length, 12);
        assert_eq!(
            usize::from(header.lead_in.header_length),
            LEAD_IN_SIZE + 12 + 14 * DESCRIPTOR_SIZE
        );
        assert_eq!(header.tick_size(), 4 + 6 * 4);

        let i1 = &header.channels[8];
        assert_eq!(i1.name, "I1");
        assert_eq!(i1.valid_channel, Some(6));
        assert_eq!(header.channels[6].name, "I1L_valid");
    }

    #[test]
    fn test_encode_decode() {
        let header = header();
        let bytes = header.encode();
        assert_eq!(bytes.len(), usize::from(header.lead_in.header_length));
        assert_eq!(&bytes[..4], b"DLOG");

        let decoded = FileHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_update_counters_in_place() {
        let header = header();
        let mut cursor = Cursor::new(Vec::new());
        header.write(&mut cursor).unwrap();
        cursor.write_all(&[0xAA; 40]).unwrap();

        update_counters(&mut cursor, 3, 250).unwrap();
        update_counters(&mut cursor, 4, 300).unwrap();
        assert_eq!(cursor.position() as usize, cursor.get_ref().len());

        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), usize::from(header.lead_in.header_length) + 40);
        let decoded = FileHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.lead_in.data_block_count, 4);
        assert_eq!(decoded.lead_in.sample_count, 300);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = header().encode();
        bytes[0] = b'X';
        assert!(FileHeader::decode(&bytes).is_err());
        assert!(FileHeader::decode(&bytes[..10]).is_err());
    }
}
