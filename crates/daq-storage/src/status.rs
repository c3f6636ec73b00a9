//! Shared-memory status record of the sampling session.
//!
//! The record is advisory telemetry: it is overwritten wholesale after every
//! buffer and on each state transition, without any reader/writer locking.
//! Only "is a session currently sampling" is relied upon by other processes,
//! and a record left behind by a crashed session reads as stale but valid.

use anyhow::{Context, Result};
use serde::Serialize;
use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{debug, warn};

use daq_core::config::{FileFormat, SessionConfig, SessionMode};

use crate::segment::{SegmentLayout, SegmentReader, SharedSegment};

/// Size of the status record in bytes.
pub const STATUS_RECORD_SIZE: usize = 192;

/// Bytes reserved for the output file name in the config snapshot.
pub const FILE_NAME_BYTES: usize = 128;

/// Session state as published in the status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session, or the session ended normally.
    Off,
    /// A session is sampling.
    Running,
    /// The last session ended with a fatal error.
    Error,
}

impl SessionState {
    fn code(self) -> i32 {
        match self {
            SessionState::Off => 0,
            SessionState::Running => 1,
            SessionState::Error => -1,
        }
    }

    fn from_code(code: i32) -> Self {
        match code {
            1 => SessionState::Running,
            -1 => SessionState::Error,
            _ => SessionState::Off,
        }
    }
}

/// Configuration snapshot stored in the status record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Update rate in Hz.
    pub update_rate: u32,
    /// Sample limit, 0 when unbounded.
    pub sample_limit: u64,
    /// Enabled analog inputs, bit `n` for hardware input `n`.
    pub channel_mask: u8,
    /// Force-high flags of both current inputs.
    pub force_high: [u8; 2],
    /// Digital inputs recorded.
    pub digital_inputs: u8,
    /// Web preview enabled.
    pub web_enable: u8,
    /// 0 limit, 1 continuous, 2 meter.
    pub mode: u8,
    /// 0 none, 1 csv, 2 binary.
    pub file_format: u8,
    _reserved: u8,
    /// Output file name, zero padded (truncated when longer).
    pub file_name: [u8; FILE_NAME_BYTES],
}

impl ConfigSnapshot {
    /// Capture the published subset of a session configuration.
    pub fn from_session(session: &SessionConfig) -> Self {
        let mut file_name = [0u8; FILE_NAME_BYTES];
        let bytes = session.file_name.as_os_str().as_bytes();
        let len = bytes.len().min(FILE_NAME_BYTES - 1);
        file_name[..len].copy_from_slice(&bytes[..len]);

        Self {
            sample_rate: session.sample_rate,
            update_rate: session.update_rate,
            sample_limit: match session.mode {
                SessionMode::Limit => session.sample_limit,
                _ => 0,
            },
            channel_mask: session.channel_mask(),
            force_high: session.force_high_channels.map(u8::from),
            digital_inputs: u8::from(session.digital_inputs),
            web_enable: u8::from(session.web_enable),
            mode: match session.mode {
                SessionMode::Limit => 0,
                SessionMode::Continuous => 1,
                SessionMode::Meter => 2,
            },
            file_format: match session.file_format() {
                FileFormat::None => 0,
                FileFormat::Csv => 1,
                FileFormat::Binary => 2,
            },
            _reserved: 0,
            file_name,
        }
    }

    /// Output file name as text.
    pub fn file_name(&self) -> String {
        let end = self
            .file_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILE_NAME_BYTES);
        String::from_utf8_lossy(&self.file_name[..end]).into_owned()
    }
}

/// Status record layout.
///
/// Layout (192 bytes total):
/// - state: i32, sampling: u8, padding
/// - samples_taken, buffer_number, disk_free: u64
/// - disk_free_permille: u16, padding
/// - config: ConfigSnapshot (152 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    state: i32,
    sampling: u8,
    _pad0: [u8; 3],
    /// Samples stored so far in this session.
    pub samples_taken: u64,
    /// Buffers stored so far in this session.
    pub buffer_number: u64,
    /// Free bytes on the output file system at session start.
    pub disk_free: u64,
    /// Free space in thousandths of the file system size.
    pub disk_free_permille: u16,
    _pad1: [u8; 6],
    /// Configuration of the session.
    pub config: ConfigSnapshot,
}

const _: () = assert!(
    std::mem::size_of::<StatusRecord>() == STATUS_RECORD_SIZE,
    "StatusRecord size must equal STATUS_RECORD_SIZE (192 bytes)"
);

// SAFETY: repr(C), plain integers only, all-zero is the "off" record.
unsafe impl SegmentLayout for StatusRecord {}

impl StatusRecord {
    /// Fresh record for a session about to start.
    pub fn new(config: ConfigSnapshot, disk: DiskUsage) -> Self {
        Self {
            state: SessionState::Off.code(),
            sampling: 0,
            _pad0: [0; 3],
            samples_taken: 0,
            buffer_number: 0,
            disk_free: disk.free,
            disk_free_permille: disk.free_permille(),
            _pad1: [0; 6],
            config,
        }
    }

    /// Session state.
    pub fn state(&self) -> SessionState {
        SessionState::from_code(self.state)
    }

    /// Set the session state.
    pub fn set_state(&mut self, state: SessionState) {
        self.state = state.code();
    }

    /// Whether a session is sampling.
    pub fn is_sampling(&self) -> bool {
        self.sampling != 0
    }

    /// Set the sampling flag.
    pub fn set_sampling(&mut self, sampling: bool) {
        self.sampling = u8::from(sampling);
    }

    /// Serializable view for status queries.
    pub fn report(&self) -> StatusReport {
        StatusReport {
            state: self.state(),
            sampling: self.is_sampling(),
            samples_taken: self.samples_taken,
            buffer_number: self.buffer_number,
            disk_free: self.disk_free,
            disk_free_permille: self.disk_free_permille,
            sample_rate: self.config.sample_rate,
            update_rate: self.config.update_rate,
            sample_limit: self.config.sample_limit,
            channel_mask: self.config.channel_mask,
            file_name: self.config.file_name(),
        }
    }
}

/// Status record in a form suitable for printing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Session state.
    pub state: SessionState,
    /// Sampling flag.
    pub sampling: bool,
    /// Samples stored.
    pub samples_taken: u64,
    /// Buffers stored.
    pub buffer_number: u64,
    /// Free bytes on the output file system.
    pub disk_free: u64,
    /// Free space in permille.
    pub disk_free_permille: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Update rate in Hz.
    pub update_rate: u32,
    /// Sample limit, 0 when unbounded.
    pub sample_limit: u64,
    /// Enabled analog inputs.
    pub channel_mask: u8,
    /// Output file name.
    pub file_name: String,
}

/// Free and total space of a file system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    /// Bytes available to unprivileged users.
    pub free: u64,
    /// File system size in bytes.
    pub total: u64,
}

impl DiskUsage {
    /// Query the file system containing `path`.
    pub fn for_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let c_path = CString::new(path.as_ref().as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();

        // SAFETY: c_path is NUL terminated and stat points to writable storage.
        #[allow(unsafe_code)]
        let stat = unsafe {
            if libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            stat.assume_init()
        };

        let fragment = stat.f_frsize as u64;
        Ok(Self {
            free: stat.f_bavail as u64 * fragment,
            total: stat.f_blocks as u64 * fragment,
        })
    }

    /// Free space in thousandths of the total.
    pub fn free_permille(&self) -> u16 {
        if self.total == 0 {
            return 0;
        }
        (u128::from(self.free) * 1000 / u128::from(self.total)) as u16
    }
}

/// Writer side of the status segment.
pub struct StatusPublisher {
    segment: SharedSegment<StatusRecord>,
    record: StatusRecord,
}

impl StatusPublisher {
    /// Create or attach the status segment at `path`.
    ///
    /// The record is not modified until the first [`publish`](Self::publish).
    pub fn create_or_attach(path: impl AsRef<Path>) -> Result<Self> {
        let segment = SharedSegment::create_or_attach(path.as_ref())
            .context("Failed to attach status segment")?;
        let record = segment.load();
        Ok(Self { segment, record })
    }

    /// Reset the local record for a new session.
    pub fn reset(&mut self, config: ConfigSnapshot, disk: DiskUsage) {
        self.record = StatusRecord::new(config, disk);
    }

    /// Local copy of the record.
    pub fn record(&self) -> &StatusRecord {
        &self.record
    }

    /// Mutable local copy of the record; changes become visible on publish.
    pub fn record_mut(&mut self) -> &mut StatusRecord {
        &mut self.record
    }

    /// Write the whole record to the segment in one copy.
    pub fn publish(&mut self) {
        self.segment.store(&self.record);
    }
}

/// Read the current status record.
///
/// Returns `Ok(None)` when no segment exists, i.e. no session ever ran.
pub fn read_status(path: impl AsRef<Path>) -> Result<Option<StatusRecord>> {
    match SegmentReader::<StatusRecord>::open(path.as_ref()) {
        Ok(reader) => Ok(Some(reader.load())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context("Failed to read status segment"),
    }
}

/// Whether a session is currently sampling. Read failures count as "no".
pub fn is_sampling(path: impl AsRef<Path>) -> bool {
    match read_status(path) {
        Ok(Some(record)) => record.is_sampling(),
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "Status unreadable, assuming no active session");
            false
        }
    }
}

/// Disk usage of the directory that will hold `file`, zero on failure.
pub fn disk_usage_for_file(file: &Path) -> DiskUsage {
    let dir = match file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    DiskUsage::for_path(dir).unwrap_or_else(|e| {
        debug!(dir = ?dir, error = %e, "Disk usage unavailable");
        DiskUsage::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot() -> ConfigSnapshot {
        let session = SessionConfig {
            file_name: "/data/run.dlog".into(),
            ..SessionConfig::default()
        };
        ConfigSnapshot::from_session(&session)
    }

    #[test]
    fn test_publish_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status");

        let mut publisher = StatusPublisher::create_or_attach(&path).unwrap();
        publisher.reset(snapshot(), DiskUsage { free: 250, total: 1000 });
        publisher.record_mut().set_state(SessionState::Running);
        publisher.record_mut().set_sampling(true);
        publisher.record_mut().samples_taken = 1000;
        publisher.record_mut().buffer_number = 10;
        publisher.publish();

        let record = read_status(&path).unwrap().unwrap();
        assert_eq!(record.state(), SessionState::Running);
        assert!(record.is_sampling());
        assert_eq!(record.samples_taken, 1000);
        assert_eq!(record.disk_free_permille, 250);
        assert_eq!(record.config.file_name(), "/data/run.dlog");
        assert!(is_sampling(&path));

        let report = record.report();
        assert_eq!(report.buffer_number, 10);
        assert_eq!(report.sample_rate, 1000);

        // local edits stay private until the next publish
        publisher.record_mut().set_sampling(false);
        publisher.record_mut().set_state(SessionState::Off);
        assert!(is_sampling(&path));
        publisher.publish();
        assert!(!is_sampling(&path));
        assert_eq!(read_status(&path).unwrap().unwrap().state(), SessionState::Off);
    }

    #[test]
    fn test_missing_segment_means_not_sampling() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent");
        assert!(read_status(&path).unwrap().is_none());
        assert!(!is_sampling(&path));
    }

    #[test]
    fn test_stale_record_survives_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status");
        {
            let mut publisher = StatusPublisher::create_or_attach(&path).unwrap();
            publisher.record_mut().samples_taken = 7;
            publisher.publish();
        }
        let record = read_status(&path).unwrap().unwrap();
        assert!(!record.is_sampling());
        assert_eq!(record.samples_taken, 7);
    }

    #[test]
    fn test_disk_usage() {
        let dir = TempDir::new().unwrap();
        let usage = DiskUsage::for_path(dir.path()).unwrap();
        assert!(usage.total >= usage.free);
        assert!(usage.free_permille() <= 1000);
        assert_eq!(DiskUsage::default().free_permille(), 0);
    }

    #[test]
    fn test_long_file_name_truncated() {
        let session = SessionConfig {
            file_name: "x".repeat(300).into(),
            ..SessionConfig::default()
        };
        let snapshot = ConfigSnapshot::from_session(&session);
        assert_eq!(snapshot.file_name().len(), FILE_NAME_BYTES - 1);
    }
}
