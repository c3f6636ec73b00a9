//! Logger configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DAQ_LOGGER_`, nested keys separated
//!    by a double underscore (`DAQ_LOGGER_SESSION__SAMPLE_RATE=2000`)
//!
//! # Example
//! ```no_run
//! use daq_core::config::LoggerConfig;
//!
//! let config = LoggerConfig::load_from("logger.toml")?;
//! config.validate()?;
//! println!("sampling at {} Hz", config.session.sample_rate);
//! # Ok::<(), daq_core::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::calibration::CalibrationTable;
use crate::channel::{AnalogInput, ChannelLayout};
use crate::error::DaqError;
use crate::geometry::BufferGeometry;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "DAQ_LOGGER_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Acquisition session settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Shared segment locations
    #[serde(default)]
    pub segments: SegmentConfig,
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Inline calibration table (identity when omitted)
    #[serde(default)]
    pub calibration: CalibrationTable,
}

/// How a session terminates and what it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Stop after `sample_limit` samples.
    Limit,
    /// Run until stopped.
    Continuous,
    /// Run until stopped, printing a live meter instead of writing a file.
    Meter,
}

/// Output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// No file output.
    None,
    /// Comma separated text.
    Csv,
    /// Self-describing binary format with live header.
    Binary,
}

/// Acquisition session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Termination mode
    #[serde(default = "default_mode")]
    pub mode: SessionMode,
    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Buffers per second
    #[serde(default = "default_update_rate")]
    pub update_rate: u32,
    /// Samples to record in limit mode
    #[serde(default)]
    pub sample_limit: u64,
    /// Enabled analog inputs
    #[serde(default = "default_channels")]
    pub channels: Vec<AnalogInput>,
    /// Force current input 1/2 onto its high range
    #[serde(default)]
    pub force_high_channels: [bool; 2],
    /// Record the six digital inputs
    #[serde(default = "default_true")]
    pub digital_inputs: bool,
    /// Publish the web preview segment
    #[serde(default)]
    pub web_enable: bool,
    /// Output file format
    #[serde(default = "default_file_format")]
    pub file_format: FileFormat,
    /// Output file path
    #[serde(default = "default_file_name")]
    pub file_name: PathBuf,
    /// Free text stored in the file header
    #[serde(default)]
    pub comment: String,
}

/// Locations of the cross-process resources of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Backing file of the status segment
    #[serde(default = "default_status_path")]
    pub status_path: PathBuf,
    /// Backing file of the web preview segment
    #[serde(default = "default_web_path")]
    pub web_path: PathBuf,
    /// SysV IPC key of the preview semaphore set
    #[serde(default = "default_semaphore_key")]
    pub semaphore_key: i32,
    /// PID file of the running session
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

/// Log output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_mode() -> SessionMode {
    SessionMode::Continuous
}

fn default_sample_rate() -> u32 {
    1000
}

fn default_update_rate() -> u32 {
    1
}

fn default_channels() -> Vec<AnalogInput> {
    AnalogInput::ALL.to_vec()
}

fn default_true() -> bool {
    true
}

fn default_file_format() -> FileFormat {
    FileFormat::Binary
}

fn default_file_name() -> PathBuf {
    PathBuf::from("data.dlog")
}

fn default_status_path() -> PathBuf {
    PathBuf::from("/dev/shm/daq-logger.status")
}

fn default_web_path() -> PathBuf {
    PathBuf::from("/dev/shm/daq-logger.web")
}

fn default_semaphore_key() -> i32 {
    0x0D1A_0001
}

fn default_pid_file() -> PathBuf {
    std::env::temp_dir().join("daq-logger.pid")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            sample_rate: default_sample_rate(),
            update_rate: default_update_rate(),
            sample_limit: 0,
            channels: default_channels(),
            force_high_channels: [false; 2],
            digital_inputs: true,
            web_enable: false,
            file_format: default_file_format(),
            file_name: default_file_name(),
            comment: String::new(),
        }
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            status_path: default_status_path(),
            web_path: default_web_path(),
            semaphore_key: default_semaphore_key(),
            pid_file: default_pid_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggerConfig {
    /// Load configuration from a TOML file and environment variables.
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, DaqError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = ?path, "No configuration file, using defaults and environment");
        }
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        debug!(
            path = ?path,
            mode = ?config.session.mode,
            sample_rate = config.session.sample_rate,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(text: &str) -> Result<Self, DaqError> {
        Ok(Figment::new().merge(Toml::string(text)).extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), DaqError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }
        self.calibration.validate()?;
        self.session.validate()
    }

    /// Template configuration file with every default spelled out.
    pub fn template() -> Result<String, DaqError> {
        toml::to_string_pretty(&LoggerConfig::default())
            .map_err(|e| DaqError::Configuration(format!("Cannot render template: {}", e)))
    }
}

impl SessionConfig {
    /// Reject configurations the hardware cannot run.
    pub fn validate(&self) -> Result<(), DaqError> {
        self.geometry()?;

        if self.mode == SessionMode::Limit && self.sample_limit == 0 {
            return Err(DaqError::Configuration(
                "Limit mode requires a sample_limit greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for input in &self.channels {
            if !seen.insert(input) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate channel: {}",
                    input.name()
                )));
            }
        }

        if self.file_format() != FileFormat::None && self.file_name.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "A file name is required when file output is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Buffer sizing for this session.
    pub fn geometry(&self) -> Result<BufferGeometry, DaqError> {
        let limit = match self.mode {
            SessionMode::Limit => self.sample_limit,
            SessionMode::Continuous | SessionMode::Meter => 0,
        };
        BufferGeometry::new(self.sample_rate, self.update_rate, limit)
    }

    /// Logical channel layout for this session.
    pub fn layout(&self) -> ChannelLayout {
        ChannelLayout::new(&self.channels, self.digital_inputs, self.force_high_channels)
    }

    /// Effective file format. Meter sessions never write a file.
    pub fn file_format(&self) -> FileFormat {
        match self.mode {
            SessionMode::Meter => FileFormat::None,
            _ => self.file_format,
        }
    }

    /// Bitmask of enabled analog inputs, bit `n` for hardware input `n`.
    pub fn channel_mask(&self) -> u8 {
        self.channels
            .iter()
            .fold(0u8, |mask, input| mask | (1 << input.index()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [session]
        mode = "limit"
        sample_rate = 1000
        update_rate = 10
        sample_limit = 5000
        channels = ["V1", "V2", "I1H", "I1L"]
        web_enable = true
        file_format = "csv"
        file_name = "/tmp/run.csv"

        [logging]
        level = "debug"
    "#;

    #[test]
    fn test_parse_config() {
        let config = LoggerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.session.mode, SessionMode::Limit);
        assert_eq!(config.session.channels.len(), 4);
        assert_eq!(config.session.file_format(), FileFormat::Csv);
        assert!(config.session.digital_inputs);
        assert_eq!(config.segments, SegmentConfig::default());
        assert!(config.validate().is_ok());

        let geometry = config.session.geometry().unwrap();
        assert_eq!(geometry.buffer_size, 100);
        assert_eq!(geometry.number_buffers, Some(50));
    }

    #[test]
    fn test_config_validation() {
        let mut config = LoggerConfig::default();
        assert!(config.validate().is_ok());

        config.session.sample_rate = 1234;
        assert!(config.validate().unwrap_err().is_configuration());

        config.session.sample_rate = 1000;
        config.session.mode = SessionMode::Limit;
        assert!(config.validate().is_err());

        config.session.sample_limit = 10;
        config.session.channels = vec![AnalogInput::V1, AnalogInput::V1];
        assert!(config.validate().is_err());

        config.session.channels = vec![AnalogInput::V1];
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_meter_mode_disables_file() {
        let session = SessionConfig {
            mode: SessionMode::Meter,
            sample_limit: 100,
            ..SessionConfig::default()
        };
        assert_eq!(session.file_format(), FileFormat::None);
        assert_eq!(session.geometry().unwrap().number_buffers, None);
    }

    #[test]
    fn test_channel_mask() {
        let session = SessionConfig {
            channels: vec![AnalogInput::I1H, AnalogInput::V4],
            ..SessionConfig::default()
        };
        assert_eq!(session.channel_mask(), 0b1000_0001);
    }

    #[test]
    fn test_template_round_trip() {
        let text = LoggerConfig::template().unwrap();
        let parsed = LoggerConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, LoggerConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        std::env::set_var("DAQ_LOGGER_SESSION__SAMPLE_RATE", "2000");
        let config = LoggerConfig::load_from(file.path());
        std::env::remove_var("DAQ_LOGGER_SESSION__SAMPLE_RATE");

        let config = config.unwrap();
        assert_eq!(config.session.sample_rate, 2000);
        assert_eq!(config.session.update_rate, 10);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = LoggerConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, LoggerConfig::default());
        assert_eq!(config.session.sample_rate, 1000);

        std::env::set_var("DAQ_LOGGER_SEGMENTS__STATUS_PATH", "/tmp/elsewhere.status");
        let config = LoggerConfig::load_from(dir.path().join("absent.toml"));
        std::env::remove_var("DAQ_LOGGER_SEGMENTS__STATUS_PATH");

        let config = config.unwrap();
        assert_eq!(
            config.segments.status_path,
            PathBuf::from("/tmp/elsewhere.status")
        );
        assert_eq!(config.session, SessionConfig::default());
    }
}
