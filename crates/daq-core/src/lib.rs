//! `daq-core`
//!
//! Core types shared by the data logger crates: the error taxonomy, session
//! configuration, the channel model and calibration table, buffer sizing, and
//! the tick sink trait that connects the demux engine to its consumers.
//!
//! ## Key Types
//!
//! - [`config::LoggerConfig`]: figment-loaded configuration (TOML + environment)
//! - [`geometry::BufferGeometry`]: double-buffer sizing derived from the rates
//! - [`channel::ChannelLayout`]: ordered logical channels of a session
//! - [`calibration::CalibrationTable`]: per-input offset/scale pairs
//! - [`pipeline::TickSink`]: consumer of demultiplexed ticks
//! - [`error::DaqError`]: shared error type

pub mod calibration;
pub mod channel;
pub mod config;
pub mod error;
pub mod geometry;
pub mod limits;
pub mod pipeline;

pub use calibration::{CalibrationSet, CalibrationTable};
pub use channel::{AnalogInput, ChannelLayout, StatusWord, Unit};
pub use config::{FileFormat, LoggerConfig, SessionConfig, SessionMode};
pub use error::{AppResult, DaqError, DriverError, DriverErrorKind};
pub use geometry::{BufferGeometry, Precision};
pub use pipeline::{BufferInfo, BufferTimestamp, Tick, TickSink};
