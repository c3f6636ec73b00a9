//! Sampling coprocessor driver for the data logger.
//!
//! This crate drives a realtime sampling coprocessor that fills two
//! alternating buffers in shared memory, and turns those buffers into
//! calibrated ticks for the recording and preview sinks of `daq-storage`.
//!
//! # Features
//!
//! - **Sampling session**: state machine with a bounded first handshake,
//!   overrun detection and resynchronization, cooperative stop
//! - **Demux engine**: single pass decode, calibration and current range merge
//! - **Coprocessor HAL**: trait over program load, ready event and shutdown
//! - **Simulated coprocessor**: deterministic signal with injectable failures
//! - **Live meter**: per-buffer reading in physical units
//!
//! # Example
//!
//! ```no_run
//! use daq_core::config::LoggerConfig;
//! use daq_driver_coproc::sampling::SamplingSession;
//! use daq_driver_coproc::simulated::{SimulatedConfig, SimulatedCoprocessor};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = LoggerConfig::load_from("daq-logger.toml")?;
//! let coproc = SimulatedCoprocessor::new(SimulatedConfig::default())?;
//! let report = SamplingSession::new(coproc, config).run()?;
//! println!("stored {} samples", report.samples_stored);
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod demux;
pub mod error;
pub mod hal;
pub mod memory;
pub mod meter;
pub mod sampling;
pub mod simulated;
pub mod wait;

pub use command::{AcquisitionMode, CoprocessorCommand, CoprocessorProgram};
pub use demux::DemuxEngine;
pub use error::{CoprocError, Result};
pub use hal::{Coprocessor, ReadyEvent};
pub use memory::{BufferWindow, HardwareMemory};
pub use meter::LiveMeter;
pub use sampling::{SamplingSession, SessionOutcome, SessionPhase, SessionReport, StopHandle};
pub use simulated::{SimScenario, SimulatedConfig, SimulatedCoprocessor, SimulatedHandle};
