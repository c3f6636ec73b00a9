//! Converter command list and the program block handed to the coprocessor.
//!
//! The coprocessor forwards a short list of commands to the analog front end
//! before it starts streaming: reset, leave continuous mode, write the
//! configuration and gain registers, then re-enter continuous mode.

use std::fmt;

use daq_core::geometry::{BufferGeometry, Precision};
use daq_core::limits::MIN_NATIVE_RATE;

const OPCODE_RESET: u8 = 0x06;
const OPCODE_START_CONTINUOUS: u8 = 0x10;
const OPCODE_STOP_CONTINUOUS: u8 = 0x11;
const OPCODE_WRITE_REGISTER: u8 = 0x40;

/// Register addresses of the front end.
pub mod register {
    /// Global configuration, carries the data rate code.
    pub const CONFIG1: u8 = 0x01;
    /// Reference and bias configuration.
    pub const CONFIG3: u8 = 0x03;
    /// Per-channel settings of channel 1; channel `n` is `CH1SET + n - 1`.
    pub const CH1SET: u8 = 0x05;
}

const CONFIG1_DEFAULT: u8 = 0x90;
const CONFIG3_DEFAULT: u8 = 0xE0;
const GAIN1: u8 = 0x10;
const GAIN2: u8 = 0x20;

/// Data rate code of the front end, per native rate.
const RATE_CODES: [(u32, u8); 7] = [
    (64000, 0),
    (32000, 1),
    (16000, 2),
    (8000, 3),
    (4000, 4),
    (2000, 5),
    (1000, 6),
];

/// One command forwarded to the analog front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoprocessorCommand {
    /// Reset the converter.
    Reset,
    /// Leave continuous conversion mode so registers can be written.
    StopContinuous,
    /// Write one configuration register.
    WriteRegister {
        /// Register address.
        register: u8,
        /// Register value.
        value: u8,
    },
    /// Enter continuous conversion mode.
    StartContinuous,
}

impl CoprocessorCommand {
    /// Command opcode.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Reset => OPCODE_RESET,
            Self::StopContinuous => OPCODE_STOP_CONTINUOUS,
            Self::WriteRegister { register, .. } => OPCODE_WRITE_REGISTER | register,
            Self::StartContinuous => OPCODE_START_CONTINUOUS,
        }
    }

    /// Command word as stored in the program block: opcode in bits 16..24,
    /// register value in bits 0..8.
    pub fn encode(&self) -> u32 {
        match self {
            Self::WriteRegister { value, .. } => {
                (u32::from(self.opcode()) << 16) | u32::from(*value)
            }
            _ => u32::from(self.opcode()) << 16,
        }
    }
}

impl fmt::Display for CoprocessorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => write!(f, "RESET"),
            Self::StopContinuous => write!(f, "SDATAC"),
            Self::WriteRegister { register, value } => {
                write!(f, "WREG {:#04x}={:#04x}", register, value)
            }
            Self::StartContinuous => write!(f, "RDATAC"),
        }
    }
}

/// Acquisition mode programmed into the coprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// Stop after `sample_limit` samples.
    Bounded,
    /// Run until commanded off.
    Continuous,
}

/// Everything the coprocessor needs to start sampling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoprocessorProgram {
    /// Acquisition mode.
    pub mode: AcquisitionMode,
    /// Delivered sample rate in Hz.
    pub sample_rate: u32,
    /// Sample precision class.
    pub precision: Precision,
    /// Raw sample width in bytes.
    pub sample_width: usize,
    /// Ticks per buffer.
    pub buffer_size: u32,
    /// Total ticks of a bounded session, 0 when continuous.
    pub sample_limit: u64,
    /// Offsets of the two buffer slots inside the shared region.
    pub buffer_offsets: [usize; 2],
    /// Native converter ticks folded into one delivered tick.
    pub decimation: u32,
    /// Front end commands, executed in order.
    pub commands: Vec<CoprocessorCommand>,
}

/// Native converter rate and decimation factor for a sample rate.
///
/// Rates below the slowest converter rate are produced by decimation.
pub fn native_rate(sample_rate: u32) -> (u32, u32) {
    if sample_rate < MIN_NATIVE_RATE {
        (MIN_NATIVE_RATE, MIN_NATIVE_RATE / sample_rate.max(1))
    } else {
        (sample_rate, 1)
    }
}

/// Data rate code for a native converter rate.
pub fn rate_code(native_rate: u32) -> Option<u8> {
    RATE_CODES
        .iter()
        .find(|(rate, _)| *rate == native_rate)
        .map(|(_, code)| *code)
}

impl CoprocessorProgram {
    /// Program for a validated geometry.
    ///
    /// Returns `None` when the sample rate has no converter rate code, which
    /// cannot happen for a geometry built from a supported rate.
    pub fn build(geometry: &BufferGeometry, buffer_offsets: [usize; 2]) -> Option<Self> {
        let (native, decimation) = native_rate(geometry.sample_rate);
        let code = rate_code(native)?;

        let mut commands = vec![
            CoprocessorCommand::Reset,
            CoprocessorCommand::StopContinuous,
            CoprocessorCommand::WriteRegister {
                register: register::CONFIG3,
                value: CONFIG3_DEFAULT,
            },
            CoprocessorCommand::WriteRegister {
                register: register::CONFIG1,
                value: CONFIG1_DEFAULT | code,
            },
        ];
        // high range inputs get double gain
        for (channel, gain) in [(1, GAIN2), (3, GAIN1), (4, GAIN1), (5, GAIN1), (6, GAIN1)] {
            commands.push(CoprocessorCommand::WriteRegister {
                register: register::CH1SET + channel - 1,
                value: gain,
            });
        }
        commands.push(CoprocessorCommand::StartContinuous);

        Some(Self {
            mode: if geometry.number_buffers.is_some() {
                AcquisitionMode::Bounded
            } else {
                AcquisitionMode::Continuous
            },
            sample_rate: geometry.sample_rate,
            precision: geometry.precision,
            sample_width: geometry.sample_width(),
            buffer_size: geometry.buffer_size,
            sample_limit: geometry.sample_limit,
            buffer_offsets,
            decimation,
            commands,
        })
    }

    /// Number of buffers of a bounded program.
    pub fn number_buffers(&self) -> Option<u64> {
        match self.mode {
            AcquisitionMode::Bounded => Some(daq_core::limits::ceil_div(
                self.sample_limit,
                u64::from(self.buffer_size),
            )),
            AcquisitionMode::Continuous => None,
        }
    }

    /// Little-endian program block for the coprocessor data memory.
    pub fn encode(&self) -> Vec<u8> {
        let mut block = Vec::with_capacity(44 + 4 * self.commands.len());
        let mode: u32 = match self.mode {
            AcquisitionMode::Bounded => 1,
            AcquisitionMode::Continuous => 2,
        };
        let precision: u32 = match self.precision {
            Precision::Low => 16,
            Precision::High => 24,
        };
        block.extend_from_slice(&mode.to_le_bytes());
        block.extend_from_slice(&self.sample_rate.to_le_bytes());
        block.extend_from_slice(&precision.to_le_bytes());
        block.extend_from_slice(&(self.sample_width as u32).to_le_bytes());
        block.extend_from_slice(&self.buffer_size.to_le_bytes());
        block.extend_from_slice(&self.sample_limit.to_le_bytes());
        block.extend_from_slice(&(self.buffer_offsets[0] as u32).to_le_bytes());
        block.extend_from_slice(&(self.buffer_offsets[1] as u32).to_le_bytes());
        block.extend_from_slice(&self.decimation.to_le_bytes());
        block.extend_from_slice(&(self.commands.len() as u32).to_le_bytes());
        for command in &self.commands {
            block.extend_from_slice(&command.encode().to_le_bytes());
        }
        block
    }
}
