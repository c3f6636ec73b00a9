//! Channel model: physical inputs, the per-sample status word, and the
//! logical channel layout shared by the demux engine and every sink.
//!
//! The hardware always samples all eight analog inputs. A session enables a
//! subset; the layout derived here decides which logical channels exist, in
//! which order sinks see them, and how a current input's high and low range
//! sub-channels are merged.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::limits::{DIGITAL_INPUT_COUNT, PREVIEW_CHANNELS};

/// Physical analog inputs in hardware order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalogInput {
    /// Current input 1, high range.
    I1H,
    /// Current input 1, low range.
    I1L,
    /// Voltage input 1.
    V1,
    /// Voltage input 2.
    V2,
    /// Current input 2, high range.
    I2H,
    /// Current input 2, low range.
    I2L,
    /// Voltage input 3.
    V3,
    /// Voltage input 4.
    V4,
}

/// Electrical role of a physical input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Voltage measurement.
    Voltage,
    /// High range of a current input.
    CurrentHigh,
    /// Low range of a current input.
    CurrentLow,
}

impl AnalogInput {
    /// All inputs in hardware order.
    pub const ALL: [AnalogInput; 8] = [
        AnalogInput::I1H,
        AnalogInput::I1L,
        AnalogInput::V1,
        AnalogInput::V2,
        AnalogInput::I2H,
        AnalogInput::I2L,
        AnalogInput::V3,
        AnalogInput::V4,
    ];

    /// Position of this input inside a raw sample record.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Channel name as written to files.
    pub fn name(self) -> &'static str {
        match self {
            AnalogInput::I1H => "I1H",
            AnalogInput::I1L => "I1L",
            AnalogInput::V1 => "V1",
            AnalogInput::V2 => "V2",
            AnalogInput::I2H => "I2H",
            AnalogInput::I2L => "I2L",
            AnalogInput::V3 => "V3",
            AnalogInput::V4 => "V4",
        }
    }

    /// Electrical role of the input.
    pub fn kind(self) -> InputKind {
        match self {
            AnalogInput::I1H | AnalogInput::I2H => InputKind::CurrentHigh,
            AnalogInput::I1L | AnalogInput::I2L => InputKind::CurrentLow,
            _ => InputKind::Voltage,
        }
    }

    /// Current input (0 or 1) this sub-channel belongs to.
    pub fn current_input(self) -> Option<usize> {
        match self {
            AnalogInput::I1H | AnalogInput::I1L => Some(0),
            AnalogInput::I2H | AnalogInput::I2L => Some(1),
            _ => None,
        }
    }

    /// Parse a channel name (case insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|input| input.name().eq_ignore_ascii_case(name))
    }
}

bitflags! {
    /// Per-sample status word written by the coprocessor ahead of each sample.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusWord: u32 {
        /// Digital input 1.
        const DI1 = 0x01;
        /// Digital input 2.
        const DI2 = 0x02;
        /// Digital input 3.
        const DI3 = 0x04;
        /// Digital input 4.
        const DI4 = 0x08;
        /// Digital input 5.
        const DI5 = 0x10;
        /// Digital input 6.
        const DI6 = 0x20;
        /// Low range of current input 1 is not saturated.
        const I1L_VALID = 0x40;
        /// Low range of current input 2 is not saturated.
        const I2L_VALID = 0x80;
    }
}

impl StatusWord {
    /// Digital input flags in channel order.
    pub const DIGITAL: [StatusWord; DIGITAL_INPUT_COUNT] = [
        StatusWord::DI1,
        StatusWord::DI2,
        StatusWord::DI3,
        StatusWord::DI4,
        StatusWord::DI5,
        StatusWord::DI6,
    ];

    /// Range-valid flag of a current input.
    pub fn range_valid(current_input: usize) -> StatusWord {
        if current_input == 0 {
            StatusWord::I1L_VALID
        } else {
            StatusWord::I2L_VALID
        }
    }
}

/// Unit code of a logical channel, as stored in file descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Unit {
    /// Volts.
    Voltage = 1,
    /// Amperes.
    Current = 2,
    /// Digital input level.
    Binary = 3,
    /// Low range validity flag.
    RangeValid = 4,
}

impl Unit {
    /// Numeric code for the binary file format.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decode a numeric unit code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Unit::Voltage),
            2 => Some(Unit::Current),
            3 => Some(Unit::Binary),
            4 => Some(Unit::RangeValid),
            _ => None,
        }
    }

    /// Base unit symbol.
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Voltage => "V",
            Unit::Current => "A",
            Unit::Binary | Unit::RangeValid => "",
        }
    }
}

/// Power-of-ten exponent of a voltage count (10 nV).
pub const VOLTAGE_SCALE: i32 = -8;
/// Power-of-ten exponent of a low range current count (10 pA).
pub const CURRENT_LOW_SCALE: i32 = -11;
/// Power-of-ten exponent of a high range current count (1 nA).
pub const CURRENT_HIGH_SCALE: i32 = -9;

/// Where an analog logical channel takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogSource {
    /// One physical input, calibrated.
    Direct(AnalogInput),
    /// A current input with both ranges enabled: low range while valid,
    /// otherwise the high range scaled to low range units.
    Merged {
        /// High range sub-channel.
        high: AnalogInput,
        /// Low range sub-channel.
        low: AnalogInput,
        /// Current input index (0 or 1).
        current_input: usize,
    },
}

/// Where a binary logical channel takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySource {
    /// One digital input bit of the status word.
    Digital(StatusWord),
    /// Low range validity of a current input.
    RangeValid {
        /// Current input index (0 or 1).
        current_input: usize,
    },
}

/// Analog channel as seen by sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalogChannel {
    /// Channel name.
    pub name: String,
    /// Unit code.
    pub unit: Unit,
    /// Power-of-ten exponent of one count.
    pub scale: i32,
    /// Value source.
    pub source: AnalogSource,
    /// Index of the binary channel flagging this channel's range validity.
    pub valid_channel: Option<usize>,
}

/// Binary channel as seen by sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryChannel {
    /// Channel name.
    pub name: String,
    /// Unit code.
    pub unit: Unit,
    /// Value source.
    pub source: BinarySource,
}

/// Ordered set of logical channels for one session.
///
/// Binary channels come first (digital inputs, then range-valid flags),
/// followed by analog channels in hardware order. A merged current channel
/// takes the position of its high range sub-channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelLayout {
    /// Binary channels, bit `k` of a tick's binary word is channel `k`.
    pub binary: Vec<BinaryChannel>,
    /// Analog channels, one `i32` per tick each.
    pub analog: Vec<AnalogChannel>,
    /// Current inputs forced to the high range.
    pub force_high: [bool; 2],
}

impl ChannelLayout {
    /// Derive the layout from the enabled inputs.
    pub fn new(enabled: &[AnalogInput], digital_inputs: bool, force_high: [bool; 2]) -> Self {
        let is_enabled = |input: AnalogInput| enabled.contains(&input);

        let mut binary = Vec::new();
        if digital_inputs {
            for (n, bit) in StatusWord::DIGITAL.iter().enumerate() {
                binary.push(BinaryChannel {
                    name: format!("DI{}", n + 1),
                    unit: Unit::Binary,
                    source: BinarySource::Digital(*bit),
                });
            }
        }

        let mut valid_index = [None; 2];
        for (current_input, low) in [(0, AnalogInput::I1L), (1, AnalogInput::I2L)] {
            if is_enabled(low) {
                valid_index[current_input] = Some(binary.len());
                binary.push(BinaryChannel {
                    name: format!("{}_valid", low.name()),
                    unit: Unit::RangeValid,
                    source: BinarySource::RangeValid { current_input },
                });
            }
        }

        let mut analog = Vec::new();
        for input in AnalogInput::ALL {
            if !is_enabled(input) {
                continue;
            }
            match (input.kind(), input.current_input()) {
                (InputKind::Voltage, _) => analog.push(AnalogChannel {
                    name: input.name().to_string(),
                    unit: Unit::Voltage,
                    scale: VOLTAGE_SCALE,
                    source: AnalogSource::Direct(input),
                    valid_channel: None,
                }),
                (InputKind::CurrentHigh, Some(current_input)) => {
                    let low = if current_input == 0 {
                        AnalogInput::I1L
                    } else {
                        AnalogInput::I2L
                    };
                    if is_enabled(low) {
                        analog.push(AnalogChannel {
                            name: format!("I{}", current_input + 1),
                            unit: Unit::Current,
                            scale: CURRENT_LOW_SCALE,
                            source: AnalogSource::Merged {
                                high: input,
                                low,
                                current_input,
                            },
                            valid_channel: valid_index[current_input],
                        });
                    } else {
                        analog.push(AnalogChannel {
                            name: input.name().to_string(),
                            unit: Unit::Current,
                            scale: CURRENT_HIGH_SCALE,
                            source: AnalogSource::Direct(input),
                            valid_channel: None,
                        });
                    }
                }
                (InputKind::CurrentLow, Some(current_input)) => {
                    let high = if current_input == 0 {
                        AnalogInput::I1H
                    } else {
                        AnalogInput::I2H
                    };
                    // merged into the high range channel's slot
                    if !is_enabled(high) {
                        analog.push(AnalogChannel {
                            name: input.name().to_string(),
                            unit: Unit::Current,
                            scale: CURRENT_LOW_SCALE,
                            source: AnalogSource::Direct(input),
                            valid_channel: valid_index[current_input],
                        });
                    }
                }
                _ => {}
            }
        }

        Self {
            binary,
            analog,
            force_high,
        }
    }

    /// Total number of logical channels.
    pub fn channel_count(&self) -> usize {
        self.binary.len() + self.analog.len()
    }

    /// Whether the session produces no channel data at all.
    pub fn is_empty(&self) -> bool {
        self.binary.is_empty() && self.analog.is_empty()
    }

    /// Indices of the binary channels that are digital inputs.
    pub fn digital_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.binary
            .iter()
            .enumerate()
            .filter(|(_, ch)| matches!(ch.source, BinarySource::Digital(_)))
            .map(|(n, _)| n)
    }

    /// Number of values in one web preview element: analog channels followed
    /// by digital inputs. Range-valid flags are not previewed.
    pub fn preview_channel_count(&self) -> usize {
        (self.analog.len() + self.digital_indices().count()).min(PREVIEW_CHANNELS)
    }
}
