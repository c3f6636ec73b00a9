//! Simulated sampling coprocessor.
//!
//! Produces buffers into an anonymous memory region with the same layout
//! the real coprocessor uses. Each wait on the ready event produces the next
//! buffer, optionally paced at the configured sample rate, so tests run as
//! fast as the host consumes.
//!
//! Failure scenarios can be injected to exercise the host's recovery paths:
//!
//! ```
//! use daq_driver_coproc::simulated::{SimScenario, SimulatedConfig, SimulatedCoprocessor};
//!
//! let coproc = SimulatedCoprocessor::new(SimulatedConfig {
//!     scenarios: vec![SimScenario::SequenceJump { at_buffer: 3, skip: 2 }],
//!     ..SimulatedConfig::default()
//! })
//! .unwrap();
//! assert_eq!(coproc.handle().buffers_produced(), 0);
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use daq_core::channel::{AnalogInput, InputKind, StatusWord};
use daq_core::geometry::Precision;
use daq_core::limits::{SEQUENCE_BYTES, STATUS_WORD_BYTES};

use crate::command::CoprocessorProgram;
use crate::error::{CoprocError, Result};
use crate::hal::{Coprocessor, ReadyEvent};
use crate::memory::HardwareMemory;

/// Default size of the simulated memory region.
pub const DEFAULT_MEMORY_SIZE: usize = 4 * 1024 * 1024;

/// Ticks per period of the simulated sawtooth signal.
const SIGNAL_PERIOD: u64 = 100;

/// Injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimScenario {
    /// Buffer `at_buffer` carries sequence `at_buffer + skip`, as if the host
    /// had missed `skip` buffers.
    SequenceJump {
        /// Nominal buffer index at which the jump happens.
        at_buffer: u64,
        /// Buffers skipped.
        skip: u64,
    },
    /// Buffer `at_buffer` carries sequence `at_buffer - back`, a counter that
    /// went backwards.
    SequenceRegression {
        /// Nominal buffer index at which the counter goes back.
        at_buffer: u64,
        /// How far it goes back.
        back: u64,
    },
    /// The coprocessor never raises an event.
    NoResponse,
    /// Loading the program fails.
    RejectProgram,
    /// No further buffers after `buffers` were produced.
    StallAfter {
        /// Buffers produced before stalling.
        buffers: u64,
    },
    /// The off command is never acknowledged.
    IgnoreOff,
}

/// Simulator settings.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Size of the shared memory region in bytes.
    pub memory_size: usize,
    /// Peak amplitude of uniform noise added to every sample.
    pub noise: i32,
    /// Noise seed; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Pace buffers at the programmed sample rate.
    pub realtime: bool,
    /// Injected failures.
    pub scenarios: Vec<SimScenario>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            noise: 0,
            seed: None,
            realtime: false,
            scenarios: Vec::new(),
        }
    }
}

impl SimulatedConfig {
    fn has(&self, scenario: &SimScenario) -> bool {
        self.scenarios.contains(scenario)
    }

    fn stall_after(&self) -> Option<u64> {
        self.scenarios.iter().find_map(|s| match s {
            SimScenario::StallAfter { buffers } => Some(*buffers),
            _ => None,
        })
    }

    fn jump_at(&self, index: u64) -> u64 {
        self.scenarios
            .iter()
            .filter_map(|s| match s {
                SimScenario::SequenceJump { at_buffer, skip } if *at_buffer == index => {
                    Some(*skip)
                }
                _ => None,
            })
            .sum()
    }

    fn regression_at(&self, index: u64) -> u64 {
        self.scenarios
            .iter()
            .filter_map(|s| match s {
                SimScenario::SequenceRegression { at_buffer, back } if *at_buffer == index => {
                    Some(*back)
                }
                _ => None,
            })
            .sum()
    }
}

struct SimState {
    program: Option<CoprocessorProgram>,
    running: bool,
    released: bool,
    off_requested: bool,
    off_acknowledged: bool,
    next_sequence: u64,
    produced: u64,
    tick: u64,
    rng: StdRng,
}

struct SimShared {
    config: SimulatedConfig,
    memory: Arc<HardwareMemory>,
    state: Mutex<SimState>,
    cvar: Condvar,
}

/// Simulated coprocessor.
pub struct SimulatedCoprocessor {
    shared: Arc<SimShared>,
}

/// Buffer-ready event of the simulated coprocessor.
#[derive(Clone)]
pub struct SimulatedEvent {
    shared: Arc<SimShared>,
}

/// Inspection handle, usable after the coprocessor moved into a session.
#[derive(Clone)]
pub struct SimulatedHandle {
    shared: Arc<SimShared>,
}

fn sawtooth(tick: u64) -> i32 {
    (tick % SIGNAL_PERIOD) as i32 - (SIGNAL_PERIOD / 2) as i32
}

/// Raw sample the simulator emits for `input` at global tick `tick`, before noise.
pub fn simulated_sample(input: AnalogInput, tick: u64) -> i32 {
    let phase = sawtooth(tick);
    match input.kind() {
        InputKind::Voltage => 500 * phase + 10 * input.index() as i32,
        InputKind::CurrentHigh => 5 * phase,
        InputKind::CurrentLow => 500 * phase,
    }
}

/// Status word the simulator emits at global tick `tick`.
///
/// Digital inputs count up every ten ticks; the low current ranges are valid
/// while the signal stays in the middle half of its span.
pub fn simulated_status(tick: u64) -> StatusWord {
    let mut status = StatusWord::from_bits_truncate(((tick / 10) % 64) as u32);
    if sawtooth(tick).abs() < (SIGNAL_PERIOD / 4) as i32 {
        status |= StatusWord::I1L_VALID | StatusWord::I2L_VALID;
    }
    status
}

fn encode_sample(value: i32, precision: Precision, out: &mut Vec<u8>) {
    match precision {
        Precision::Low => {
            let v = value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        Precision::High => {
            let v = value.clamp(-(1 << 23), (1 << 23) - 1);
            out.extend_from_slice(&v.to_le_bytes()[..3]);
        }
    }
}

impl SimulatedCoprocessor {
    /// Create a simulator with its own memory region.
    pub fn new(config: SimulatedConfig) -> Result<Self> {
        let memory = HardwareMemory::anonymous(config.memory_size).map_err(|e| {
            CoprocError::Mapping {
                message: e.to_string(),
            }
        })?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            shared: Arc::new(SimShared {
                config,
                memory: Arc::new(memory),
                state: Mutex::new(SimState {
                    program: None,
                    running: false,
                    released: false,
                    off_requested: false,
                    off_acknowledged: false,
                    next_sequence: 0,
                    produced: 0,
                    tick: 0,
                    rng,
                }),
                cvar: Condvar::new(),
            }),
        })
    }

    /// Inspection handle.
    pub fn handle(&self) -> SimulatedHandle {
        SimulatedHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl SimulatedHandle {
    /// Buffers written so far.
    pub fn buffers_produced(&self) -> u64 {
        self.shared.state.lock().produced
    }

    /// Program loaded by the host.
    pub fn program(&self) -> Option<CoprocessorProgram> {
        self.shared.state.lock().program.clone()
    }

    /// Whether the off command was acknowledged.
    pub fn off_acknowledged(&self) -> bool {
        self.shared.state.lock().off_acknowledged
    }

    /// Whether the host released the coprocessor.
    pub fn released(&self) -> bool {
        self.shared.state.lock().released
    }
}

impl SimShared {
    fn can_produce(&self, state: &SimState) -> bool {
        let Some(program) = &state.program else {
            return false;
        };
        if self.config.has(&SimScenario::NoResponse) {
            return false;
        }
        if self
            .config
            .stall_after()
            .is_some_and(|limit| state.produced >= limit)
        {
            return false;
        }
        program
            .number_buffers()
            .map_or(true, |n| state.next_sequence < n)
    }

    fn pacing(&self) -> Option<Duration> {
        if !self.config.realtime {
            return None;
        }
        let state = self.state.lock();
        if state.off_requested {
            return None;
        }
        let program = state.program.as_ref()?;
        Some(Duration::from_secs_f64(
            f64::from(program.buffer_size) / f64::from(program.sample_rate.max(1)),
        ))
    }

    fn next_event(&self) -> Result<()> {
        if let Some(period) = self.pacing() {
            thread::sleep(period);
        }

        let mut state = self.state.lock();
        loop {
            if state.released || !state.running {
                return Err(CoprocError::EventWait {
                    message: "coprocessor not running".into(),
                });
            }
            if state.off_requested {
                if !self.config.has(&SimScenario::IgnoreOff) {
                    state.off_acknowledged = true;
                    state.running = false;
                    debug!("Simulated coprocessor acknowledged off");
                    return Ok(());
                }
            } else if self.can_produce(&state) {
                return self.produce(&mut state);
            }
            self.cvar.wait(&mut state);
        }
    }

    fn produce(&self, state: &mut SimState) -> Result<()> {
        let Some(program) = state.program.clone() else {
            return Err(CoprocError::EventWait {
                message: "no program loaded".into(),
            });
        };

        let nominal = state.next_sequence;
        let sequence = (nominal + self.config.jump_at(nominal))
            .saturating_sub(self.config.regression_at(nominal));
        let samples = match program.number_buffers() {
            Some(n) if sequence + 1 >= n => {
                let remainder = program.sample_limit % u64::from(program.buffer_size);
                if remainder == 0 {
                    program.buffer_size
                } else {
                    remainder as u32
                }
            }
            _ => program.buffer_size,
        };

        let record_bytes = STATUS_WORD_BYTES + AnalogInput::ALL.len() * program.sample_width;
        let mut block = Vec::with_capacity(SEQUENCE_BYTES + samples as usize * record_bytes);
        block.extend_from_slice(&(sequence as u32).to_le_bytes());
        for _ in 0..samples {
            let tick = state.tick;
            block.extend_from_slice(&simulated_status(tick).bits().to_le_bytes());
            for input in AnalogInput::ALL {
                let noise = if self.config.noise > 0 {
                    state.rng.gen_range(-self.config.noise..=self.config.noise)
                } else {
                    0
                };
                encode_sample(simulated_sample(input, tick) + noise, program.precision, &mut block);
            }
            state.tick += 1;
        }

        let offset = program.buffer_offsets[(nominal % 2) as usize];
        self.memory.write(offset, &block)?;

        state.next_sequence = sequence + 1;
        state.produced += 1;
        Ok(())
    }
}

impl ReadyEvent for SimulatedEvent {
    fn wait(&self) -> Result<()> {
        self.shared.next_event()
    }
}

impl Coprocessor for SimulatedCoprocessor {
    type Event = SimulatedEvent;

    fn name(&self) -> &str {
        "simulated"
    }

    fn memory_size(&self) -> usize {
        self.shared.memory.len()
    }

    fn map_memory(&mut self) -> Result<Arc<HardwareMemory>> {
        Ok(Arc::clone(&self.shared.memory))
    }

    fn ready_event(&self) -> Self::Event {
        SimulatedEvent {
            shared: Arc::clone(&self.shared),
        }
    }

    fn load(&mut self, program: &CoprocessorProgram) -> Result<()> {
        if self.shared.config.has(&SimScenario::RejectProgram) {
            return Err(CoprocError::ProgramLoad {
                message: "simulated program rejection".into(),
            });
        }
        let slot_end = program.buffer_offsets[1]
            + SEQUENCE_BYTES
            + program.buffer_size as usize
                * (STATUS_WORD_BYTES + AnalogInput::ALL.len() * program.sample_width);
        if slot_end > self.shared.memory.len() {
            return Err(CoprocError::CommandRejected {
                command: "load".into(),
                message: format!(
                    "buffer slot ends at {} beyond memory of {} bytes",
                    slot_end,
                    self.shared.memory.len()
                ),
            });
        }

        let mut state = self.shared.state.lock();
        state.program = Some(program.clone());
        state.running = true;
        state.off_requested = false;
        state.off_acknowledged = false;
        state.next_sequence = 0;
        self.shared.cvar.notify_all();
        info!(
            sample_rate = program.sample_rate,
            buffer_size = program.buffer_size,
            commands = program.commands.len(),
            "Simulated coprocessor started"
        );
        Ok(())
    }

    fn set_off(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.off_requested = true;
        self.shared.cvar.notify_all();
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.released = true;
        state.running = false;
        self.shared.cvar.notify_all();
        debug!(produced = state.produced, "Simulated coprocessor released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferWindow;
    use daq_core::geometry::BufferGeometry;

    fn start(config: SimulatedConfig, limit: u64) -> (SimulatedCoprocessor, BufferWindow) {
        let mut coproc = SimulatedCoprocessor::new(config).unwrap();
        let geometry = BufferGeometry::new(10, 1, limit).unwrap();
        let window = BufferWindow::new(coproc.map_memory().unwrap(), geometry.buffer_bytes()).unwrap();
        let program = CoprocessorProgram::build(&geometry, window.slot_offsets()).unwrap();
        coproc.load(&program).unwrap();
        (coproc, window)
    }

    #[test]
    fn test_buffers_alternate_slots() {
        let (coproc, window) = start(SimulatedConfig::default(), 0);
        let event = coproc.ready_event();
        event.wait().unwrap();
        assert_eq!(window.read_sequence(0).unwrap(), 0);
        event.wait().unwrap();
        assert_eq!(window.read_sequence(1).unwrap(), 1);
        event.wait().unwrap();
        assert_eq!(window.read_sequence(0).unwrap(), 2);
        assert_eq!(coproc.handle().buffers_produced(), 3);
    }

    #[test]
    fn test_sequence_jump() {
        let config = SimulatedConfig {
            scenarios: vec![SimScenario::SequenceJump { at_buffer: 1, skip: 3 }],
            ..SimulatedConfig::default()
        };
        let (coproc, window) = start(config, 0);
        let event = coproc.ready_event();
        event.wait().unwrap();
        event.wait().unwrap();
        assert_eq!(window.read_sequence(1).unwrap(), 4);
        // host resynchronizes to 5, which lives in slot 1
        event.wait().unwrap();
        assert_eq!(window.read_sequence(1).unwrap(), 5);
    }

    #[test]
    fn test_off_acknowledged() {
        let (mut coproc, _window) = start(SimulatedConfig::default(), 0);
        let handle = coproc.handle();
        let event = coproc.ready_event();
        coproc.set_off().unwrap();
        event.wait().unwrap();
        assert!(handle.off_acknowledged());
        assert!(event.wait().is_err());
    }

    #[test]
    fn test_release_wakes_waiter() {
        let config = SimulatedConfig {
            scenarios: vec![SimScenario::NoResponse],
            ..SimulatedConfig::default()
        };
        let (mut coproc, _window) = start(config, 0);
        let event = coproc.ready_event();
        let waiter = thread::spawn(move || event.wait());
        thread::sleep(Duration::from_millis(20));
        coproc.release().unwrap();
        assert!(waiter.join().unwrap().is_err());
    }

    #[test]
    fn test_bounded_program_remainder() {
        let (coproc, mut window) = start(SimulatedConfig::default(), 15);
        let event = coproc.ready_event();
        event.wait().unwrap();
        event.wait().unwrap();
        assert_eq!(window.read_sequence(1).unwrap(), 1);
        // second buffer holds 5 ticks; tick 15 was never written
        let record = STATUS_WORD_BYTES + 8 * 3;
        let raw = window.drain(1, 6 * record).unwrap().to_vec();
        assert!(raw[5 * record..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_signal_shape() {
        assert_eq!(simulated_sample(AnalogInput::V1, 50), 20);
        assert_eq!(simulated_sample(AnalogInput::I1H, 0), -250);
        assert!(simulated_status(50).contains(StatusWord::I1L_VALID));
        assert!(!simulated_status(0).contains(StatusWord::I1L_VALID));
        assert_eq!(simulated_status(25).bits() & 0x3F, 2);
    }
}
