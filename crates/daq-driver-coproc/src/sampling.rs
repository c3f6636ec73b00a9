//! Sampling session: drives the coprocessor and fans buffers out to sinks.
//!
//! # State machine
//!
//! ```text
//! Init ──► Armed ──► Running ──┬──► Stopped ───────┐
//!                              ├──► LimitReached ──┼──► Teardown
//!                              └──► Error ─────────┘
//! ```
//!
//! Only the first buffer-ready wait is bounded ([`HANDSHAKE_TIMEOUT`]); once
//! the coprocessor delivered a buffer, every further wait blocks without a
//! deadline. The stop request is checked once per buffer, so the buffer in
//! flight when it arrives is still stored.
//!
//! Every buffer carries a sequence counter. When it is ahead of the expected
//! index the missed buffers are counted as lost, the loop continues from the
//! reported index and the sinks see a gap but never reordered data.
//!
//! Teardown runs on every exit path after the status segment was attached:
//! files are finalized, the coprocessor is switched off, memory is unmapped,
//! the preview segment is removed and the status record is marked idle.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, trace, warn};

use daq_core::channel::ChannelLayout;
use daq_core::config::{FileFormat, LoggerConfig, SessionMode};
use daq_core::error::DaqError;
use daq_core::geometry::BufferGeometry;
use daq_core::limits::{HANDSHAKE_TIMEOUT, STOP_ACK_TIMEOUT};
use daq_core::pipeline::{BufferInfo, BufferTimestamp, TickSink};
use daq_storage::binary_writer::BinaryFileWriter;
use daq_storage::csv_writer::CsvFileWriter;
use daq_storage::file_header::FileHeader;
use daq_storage::notifier::{ConsumerNotifier, SemaphoreNotifier};
use daq_storage::preview::PreviewPublisher;
use daq_storage::status::{
    disk_usage_for_file, is_sampling, ConfigSnapshot, SessionState, StatusPublisher,
};

use crate::command::CoprocessorProgram;
use crate::demux::DemuxEngine;
use crate::error::{CoprocError, Result};
use crate::hal::{Coprocessor, ReadyEvent};
use crate::memory::BufferWindow;
use crate::meter::LiveMeter;
use crate::wait::{wait_bounded, wait_or_timeout, WaitOutcome};

/// Cooperative stop request shared with signal handlers.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    /// New handle with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to stop at the next buffer boundary.
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Phase of a sampling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Configuration validated, resources being prepared.
    Init,
    /// Program loaded, waiting for the first buffer.
    Armed,
    /// Buffers flowing.
    Running,
    /// Stopped on request.
    Stopped,
    /// Sample limit reached.
    LimitReached,
    /// Fatal error.
    Error,
    /// Releasing resources.
    Teardown,
}

/// How a session that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Stopped on request.
    Stopped,
    /// All requested samples stored.
    LimitReached,
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// How the session ended.
    pub outcome: SessionOutcome,
    /// Samples handed to the sinks.
    pub samples_stored: u64,
    /// Buffers handed to the sinks.
    pub buffers_stored: u64,
    /// Buffers the host missed.
    pub buffers_lost: u64,
    /// Wall time from start to the end of teardown.
    pub elapsed: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    samples: u64,
    buffers: u64,
    lost: u64,
}

/// Resources a session holds; released by teardown.
#[derive(Default)]
struct Active {
    sinks: Vec<Box<dyn TickSink + Send>>,
    file_sinks: usize,
    window: Option<BufferWindow>,
    armed: bool,
    counters: Counters,
}

fn status_error(err: anyhow::Error) -> CoprocError {
    CoprocError::Status {
        message: format!("{:#}", err),
    }
}

/// One acquisition run against a coprocessor.
pub struct SamplingSession<C: Coprocessor> {
    coproc: C,
    config: LoggerConfig,
    stop: StopHandle,
    phase: SessionPhase,
    extra_sinks: Vec<Box<dyn TickSink + Send>>,
    meter_output: Option<Box<dyn Write + Send>>,
    notifier: Option<Box<dyn ConsumerNotifier>>,
}

impl<C: Coprocessor> SamplingSession<C> {
    /// Session for `config` on `coproc`.
    pub fn new(coproc: C, config: LoggerConfig) -> Self {
        Self {
            coproc,
            config,
            stop: StopHandle::new(),
            phase: SessionPhase::Init,
            extra_sinks: Vec::new(),
            meter_output: None,
            notifier: None,
        }
    }

    /// Use an externally created stop handle.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Feed an additional sink after the built-in ones.
    pub fn with_sink(mut self, sink: Box<dyn TickSink + Send>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    /// Write meter output here instead of stdout.
    pub fn with_meter_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.meter_output = Some(out);
        self
    }

    /// Wake preview consumers through `notifier` instead of the SysV semaphore.
    pub fn with_preview_notifier(mut self, notifier: Box<dyn ConsumerNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Handle that stops this session.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        debug!(from = ?self.phase, to = ?phase, "Session phase change");
        self.phase = phase;
    }

    /// Run the session to completion.
    ///
    /// Configuration errors and an already running session are rejected
    /// before anything is touched. Any later failure still runs teardown and
    /// is then returned.
    pub fn run(mut self) -> Result<SessionReport> {
        let started = Instant::now();
        self.config.validate()?;
        let geometry = self.config.session.geometry()?;
        let status_path = self.config.segments.status_path.clone();
        if is_sampling(&status_path) {
            return Err(DaqError::AlreadySampling.into());
        }

        let mut status = StatusPublisher::create_or_attach(&status_path).map_err(status_error)?;
        let session = &self.config.session;
        status.reset(
            ConfigSnapshot::from_session(session),
            disk_usage_for_file(&session.file_name),
        );
        status.record_mut().set_state(SessionState::Running);
        status.record_mut().set_sampling(true);
        status.publish();

        info!(
            coprocessor = self.coproc.name(),
            mode = ?session.mode,
            sample_rate = geometry.sample_rate,
            update_rate = geometry.update_rate,
            buffer_size = geometry.buffer_size,
            buffers = ?geometry.number_buffers,
            "Starting sampling session"
        );

        let mut active = Active::default();
        let result = self.acquire(&geometry, &mut status, &mut active, started);
        match &result {
            Ok(SessionOutcome::Stopped) => self.set_phase(SessionPhase::Stopped),
            Ok(SessionOutcome::LimitReached) => self.set_phase(SessionPhase::LimitReached),
            Err(e) => {
                self.set_phase(SessionPhase::Error);
                error!(error = %e, "Sampling session failed");
            }
        }

        let result = self.teardown(&mut active, &mut status, result);
        let counters = active.counters;
        info!(
            samples = counters.samples,
            buffers = counters.buffers,
            lost_buffers = counters.lost,
            "Stored {} samples",
            counters.samples
        );

        result.map(|outcome| SessionReport {
            outcome,
            samples_stored: counters.samples,
            buffers_stored: counters.buffers,
            buffers_lost: counters.lost,
            elapsed: started.elapsed(),
        })
    }

    fn open_sinks(
        &mut self,
        layout: &ChannelLayout,
        geometry: &BufferGeometry,
        active: &mut Active,
    ) -> Result<()> {
        let session = &self.config.session;
        match session.file_format() {
            FileFormat::Binary => {
                let header = FileHeader::build(layout, geometry, &session.comment, Utc::now())
                    .map_err(|e| CoprocError::sink("binary", e))?;
                let writer = BinaryFileWriter::create(&session.file_name, header)
                    .map_err(|e| CoprocError::sink("binary", e))?;
                active.sinks.push(Box::new(writer));
            }
            FileFormat::Csv => {
                let header = FileHeader::build(layout, geometry, &session.comment, Utc::now())
                    .map_err(|e| CoprocError::sink("csv", e))?;
                let writer = CsvFileWriter::create(&session.file_name, &header, layout)
                    .map_err(|e| CoprocError::sink("csv", e))?;
                active.sinks.push(Box::new(writer));
            }
            FileFormat::None => {}
        }
        active.file_sinks = active.sinks.len();

        if session.web_enable {
            let notifier: Box<dyn ConsumerNotifier> = match self.notifier.take() {
                Some(notifier) => notifier,
                None => Box::new(
                    SemaphoreNotifier::create(self.config.segments.semaphore_key)
                        .map_err(|e| CoprocError::sink("web", e))?,
                ),
            };
            let publisher = PreviewPublisher::create(&self.config.segments.web_path, layout, notifier)
                .map_err(|e| CoprocError::sink("web", e))?;
            active.sinks.push(Box::new(publisher));
        }

        if session.mode == SessionMode::Meter {
            let out = self
                .meter_output
                .take()
                .unwrap_or_else(|| Box::new(io::stdout()));
            active.sinks.push(Box::new(LiveMeter::new(layout, out)));
        }

        active.sinks.append(&mut self.extra_sinks);
        debug!(
            sinks = ?active.sinks.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Sinks ready"
        );
        Ok(())
    }

    fn acquire(
        &mut self,
        geometry: &BufferGeometry,
        status: &mut StatusPublisher,
        active: &mut Active,
        started: Instant,
    ) -> Result<SessionOutcome> {
        let layout = self.config.session.layout();
        if layout.is_empty() {
            warn!("No channels enabled, buffers carry no data");
        }
        self.open_sinks(&layout, geometry, active)?;

        let available = self.coproc.memory_size();
        if !geometry.fits(available) {
            return Err(CoprocError::MemoryTooSmall {
                required: geometry.required_memory(),
                available,
            });
        }
        let memory = self.coproc.map_memory()?;
        let window = active
            .window
            .insert(BufferWindow::new(memory, geometry.buffer_bytes())?);

        let program = CoprocessorProgram::build(geometry, window.slot_offsets()).ok_or_else(|| {
            CoprocError::ProgramLoad {
                message: format!("no converter rate for {} Hz", geometry.sample_rate),
            }
        })?;
        debug!(
            commands = ?program.commands.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
            decimation = program.decimation,
            "Loading coprocessor program"
        );
        active.armed = true;
        self.coproc.load(&program)?;
        self.set_phase(SessionPhase::Armed);

        let event = self.coproc.ready_event();
        let mut demux = DemuxEngine::new(layout, &self.config.calibration, geometry.precision);
        let limit_reached = |index: u64| geometry.number_buffers.is_some_and(|n| index >= n);
        let mut index: u64 = 0;

        loop {
            if limit_reached(index) {
                return Ok(SessionOutcome::LimitReached);
            }
            if self.stop.is_stop_requested() {
                info!(buffer = index, "Stop requested");
                return Ok(SessionOutcome::Stopped);
            }

            if self.phase == SessionPhase::Armed {
                wait_or_timeout(&event, HANDSHAKE_TIMEOUT)?;
                self.set_phase(SessionPhase::Running);
            } else {
                event.wait()?;
            }
            event.clear()?;

            let slot = (index % 2) as usize;
            let sequence = u64::from(window.read_sequence(slot)?);
            if sequence != index {
                if sequence < index {
                    return Err(CoprocError::SequenceRegression {
                        expected: index,
                        sequence,
                    });
                }
                let lost = sequence - index;
                active.counters.lost += lost;
                warn!(
                    expected = index,
                    sequence,
                    total_lost = active.counters.lost,
                    "Buffer overrun: {} samples ({} buffers) lost, {} buffers lost in total",
                    lost * u64::from(geometry.buffer_size),
                    lost,
                    active.counters.lost
                );
                index = sequence;
                if limit_reached(index) {
                    return Ok(SessionOutcome::LimitReached);
                }
            }

            let info = BufferInfo {
                index,
                samples: geometry.samples_in_buffer(index),
                sample_rate: geometry.sample_rate,
                timestamp: BufferTimestamp::capture(started.elapsed()),
            };
            let raw = window.drain(slot, info.samples as usize * demux.record_bytes())?;
            demux.process(raw, &info, &mut active.sinks)?;

            active.counters.samples += u64::from(info.samples);
            active.counters.buffers += 1;
            let record = status.record_mut();
            record.samples_taken = active.counters.samples;
            record.buffer_number = active.counters.buffers;
            status.publish();

            trace!(
                buffer = index,
                samples = info.samples,
                total = active.counters.samples,
                "Stored buffer"
            );
            index += 1;
        }
    }

    fn finish_sinks(sinks: &mut [Box<dyn TickSink + Send>], result: &mut Result<SessionOutcome>) {
        for sink in sinks.iter_mut() {
            if let Err(e) = sink.finish() {
                error!(sink = sink.name(), error = %format!("{:#}", e), "Failed to finalize sink");
                if result.is_ok() {
                    *result = Err(CoprocError::sink(sink.name(), e));
                }
            }
        }
    }

    fn teardown(
        &mut self,
        active: &mut Active,
        status: &mut StatusPublisher,
        mut result: Result<SessionOutcome>,
    ) -> Result<SessionOutcome> {
        let failed = result.is_err();
        self.set_phase(SessionPhase::Teardown);

        let file_sinks = active.file_sinks.min(active.sinks.len());
        Self::finish_sinks(&mut active.sinks[..file_sinks], &mut result);

        if active.armed {
            match self.coproc.set_off() {
                Err(e) => warn!(error = %e, "Failed to switch coprocessor off"),
                Ok(()) if !failed => {
                    match wait_bounded(&self.coproc.ready_event(), STOP_ACK_TIMEOUT) {
                        Ok(WaitOutcome::Ready) => debug!("Coprocessor acknowledged off"),
                        Ok(WaitOutcome::TimedOut) => {
                            warn!(timeout = ?STOP_ACK_TIMEOUT, "Coprocessor did not acknowledge off")
                        }
                        Err(e) => warn!(error = %e, "Waiting for off acknowledgment failed"),
                    }
                }
                Ok(()) => {}
            }
        }

        // unmap before the coprocessor is released
        drop(active.window.take());
        if let Err(e) = self.coproc.release() {
            warn!(error = %e, "Failed to release coprocessor");
        }

        Self::finish_sinks(&mut active.sinks[file_sinks..], &mut result);
        active.sinks.clear();

        let record = status.record_mut();
        record.set_sampling(false);
        record.set_state(if result.is_err() {
            SessionState::Error
        } else {
            SessionState::Off
        });
        status.publish();

        debug!(failed = result.is_err(), "Teardown complete");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_handle_shared() {
        let handle = StopHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_stop_requested());
        clone.request_stop();
        assert!(handle.is_stop_requested());
    }
}
