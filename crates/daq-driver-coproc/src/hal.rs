//! Hardware abstraction for the sampling coprocessor.
//!
//! The sampling loop only needs four things from the hardware: the shared
//! memory region, a way to load and start a program, a buffer-ready event
//! and a way to switch the coprocessor off. Implementations exist for the
//! simulated coprocessor; a device backend implements the same trait.

use std::sync::Arc;

use crate::command::CoprocessorProgram;
use crate::error::Result;
use crate::memory::HardwareMemory;

/// Buffer-ready event raised by the coprocessor.
///
/// Handles are cloneable so a wait can run on a helper thread while the
/// caller enforces a deadline.
pub trait ReadyEvent: Clone + Send + 'static {
    /// Block until the coprocessor signals the next event.
    fn wait(&self) -> Result<()>;

    /// Acknowledge the last event.
    fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// The sampling coprocessor.
pub trait Coprocessor: Send {
    /// Event handle type.
    type Event: ReadyEvent;

    /// Short name for log messages.
    fn name(&self) -> &str;

    /// Size of the shared memory region in bytes.
    fn memory_size(&self) -> usize;

    /// Map the shared memory region into the host.
    fn map_memory(&mut self) -> Result<Arc<HardwareMemory>>;

    /// Handle to the buffer-ready event.
    fn ready_event(&self) -> Self::Event;

    /// Write the program block and start the coprocessor.
    fn load(&mut self, program: &CoprocessorProgram) -> Result<()>;

    /// Command the coprocessor off. It acknowledges with one more event.
    fn set_off(&mut self) -> Result<()>;

    /// Disable the coprocessor and release its resources.
    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}
