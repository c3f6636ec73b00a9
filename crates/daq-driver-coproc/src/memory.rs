#![allow(unsafe_code)]
//! Coprocessor shared memory and the double-buffer window over it.
//!
//! The coprocessor writes sample buffers into a memory region that is also
//! mapped into the host process. The host reads the region through a
//! [`BufferWindow`], which knows the position of the two buffer slots and
//! copies a slot's payload out exactly once per buffer.
//!
//! ```text
//! offset 0                      buffer_bytes                 2 * buffer_bytes
//! ┌─────┬──────────────────────┬─────┬──────────────────────┐
//! │ seq │ ticks (slot 0)       │ seq │ ticks (slot 1)       │
//! └─────┴──────────────────────┴─────┴──────────────────────┘
//! ```

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use daq_core::limits::SEQUENCE_BYTES;

use crate::error::{CoprocError, Result};

/// A memory region shared with the coprocessor.
///
/// All accesses are volatile: the coprocessor writes the region concurrently
/// and the host only relies on the ready event for ordering.
pub struct HardwareMemory {
    // keeps the mapping alive for `base`
    _mmap: MmapMut,
    base: *mut u8,
    len: usize,
}

// SAFETY: the pointer refers to the owned mapping, which lives as long as
// `self`. All accesses are bounds-checked volatile reads and writes.
unsafe impl Send for HardwareMemory {}
// SAFETY: see above; concurrent access is inherent to the shared region.
unsafe impl Sync for HardwareMemory {}

impl HardwareMemory {
    /// Map `len` bytes of a device file (for example a UIO region) at `offset`.
    pub fn open(path: impl AsRef<Path>, offset: u64, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        // SAFETY: the region is device memory owned by the coprocessor, no
        // other host-side mapping aliases it.
        let mmap = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(&file)? };
        debug!(path = ?path.as_ref(), offset, len, "Mapped coprocessor memory");
        Ok(Self::from_mmap(mmap))
    }

    /// Anonymous region of `len` bytes, used by the simulated coprocessor.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        let mmap = MmapOptions::new().len(len).map_anon()?;
        Ok(Self::from_mmap(mmap))
    }

    fn from_mmap(mut mmap: MmapMut) -> Self {
        let len = mmap.len();
        let base = mmap.as_mut_ptr();
        Self {
            _mmap: mmap,
            base,
            len,
        }
    }

    /// Region size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(CoprocError::Mapping {
                message: format!(
                    "access of {} bytes at {} outside region of {} bytes",
                    len, offset, self.len
                ),
            }),
        }
    }

    /// Volatile little-endian `u32` read.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.copy_out(offset, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the region.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        for (n, byte) in dst.iter_mut().enumerate() {
            // SAFETY: bounds checked above.
            *byte = unsafe { ptr::read_volatile(self.base.add(offset + n)) };
        }
        Ok(())
    }

    /// Write `src` into the region at `offset` (coprocessor side).
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        for (n, byte) in src.iter().enumerate() {
            // SAFETY: bounds checked above.
            unsafe { ptr::write_volatile(self.base.add(offset + n), *byte) };
        }
        Ok(())
    }
}

/// Host view of the two buffer slots.
pub struct BufferWindow {
    memory: Arc<HardwareMemory>,
    buffer_bytes: usize,
    scratch: Vec<u8>,
}

impl BufferWindow {
    /// Lay two slots of `buffer_bytes` over `memory`.
    pub fn new(memory: Arc<HardwareMemory>, buffer_bytes: usize) -> Result<Self> {
        let required = 2 * buffer_bytes;
        if required > memory.len() {
            return Err(CoprocError::MemoryTooSmall {
                required,
                available: memory.len(),
            });
        }
        Ok(Self {
            memory,
            buffer_bytes,
            scratch: vec![0; buffer_bytes.saturating_sub(SEQUENCE_BYTES)],
        })
    }

    /// Byte offset of `slot` (0 or 1) inside the region.
    pub fn slot_offset(&self, slot: usize) -> usize {
        (slot % 2) * self.buffer_bytes
    }

    /// Both slot offsets, as handed to the coprocessor program.
    pub fn slot_offsets(&self) -> [usize; 2] {
        [self.slot_offset(0), self.slot_offset(1)]
    }

    /// Size of one slot in bytes.
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// Sequence counter stored at the start of `slot`.
    pub fn read_sequence(&self, slot: usize) -> Result<u32> {
        self.memory.read_u32(self.slot_offset(slot))
    }

    /// Copy the first `len` payload bytes of `slot` into host memory.
    pub fn drain(&mut self, slot: usize, len: usize) -> Result<&[u8]> {
        let len = len.min(self.scratch.len());
        let offset = self.slot_offset(slot) + SEQUENCE_BYTES;
        self.memory.copy_out(offset, &mut self.scratch[..len])?;
        Ok(&self.scratch[..len])
    }
}
