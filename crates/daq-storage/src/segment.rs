#![allow(unsafe_code)]
//! File-backed shared memory segments.
//!
//! A segment holds exactly one `#[repr(C)]` value of a [`SegmentLayout`] type
//! in a memory-mapped file (by default under `/dev/shm`). One process writes
//! it through [`SharedSegment`]; any number of processes map it read-only
//! through [`SegmentReader`]. There is no cross-process locking: readers must
//! tolerate torn values and copy what they need before processing.

use anyhow::{anyhow, Context, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::io;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Marker for types that can live in a shared segment.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers or references, and
/// be valid for every bit pattern (in particular all zeros, which is the
/// content of a freshly created segment).
pub unsafe trait SegmentLayout: Copy + 'static {}

// SAFETY: plain integers.
unsafe impl SegmentLayout for u32 {}
unsafe impl SegmentLayout for i64 {}

/// Writable mapping of a shared segment.
pub struct SharedSegment<T: SegmentLayout> {
    path: PathBuf,
    mmap: MmapMut,
    _layout: PhantomData<T>,
}

impl<T: SegmentLayout> SharedSegment<T> {
    /// Attach to the segment at `path`, creating and zero-filling it if absent.
    pub fn create_or_attach(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = size_of::<T>();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open segment {:?}", path))?;

        let existing = file.metadata()?.len();
        if existing != size as u64 {
            if existing != 0 {
                debug!(path = ?path, existing, size, "Resizing shared segment");
            }
            file.set_len(size as u64)
                .with_context(|| format!("Failed to size segment {:?}", path))?;
        }

        // SAFETY: the file is sized to hold one T; external truncation while
        // mapped is outside the supported usage of the segment.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .with_context(|| format!("Failed to map segment {:?}", path))?;

        Ok(Self {
            path,
            mmap,
            _layout: PhantomData,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the whole value with a single memory copy.
    pub fn store(&mut self, value: &T) {
        // SAFETY: the mapping is page aligned and exactly size_of::<T>() long.
        unsafe { std::ptr::write_volatile(self.mmap.as_mut_ptr().cast::<T>(), *value) }
    }

    /// Copy the current value out of the segment.
    pub fn load(&self) -> T {
        // SAFETY: as in `store`; every bit pattern is a valid T.
        unsafe { std::ptr::read_volatile(self.mmap.as_ptr().cast::<T>()) }
    }

    /// Mutable access to the mapped value.
    ///
    /// Other processes may read concurrently; this process is the only writer.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: as in `store`; the borrow is tied to &mut self.
        unsafe { &mut *self.mmap.as_mut_ptr().cast::<T>() }
    }

    /// Unmap and delete the backing file.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("Failed to remove segment {:?}: {}", path, e)),
        }
    }
}

/// Read-only mapping of a shared segment.
pub struct SegmentReader<T: SegmentLayout> {
    mmap: Mmap,
    _layout: PhantomData<T>,
}

impl<T: SegmentLayout> SegmentReader<T> {
    /// Attach to an existing segment without creating it.
    ///
    /// A missing segment surfaces as `io::ErrorKind::NotFound`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        if file.metadata()?.len() < size_of::<T>() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared segment is smaller than its layout",
            ));
        }

        // SAFETY: length checked above; the mapping is read-only.
        let mmap = unsafe { MmapOptions::new().len(size_of::<T>()).map(&file)? };
        Ok(Self {
            mmap,
            _layout: PhantomData,
        })
    }

    /// Copy the current value out of the segment.
    pub fn load(&self) -> T {
        // SAFETY: mapping is aligned and sized for T; every bit pattern is valid.
        unsafe { std::ptr::read_volatile(self.mmap.as_ptr().cast::<T>()) }
    }

    /// Copy the `U` stored `offset` bytes into the segment.
    ///
    /// Returns `None` unless the value lies aligned inside the layout.
    pub fn load_at<U: SegmentLayout>(&self, offset: usize) -> Option<U> {
        let ptr = self.field_ptr::<U>(offset, 1)?;
        // SAFETY: in bounds and aligned; every bit pattern is a valid U.
        Some(unsafe { std::ptr::read_volatile(ptr) })
    }

    /// Copy `count` consecutive values of `U` starting `offset` bytes in.
    ///
    /// Reads only that range, so large layouts never need a full copy.
    pub fn load_slice_at<U: SegmentLayout>(&self, offset: usize, count: usize) -> Option<Vec<U>> {
        let ptr = self.field_ptr::<U>(offset, count)?;
        let values = (0..count)
            // SAFETY: as in `load_at`, for each of the `count` values.
            .map(|n| unsafe { std::ptr::read_volatile(ptr.add(n)) })
            .collect();
        Some(values)
    }

    fn field_ptr<U: SegmentLayout>(&self, offset: usize, count: usize) -> Option<*const U> {
        let end = size_of::<U>().checked_mul(count)?.checked_add(offset)?;
        // the mapping itself is page aligned
        if end > size_of::<T>() || offset % align_of::<U>() != 0 {
            return None;
        }
        Some(self.mmap.as_ptr().wrapping_add(offset).cast::<U>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Counter {
        value: u64,
        flag: u32,
        _pad: u32,
    }

    unsafe impl SegmentLayout for Counter {}

    #[test]
    fn test_create_store_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter");

        let mut segment = SharedSegment::<Counter>::create_or_attach(&path).unwrap();
        assert_eq!(segment.load().value, 0);

        segment.store(&Counter {
            value: 42,
            flag: 1,
            _pad: 0,
        });

        let reader = SegmentReader::<Counter>::open(&path).unwrap();
        assert_eq!(reader.load().value, 42);

        segment.get_mut().value = 43;
        assert_eq!(reader.load().value, 43);

        // attach keeps existing content
        let again = SharedSegment::<Counter>::create_or_attach(&path).unwrap();
        assert_eq!(again.load().flag, 1);
    }

    #[test]
    fn test_load_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter");

        let mut segment = SharedSegment::<Counter>::create_or_attach(&path).unwrap();
        segment.store(&Counter {
            value: 9,
            flag: 3,
            _pad: 0,
        });

        let reader = SegmentReader::<Counter>::open(&path).unwrap();
        assert_eq!(reader.load_at::<i64>(0), Some(9));
        assert_eq!(reader.load_at::<u32>(8), Some(3));
        assert_eq!(reader.load_slice_at::<u32>(8, 2), Some(vec![3, 0]));

        // past the end or misaligned
        assert_eq!(reader.load_at::<u32>(16), None);
        assert_eq!(reader.load_slice_at::<u32>(8, 3), None);
        assert_eq!(reader.load_at::<i64>(4), None);
        assert_eq!(reader.load_slice_at::<u32>(usize::MAX, 1), None);
    }

    #[test]
    fn test_missing_segment() {
        let dir = TempDir::new().unwrap();
        let err = SegmentReader::<Counter>::open(dir.path().join("absent"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter");
        let segment = SharedSegment::<Counter>::create_or_attach(&path).unwrap();
        segment.remove().unwrap();
        assert!(!path.exists());
    }
}
