//! Multi-resolution web preview segment.
//!
//! The segment holds three ring buffers with the same channel stream at
//! three temporal resolutions. Every tick goes into the fine ring; every
//! [`PREVIEW_FOLD`] fine elements are folded into one medium element and every
//! [`PREVIEW_FOLD`] medium elements into one coarse element (100:10:1).
//!
//! Folding uses the arithmetic mean (truncated toward zero) for analog
//! channels and the most recent value for digital inputs, so a folded digital
//! level is always a level that was actually observed.
//!
//! An element is one tick: the analog channels in layout order followed by
//! the digital inputs as 0/1. Range-valid flags are not previewed.
//!
//! # Layout
//!
//! ```text
//! time: i64 (UNIX ms of the newest buffer)
//! channel_count: u32, padding: u32
//! rings[3]: { element_size: u32, capacity: u32, filled: u32, head: u32,
//!             data: [i64; 12 * 1000] }
//! ```

use anyhow::{bail, Context, Result};
use std::mem::{offset_of, size_of};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use daq_core::channel::ChannelLayout;
use daq_core::limits::{PREVIEW_CHANNELS, PREVIEW_FOLD, PREVIEW_LEVELS, PREVIEW_POINTS};
use daq_core::pipeline::{BufferInfo, Tick, TickSink};

use crate::notifier::ConsumerNotifier;
use crate::segment::{SegmentLayout, SegmentReader, SharedSegment};

const RING_SLOTS: usize = PREVIEW_CHANNELS * PREVIEW_POINTS;

/// Bookkeeping of one ring, stored ahead of its elements.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RingHeader {
    element_size: u32,
    capacity: u32,
    filled: u32,
    head: u32,
}

// SAFETY: repr(C), integers only.
unsafe impl SegmentLayout for RingHeader {}

impl RingHeader {
    fn element_size(&self) -> usize {
        (self.element_size as usize).min(PREVIEW_CHANNELS)
    }

    fn capacity(&self) -> usize {
        (self.capacity as usize).clamp(1, PREVIEW_POINTS)
    }

    fn filled(&self) -> usize {
        (self.filled as usize).min(self.capacity())
    }

    fn head(&self) -> usize {
        self.head as usize % self.capacity()
    }

    /// Slot of the element `age` positions back from the newest.
    fn slot(&self, age: usize) -> Option<usize> {
        if age >= self.filled() {
            return None;
        }
        let capacity = self.capacity();
        Some((self.head() + capacity - 1 - age) % capacity)
    }
}

/// Fixed-capacity FIFO of preview elements; the oldest element is overwritten
/// when full.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PreviewRing {
    header: RingHeader,
    data: [i64; RING_SLOTS],
}

impl PreviewRing {
    /// Empty ring holding `capacity` elements of `element_size` values.
    ///
    /// Both are clamped to the fixed storage of the ring.
    pub fn reset(&mut self, element_size: usize, capacity: usize) {
        self.header = RingHeader {
            element_size: element_size.min(PREVIEW_CHANNELS) as u32,
            capacity: capacity.clamp(1, PREVIEW_POINTS) as u32,
            filled: 0,
            head: 0,
        };
    }

    /// Values per element.
    pub fn element_size(&self) -> usize {
        self.header.element_size()
    }

    /// Maximum number of elements.
    pub fn capacity(&self) -> usize {
        self.header.capacity()
    }

    /// Number of elements stored, saturating at the capacity.
    pub fn filled(&self) -> usize {
        self.header.filled()
    }

    /// Slot the next element is written to.
    pub fn head(&self) -> usize {
        self.header.head()
    }

    /// Append one element, overwriting the oldest when full.
    ///
    /// Missing values are stored as zero, extra values are dropped.
    pub fn push(&mut self, element: &[i64]) {
        let size = self.element_size();
        let start = self.head() * size;
        let slot = &mut self.data[start..start + size];
        let n = element.len().min(size);
        slot[..n].copy_from_slice(&element[..n]);
        slot[n..].fill(0);

        self.header.head = ((self.head() + 1) % self.capacity()) as u32;
        self.header.filled = (self.filled() + 1).min(self.capacity()) as u32;
    }

    /// Element `age` positions back from the newest (0 = newest).
    pub fn get(&self, age: usize) -> Option<&[i64]> {
        let slot = self.header.slot(age)?;
        let size = self.element_size();
        Some(&self.data[slot * size..(slot + 1) * size])
    }

    /// Copy all elements out, oldest first.
    pub fn to_vec(&self) -> Vec<Vec<i64>> {
        (0..self.filled())
            .rev()
            .filter_map(|age| self.get(age).map(<[i64]>::to_vec))
            .collect()
    }
}

/// Shared layout of the preview segment.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PreviewLayout {
    time: i64,
    channel_count: u32,
    _pad: u32,
    rings: [PreviewRing; PREVIEW_LEVELS],
}

// SAFETY: repr(C), integers only, all-zero is an empty segment.
unsafe impl SegmentLayout for PreviewLayout {}

/// Preview resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewLevel {
    /// Every tick.
    Fine = 0,
    /// Every 10 ticks.
    Medium = 1,
    /// Every 100 ticks.
    Coarse = 2,
}

#[derive(Debug, Default)]
struct FoldAccumulator {
    sums: Vec<i64>,
    last: Vec<i64>,
    count: usize,
}

impl FoldAccumulator {
    fn new(width: usize) -> Self {
        Self {
            sums: vec![0; width],
            last: vec![0; width],
            count: 0,
        }
    }

    /// Add one element; returns the folded element once the group is full.
    fn add(&mut self, element: &[i64], analog_count: usize) -> Option<Vec<i64>> {
        for (n, value) in element.iter().enumerate() {
            self.sums[n] += value;
            self.last[n] = *value;
        }
        self.count += 1;
        if self.count < PREVIEW_FOLD {
            return None;
        }

        let folded = self
            .sums
            .iter()
            .zip(&self.last)
            .enumerate()
            .map(|(n, (sum, last))| {
                if n < analog_count {
                    sum / PREVIEW_FOLD as i64
                } else {
                    *last
                }
            })
            .collect();
        self.sums.fill(0);
        self.count = 0;
        Some(folded)
    }
}

/// Writes ticks into the preview segment and wakes consumers per buffer.
pub struct PreviewPublisher<N: ConsumerNotifier> {
    segment: Option<SharedSegment<PreviewLayout>>,
    notifier: N,
    analog_count: usize,
    digital: Vec<usize>,
    element: Vec<i64>,
    folds: [FoldAccumulator; 2],
    buffers_published: u64,
}

impl<N: ConsumerNotifier> PreviewPublisher<N> {
    /// Create the segment at `path` and reset its rings for `layout`.
    pub fn create(path: impl AsRef<Path>, layout: &ChannelLayout, notifier: N) -> Result<Self> {
        let mut segment = SharedSegment::<PreviewLayout>::create_or_attach(path.as_ref())
            .context("Failed to create web preview segment")?;

        let digital: Vec<usize> = layout.digital_indices().collect();
        let width = layout.preview_channel_count();
        let analog_count = layout.analog.len().min(width);

        let shm = segment.get_mut();
        shm.time = 0;
        shm.channel_count = width as u32;
        for ring in shm.rings.iter_mut() {
            ring.reset(width, PREVIEW_POINTS);
        }

        info!(path = ?path.as_ref(), channels = width, "Created web preview segment");

        Ok(Self {
            segment: Some(segment),
            notifier,
            analog_count,
            digital,
            element: Vec::with_capacity(width),
            folds: [FoldAccumulator::new(width), FoldAccumulator::new(width)],
            buffers_published: 0,
        })
    }

    /// Buffers published so far.
    pub fn buffers_published(&self) -> u64 {
        self.buffers_published
    }
}

impl<N: ConsumerNotifier> TickSink for PreviewPublisher<N> {
    fn name(&self) -> &str {
        "web"
    }

    fn push_tick(&mut self, tick: &Tick<'_>) -> Result<()> {
        let Some(segment) = self.segment.as_mut() else {
            return Ok(());
        };

        self.element.clear();
        self.element
            .extend(tick.analog.iter().take(self.analog_count).map(|v| i64::from(*v)));
        self.element
            .extend(self.digital.iter().map(|&k| i64::from(tick.bit(k))));

        let shm = segment.get_mut();
        shm.rings[PreviewLevel::Fine as usize].push(&self.element);
        if let Some(medium) = self.folds[0].add(&self.element, self.analog_count) {
            shm.rings[PreviewLevel::Medium as usize].push(&medium);
            if let Some(coarse) = self.folds[1].add(&medium, self.analog_count) {
                shm.rings[PreviewLevel::Coarse as usize].push(&coarse);
            }
        }
        Ok(())
    }

    fn end_buffer(&mut self, info: &BufferInfo) -> Result<()> {
        if let Some(segment) = self.segment.as_mut() {
            segment.get_mut().time = info.timestamp.realtime_millis();
        }
        let released = self.notifier.notify_waiting()?;
        self.buffers_published += 1;
        trace!(buffer = info.index, released, "Published web preview");
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(segment) = self.segment.take() {
            segment.remove()?;
        }
        if let Err(e) = self.notifier.remove() {
            warn!(error = %e, "Failed to remove preview notifier");
        }
        debug!(buffers = self.buffers_published, "Detached web preview segment");
        Ok(())
    }
}

/// Copy of one preview ring taken by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewSnapshot {
    /// UNIX ms of the newest published buffer.
    pub time: i64,
    /// Values per element.
    pub channel_count: usize,
    /// Elements, oldest first.
    pub elements: Vec<Vec<i64>>,
}

/// Read-only consumer view of the preview segment.
pub struct PreviewReader {
    segment: SegmentReader<PreviewLayout>,
    notifier: Option<Box<dyn ConsumerNotifier>>,
}

impl PreviewReader {
    /// Attach to an existing preview segment.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let segment = SegmentReader::open(path.as_ref())
            .with_context(|| format!("No web preview segment at {:?}", path.as_ref()))?;
        Ok(Self {
            segment,
            notifier: None,
        })
    }

    /// Attach the notifier used by [`wait`](Self::wait).
    pub fn with_notifier(mut self, notifier: Box<dyn ConsumerNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Block until the publisher signals the next buffer, or `timeout` passes.
    ///
    /// Returns `false` on timeout. A release can be missed; callers should
    /// snapshot after a timeout as well.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        match &self.notifier {
            Some(notifier) => notifier.wait(timeout),
            None => bail!("Preview reader has no notifier attached"),
        }
    }

    /// Copy one ring out of the segment. The writer may be mid-update.
    ///
    /// Only the selected ring is read, element by element.
    pub fn snapshot(&self, level: PreviewLevel) -> PreviewSnapshot {
        let segment = &self.segment;
        let time = segment
            .load_at::<i64>(offset_of!(PreviewLayout, time))
            .unwrap_or_default();
        let channel_count = segment
            .load_at::<u32>(offset_of!(PreviewLayout, channel_count))
            .unwrap_or_default() as usize;

        let ring = offset_of!(PreviewLayout, rings) + level as usize * size_of::<PreviewRing>();
        let header = segment
            .load_at::<RingHeader>(ring + offset_of!(PreviewRing, header))
            .unwrap_or_default();
        let data = ring + offset_of!(PreviewRing, data);
        let size = header.element_size();
        let elements = (0..header.filled())
            .rev()
            .filter_map(|age| header.slot(age))
            .filter_map(|slot| {
                segment.load_slice_at::<i64>(data + slot * size * size_of::<i64>(), size)
            })
            .collect();

        PreviewSnapshot {
            time,
            channel_count: channel_count.min(PREVIEW_CHANNELS),
            elements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::InProcessNotifier;
    use daq_core::channel::AnalogInput;
    use daq_core::pipeline::BufferTimestamp;
    use tempfile::TempDir;

    fn small_ring(element_size: usize, capacity: usize) -> Box<PreviewRing> {
        let mut ring = Box::new(PreviewRing {
            header: RingHeader::default(),
            data: [0; RING_SLOTS],
        });
        ring.reset(element_size, capacity);
        ring
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let capacity = 4;
        for extra in [0usize, 1, 3, 9] {
            let mut ring = small_ring(2, capacity);
            let total = capacity + extra;
            for n in 0..total as i64 {
                ring.push(&[n, -n]);
            }
            assert_eq!(ring.filled(), capacity);
            let expected: Vec<Vec<i64>> = (extra..total)
                .map(|n| vec![n as i64, -(n as i64)])
                .collect();
            assert_eq!(ring.to_vec(), expected);
        }
    }

    #[test]
    fn test_ring_partial_fill() {
        let mut ring = small_ring(1, 4);
        assert!(ring.get(0).is_none());
        ring.push(&[7]);
        ring.push(&[8]);
        assert_eq!(ring.filled(), 2);
        assert_eq!(ring.get(0), Some(&[8][..]));
        assert_eq!(ring.get(1), Some(&[7][..]));
        assert_eq!(ring.head(), 2);
    }

    #[test]
    fn test_fold_mean_and_last() {
        let mut acc = FoldAccumulator::new(2);
        for n in 0..9 {
            assert!(acc.add(&[n, n % 2], 1).is_none());
        }
        let folded = acc.add(&[9, 1], 1).unwrap();
        // mean of 0..=9 is 4.5, truncated; digital keeps the last level
        assert_eq!(folded, vec![4, 1]);
        assert!(acc.add(&[1, 0], 1).is_none());
    }

    #[test]
    fn test_publisher_levels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("web");
        let layout = ChannelLayout::new(&[AnalogInput::V1], true, [false; 2]);
        let notifier = InProcessNotifier::new();
        let mut publisher = PreviewPublisher::create(&path, &layout, notifier.clone()).unwrap();

        let info = BufferInfo {
            index: 0,
            samples: 100,
            sample_rate: 100,
            timestamp: BufferTimestamp {
                realtime: (1, 0),
                monotonic: (0, 0),
            },
        };
        publisher.begin_buffer(&info).unwrap();
        for n in 0..100 {
            let analog = [n * 10];
            publisher
                .push_tick(&Tick {
                    index: n as u32,
                    binary: 0b10,
                    analog: &analog,
                })
                .unwrap();
        }
        publisher.end_buffer(&info).unwrap();

        let reader = PreviewReader::open(&path).unwrap();
        let fine = reader.snapshot(PreviewLevel::Fine);
        assert_eq!(fine.time, 1000);
        assert_eq!(fine.channel_count, 7);
        assert_eq!(fine.elements.len(), 100);
        assert_eq!(fine.elements[99], vec![990, 0, 1, 0, 0, 0, 0]);

        let medium = reader.snapshot(PreviewLevel::Medium);
        assert_eq!(medium.elements.len(), 10);
        assert_eq!(medium.elements[0][0], 45);
        assert_eq!(medium.elements[0][2], 1);

        let coarse = reader.snapshot(PreviewLevel::Coarse);
        assert_eq!(coarse.elements.len(), 1);
        assert_eq!(coarse.elements[0][0], 495);

        publisher.finish().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_snapshot_after_wrap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("web");
        let layout = ChannelLayout::new(&[AnalogInput::V1, AnalogInput::V2], false, [false; 2]);
        let mut publisher =
            PreviewPublisher::create(&path, &layout, InProcessNotifier::new()).unwrap();

        let total = PREVIEW_POINTS + 250;
        for n in 0..total as i32 {
            let analog = [n, -n];
            publisher
                .push_tick(&Tick {
                    index: n as u32,
                    binary: 0,
                    analog: &analog,
                })
                .unwrap();
        }

        let reader = PreviewReader::open(&path).unwrap();
        let fine = reader.snapshot(PreviewLevel::Fine);
        assert_eq!(fine.channel_count, 2);
        assert_eq!(fine.elements.len(), PREVIEW_POINTS);
        assert_eq!(fine.elements[0], vec![250, -250]);
        assert_eq!(
            fine.elements[PREVIEW_POINTS - 1],
            vec![total as i64 - 1, 1 - total as i64]
        );

        // 1250 ticks fold into 125 medium and 12 coarse elements
        assert_eq!(reader.snapshot(PreviewLevel::Medium).elements.len(), 125);
        let coarse = reader.snapshot(PreviewLevel::Coarse);
        assert_eq!(coarse.elements.len(), 12);
        assert_eq!(coarse.elements[0], vec![49, -49]);
        publisher.finish().unwrap();
    }

    #[test]
    fn test_reader_wait_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("web");
        let layout = ChannelLayout::new(&[AnalogInput::V1], false, [false; 2]);
        let notifier = InProcessNotifier::new();
        let mut publisher = PreviewPublisher::create(&path, &layout, notifier.clone()).unwrap();

        let reader = PreviewReader::open(&path).unwrap();
        assert!(reader.wait(Some(Duration::from_millis(5))).is_err());

        let reader = reader.with_notifier(Box::new(notifier));
        assert!(!reader.wait(Some(Duration::from_millis(10))).unwrap());
        publisher.finish().unwrap();
    }
}
