//! Recording files and shared-memory publishers of the data logger.
//!
//! - [`file_header`] / [`binary_writer`]: self-describing binary recording with
//!   a header whose counters are rewritten in place after every block
//! - [`csv_writer`]: text export, header written once
//! - [`status`]: shared status record (create-or-attach, advisory)
//! - [`preview`] / [`notifier`]: three-level web preview rings and consumer wake-up
//! - [`segment`]: memory-mapped segment plumbing shared by the publishers

pub mod binary_writer;
pub mod csv_writer;
pub mod file_header;
pub mod notifier;
pub mod preview;
pub mod segment;
pub mod status;

pub use binary_writer::{BinaryFileWriter, WriterStats};
pub use csv_writer::CsvFileWriter;
pub use file_header::{update_counters, ChannelDescriptor, FileHeader, LeadIn};
pub use notifier::{ConsumerNotifier, InProcessNotifier, SemaphoreNotifier};
pub use preview::{PreviewLevel, PreviewPublisher, PreviewReader, PreviewSnapshot};
pub use segment::{SegmentLayout, SegmentReader, SharedSegment};
pub use status::{
    disk_usage_for_file, is_sampling, read_status, ConfigSnapshot, DiskUsage, SessionState,
    StatusPublisher, StatusRecord, StatusReport,
};
