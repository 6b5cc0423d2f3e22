// TSDF relay: IMU fragments in, uploaded segment archives out
// Main library entry point

pub mod core;

// Re-export main types
pub use core::aggregator::{AggregateOutcome, Aggregator, AggregatorSettings};
pub use core::error::{RelayError, Result};
pub use core::format::{Axes, SampleRecord, SegmentMetadata};
pub use core::queue::QueueLayout;
pub use core::reassembler::{DecodeOutcome, FragmentDecoder, Reassembler, ReassemblerSettings};
pub use core::segment::{read_segment, SegmentData};
pub use core::uploader::{Destination, IngestClient, PassReport, Uploader, UploaderSettings};
