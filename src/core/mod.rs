pub mod aggregator;
pub mod archive;
pub mod codec;
pub mod compression;
pub mod constants;
pub mod error;
pub mod format;
pub mod queue;
pub mod reassembler;
pub mod segment;
pub mod uploader;
