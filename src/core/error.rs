// Error handling for the segment pipeline

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid sample record: {0}")]
    InvalidRecord(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Missing artifact {file} in {segment}")]
    MissingArtifact { segment: String, file: String },

    #[error("Corrupted segment {segment}: {reason}")]
    CorruptedSegment { segment: String, reason: String },

    #[error("Segment already exists: {0}")]
    SegmentExists(PathBuf),

    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Reassembler is shut down")]
    Closed,
}

impl RelayError {
    /// True when the input itself was refused, as opposed to a failure to
    /// persist an accepted record.
    pub fn is_rejected_input(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidRecord(_) | RelayError::InvalidTimestamp(_) | RelayError::Closed
        )
    }
}
