// Segment directories: publishing, readiness check, read-back

use crate::core::codec::{self, ValueRow};
use crate::core::constants::*;
use crate::core::error::{RelayError, Result};
use crate::core::format::{ArtifactEntry, SegmentManifest, SegmentMetadata};
use crate::core::queue::{partial_path, sync_dir, write_synced};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct EncodedSegment {
    pub time: Vec<u8>,
    pub values: Vec<u8>,
    pub metadata: SegmentMetadata,
}

#[derive(Debug, Clone)]
pub struct SegmentData {
    pub metadata: SegmentMetadata,
    pub time_ms: Vec<f64>,
    pub values: Vec<ValueRow>,
}

impl SegmentData {
    pub fn len(&self) -> usize {
        self.time_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ms.is_empty()
    }
}

/// Writes all artifacts into a hidden staging directory, then renames it
/// to `segment{index}`. The manifest is the last file written.
pub fn publish_segment(output_dir: &Path, index: u64, segment: &EncodedSegment) -> Result<PathBuf> {
    let target = output_dir.join(segment_dir_name(index));
    if target.exists() {
        return Err(RelayError::SegmentExists(target));
    }

    let staging = partial_path(&target);
    fs::create_dir(&staging)?;

    if let Err(e) = write_artifacts(&staging, segment) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    if let Err(e) = fs::rename(&staging, &target) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e.into());
    }
    sync_dir(output_dir)?;

    debug!("Published {}", target.display());
    Ok(target)
}

fn write_artifacts(dir: &Path, segment: &EncodedSegment) -> Result<()> {
    let meta_bytes = serde_json::to_vec_pretty(&segment.metadata)?;

    write_synced(&dir.join(TIME_FILE), &segment.time)?;
    write_synced(&dir.join(VALUES_FILE), &segment.values)?;
    write_synced(&dir.join(META_FILE), &meta_bytes)?;

    let manifest = SegmentManifest {
        version: MANIFEST_VERSION,
        rows: segment.metadata.rows,
        artifacts: vec![
            ArtifactEntry {
                file_name: TIME_FILE.to_string(),
                bytes: segment.time.len() as u64,
            },
            ArtifactEntry {
                file_name: VALUES_FILE.to_string(),
                bytes: segment.values.len() as u64,
            },
            ArtifactEntry {
                file_name: META_FILE.to_string(),
                bytes: meta_bytes.len() as u64,
            },
        ],
    };
    write_synced(&dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(&manifest)?)?;
    sync_dir(dir)
}

fn segment_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.display().to_string())
}

fn corrupted(dir: &Path, reason: impl Into<String>) -> RelayError {
    RelayError::CorruptedSegment {
        segment: segment_name(dir),
        reason: reason.into(),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(dir: &Path, file: &str) -> Result<T> {
    let path = dir.join(file);
    if !path.is_file() {
        return Err(RelayError::MissingArtifact {
            segment: segment_name(dir),
            file: file.to_string(),
        });
    }
    let bytes = fs::read(&path)?;
    serde_json::from_slice(&bytes).map_err(|e| corrupted(dir, format!("{}: {}", file, e)))
}

/// Readiness predicate: every artifact present, sizes agree with the
/// manifest, and both streams hold exactly `rows` rows.
pub fn verify_segment(dir: &Path) -> Result<(SegmentManifest, SegmentMetadata)> {
    for file in [TIME_FILE, VALUES_FILE, META_FILE, MANIFEST_FILE] {
        if !dir.join(file).is_file() {
            return Err(RelayError::MissingArtifact {
                segment: segment_name(dir),
                file: file.to_string(),
            });
        }
    }

    let manifest: SegmentManifest = read_json(dir, MANIFEST_FILE)?;
    let metadata: SegmentMetadata = read_json(dir, META_FILE)?;

    if manifest.rows != metadata.rows {
        return Err(corrupted(
            dir,
            format!("manifest rows {} != metadata rows {}", manifest.rows, metadata.rows),
        ));
    }

    for artifact in &manifest.artifacts {
        let actual = fs::metadata(dir.join(&artifact.file_name))
            .map_err(|_| RelayError::MissingArtifact {
                segment: segment_name(dir),
                file: artifact.file_name.clone(),
            })?
            .len();
        if actual != artifact.bytes {
            return Err(corrupted(
                dir,
                format!("{} is {} bytes, manifest says {}", artifact.file_name, actual, artifact.bytes),
            ));
        }
    }

    let value_bits = metadata
        .sensor(VALUES_FILE)
        .map(|s| s.bits)
        .ok_or_else(|| corrupted(dir, "metadata has no value sensor"))?;

    let time_len = fs::metadata(dir.join(TIME_FILE))?.len();
    if time_len != codec::time_stream_len(metadata.rows) {
        return Err(corrupted(dir, format!("time stream has {} bytes for {} rows", time_len, metadata.rows)));
    }
    let values_len = fs::metadata(dir.join(VALUES_FILE))?.len();
    if values_len != codec::value_stream_len(metadata.rows, value_bits)? {
        return Err(corrupted(dir, format!("value stream has {} bytes for {} rows", values_len, metadata.rows)));
    }

    Ok((manifest, metadata))
}

pub fn read_segment(dir: &Path) -> Result<SegmentData> {
    let (_, metadata) = verify_segment(dir)?;
    let value_bits = metadata
        .sensor(VALUES_FILE)
        .map(|s| s.bits)
        .ok_or_else(|| corrupted(dir, "metadata has no value sensor"))?;

    let time_ms = codec::decode_time_channel(&fs::read(dir.join(TIME_FILE))?, metadata.endianness)?;
    let values = codec::decode_value_channel(
        &fs::read(dir.join(VALUES_FILE))?,
        metadata.endianness,
        value_bits,
    )?;

    Ok(SegmentData {
        metadata,
        time_ms,
        values,
    })
}
