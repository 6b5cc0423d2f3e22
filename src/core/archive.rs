// Packaging of a segment directory into one compressed tar archive

use crate::core::compression::{compress, decompress};
use crate::core::constants::*;
use crate::core::error::{RelayError, Result};
use crate::core::queue::write_atomic;
use crate::core::segment::verify_segment;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

pub fn archive_file_name(segment_name: &str, compression: CompressionType) -> String {
    format!("{}.{}", segment_name, compression.extension())
}

/// Builds `<outbox>/<segment>.tar.*` from a ready segment. Entries are
/// stored under `<segment>/` in a fixed order with normalized headers, so
/// the same segment always yields the same archive bytes.
pub fn pack_segment(segment_dir: &Path, outbox: &Path, compression: CompressionType) -> Result<PathBuf> {
    verify_segment(segment_dir)?;

    let name = segment_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| RelayError::CorruptedSegment {
            segment: segment_dir.display().to_string(),
            reason: "segment path has no name".to_string(),
        })?;

    let mut builder = tar::Builder::new(Vec::new());
    builder.mode(tar::HeaderMode::Deterministic);
    for file in [META_FILE, TIME_FILE, VALUES_FILE, MANIFEST_FILE] {
        builder.append_path_with_name(segment_dir.join(file), format!("{}/{}", name, file))?;
    }
    let tar_bytes = builder.into_inner()?;

    let compressed = compress(&tar_bytes, compression)?;
    let target = outbox.join(archive_file_name(&name, compression));
    write_atomic(&target, &compressed)?;

    debug!(
        "Packed {} into {} ({} -> {} bytes)",
        name,
        target.display(),
        tar_bytes.len(),
        compressed.len()
    );
    Ok(target)
}

/// Lists `(entry path, contents)` of an archive.
pub fn read_archive(bytes: &[u8], compression: CompressionType) -> Result<Vec<(String, Vec<u8>)>> {
    let tar_bytes = decompress(bytes, compression)?;
    let mut archive = tar::Archive::new(tar_bytes.as_slice());

    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().to_string();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        entries.push((path, contents));
    }
    Ok(entries)
}
