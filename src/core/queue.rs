// Directory queue shared by the three pipeline stages
//
// Membership in an area plus the naming convention is the queue. Producers
// publish by whole-file write or whole-directory rename; in-progress work
// lives under dot-prefixed names that no listing picks up.

use crate::core::constants::*;
use crate::core::error::Result;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct QueueLayout {
    pub buffer_dir: PathBuf,
    pub output_dir: PathBuf,
    pub sent_dir: PathBuf,
    pub quarantine_dir: PathBuf,
}

impl QueueLayout {
    pub fn new(
        buffer_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        sent_dir: impl Into<PathBuf>,
        quarantine_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            buffer_dir: buffer_dir.into(),
            output_dir: output_dir.into(),
            sent_dir: sent_dir.into(),
            quarantine_dir: quarantine_dir.into(),
        }
    }

    /// Conventional layout under one base directory.
    pub fn under(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        let output = base.join("tsdf_output");
        Self::new(
            base.join("buffer"),
            output.clone(),
            output.join("sent"),
            output.join("quarantine"),
        )
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.buffer_dir,
            &self.output_dir,
            &self.sent_dir,
            &self.quarantine_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        fs::create_dir_all(self.outbox_dir())?;
        Ok(())
    }

    /// Staging area for archives that are not yet confirmed sent.
    pub fn outbox_dir(&self) -> PathBuf {
        self.output_dir.join(".outbox")
    }

    pub fn list_raw_batches(&self) -> Result<Vec<(u64, PathBuf)>> {
        list_entries(&self.buffer_dir, |name, is_dir| {
            if is_dir {
                None
            } else {
                parse_raw_batch_index(name)
            }
        })
    }

    pub fn list_segments(&self) -> Result<Vec<(u64, PathBuf)>> {
        list_entries(&self.output_dir, |name, is_dir| {
            if is_dir {
                parse_segment_index(name)
            } else {
                None
            }
        })
    }

    pub fn next_batch_index(&self) -> Result<u64> {
        let mut max = max_index(&self.buffer_dir, |name, _| parse_raw_batch_index(name))?;
        max = max.max(max_index(&self.quarantine_dir, |name, _| {
            parse_raw_batch_index(name)
        })?);
        Ok(max.map_or(0, |m| m + 1))
    }

    /// One past the highest segment index materialized anywhere on disk:
    /// pending directories, sent archives, and quarantined segments.
    pub fn next_segment_index(&self) -> Result<u64> {
        let segment_or_archive = |name: &str, is_dir: bool| {
            if is_dir {
                parse_segment_index(name)
            } else {
                parse_archive_index(name)
            }
        };

        let max = [
            max_index(&self.output_dir, segment_or_archive)?,
            max_index(&self.sent_dir, segment_or_archive)?,
            max_index(&self.quarantine_dir, segment_or_archive)?,
            max_index(&self.outbox_dir(), segment_or_archive)?,
        ]
        .into_iter()
        .flatten()
        .max();

        Ok(max.map_or(0, |m| m + 1))
    }

    /// Removes leftovers of interrupted writes in one area. Each stage
    /// clears only the area it produces into.
    pub fn clear_partials(&self, dir: &Path) -> Result<usize> {
        let mut removed = 0;
        if !dir.exists() {
            return Ok(removed);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_partial_name(&name) {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            warn!("Removed interrupted write {}", path.display());
            removed += 1;
        }
        Ok(removed)
    }
}

fn list_entries<F>(dir: &Path, parse: F) -> Result<Vec<(u64, PathBuf)>>
where
    F: Fn(&str, bool) -> Option<u64>,
{
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let is_dir = entry.file_type()?.is_dir();
        if let Some(index) = parse(&name, is_dir) {
            found.push((index, entry.path()));
        }
    }

    found.sort_by(|(a, pa), (b, pb)| a.cmp(b).then_with(|| pa.cmp(pb)));
    Ok(found)
}

fn max_index<F>(dir: &Path, parse: F) -> Result<Option<u64>>
where
    F: Fn(&str, bool) -> Option<u64>,
{
    Ok(list_entries(dir, parse)?.last().map(|(i, _)| *i))
}

pub fn is_partial_name(name: &str) -> bool {
    name.starts_with(PARTIAL_PREFIX) && name.ends_with(PARTIAL_SUFFIX)
}

/// Sibling path used while `target` is being produced.
pub fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(
        "{}{}.{}{}",
        PARTIAL_PREFIX,
        name,
        uuid::Uuid::new_v4().simple(),
        PARTIAL_SUFFIX
    ))
}

/// Whole-file write: readers either see nothing or the complete file.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = partial_path(target);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Some(parent) = parent_dir(target) {
        sync_dir(parent)?;
    }
    debug!("Wrote {} ({} bytes)", target.display(), bytes.len());
    Ok(())
}

pub fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Renames `from` onto `to`, replacing whatever a previous interrupted
/// move left there.
pub fn move_replacing(from: &Path, to: &Path) -> Result<()> {
    match fs::symlink_metadata(to) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(to)?,
        Ok(_) if cfg!(windows) => fs::remove_file(to)?,
        _ => {}
    }
    fs::rename(from, to)?;
    if let Some(parent) = parent_dir(to) {
        sync_dir(parent)?;
    }
    Ok(())
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
