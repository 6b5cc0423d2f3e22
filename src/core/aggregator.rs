// Batch aggregation: raw batch files -> one TSDF segment

use crate::core::codec::{self, ValueRow};
use crate::core::error::{RelayError, Result};
use crate::core::format::{EncodingSettings, MetadataSettings, RawBatchFile, SampleRecord, SegmentMetadata};
use crate::core::queue::{move_replacing, QueueLayout};
use crate::core::segment::{publish_segment, EncodedSegment};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct AggregatorSettings {
    pub metadata: MetadataSettings,
    pub encoding: EncodingSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutcome {
    /// No raw batches were waiting.
    Idle,
    /// Batches held no usable records; they were removed.
    Discarded { batches: usize },
    Produced { index: u64, rows: usize, dir: PathBuf },
}

pub struct Aggregator {
    layout: QueueLayout,
    settings: AggregatorSettings,
    next_index: u64,
}

impl Aggregator {
    /// Recovers the next segment index from disk; nothing is carried over
    /// from a previous run.
    pub fn open(layout: QueueLayout, settings: AggregatorSettings) -> Result<Self> {
        codec::value_width(settings.encoding.value_bits)?;
        layout.ensure()?;
        layout.clear_partials(&layout.output_dir)?;
        let next_index = layout.next_segment_index()?;

        info!("Aggregator ready: next segment index {}", next_index);
        Ok(Self {
            layout,
            settings,
            next_index,
        })
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn run_pass(&mut self) -> Result<AggregateOutcome> {
        let batches = self.layout.list_raw_batches()?;
        if batches.is_empty() {
            return Ok(AggregateOutcome::Idle);
        }

        let mut consumed = Vec::with_capacity(batches.len());
        let mut records = Vec::new();
        for (_, path) in &batches {
            match read_batch(path)? {
                Some(batch) => {
                    records.extend(batch);
                    consumed.push(path.clone());
                }
                None => self.quarantine_batch(path)?,
            }
        }

        let mut usable: Vec<(DateTime<Utc>, SampleRecord)> = Vec::with_capacity(records.len());
        let mut dropped = 0;
        for record in records {
            match record.validate() {
                Ok(ts) => usable.push((ts, record)),
                Err(e) => {
                    dropped += 1;
                    warn!("Dropping unusable record: {}", e);
                }
            }
        }
        if dropped > 0 {
            warn!("Dropped {} unusable records from {} batches", dropped, consumed.len());
        }

        if usable.is_empty() {
            remove_batches(&consumed);
            info!("No usable records in {} batches, nothing to transform", consumed.len());
            return Ok(AggregateOutcome::Discarded {
                batches: consumed.len(),
            });
        }

        usable.sort_by_key(|(ts, _)| *ts);
        let segment = encode_segment(&usable, &self.settings)?;

        let index = self.next_index.max(self.layout.next_segment_index()?);
        let dir = publish_segment(&self.layout.output_dir, index, &segment)?;

        // Artifacts are durable; only now may the inputs go.
        remove_batches(&consumed);
        self.next_index = index + 1;

        let rows = segment.metadata.rows;
        info!(
            "Segment {} created in {} ({} rows from {} batches)",
            index,
            dir.display(),
            rows,
            consumed.len()
        );
        Ok(AggregateOutcome::Produced { index, rows, dir })
    }

    fn quarantine_batch(&self, path: &Path) -> Result<()> {
        let name = match path.file_name() {
            Some(name) => name.to_owned(),
            None => return Ok(()),
        };
        let target = self.layout.quarantine_dir.join(name);
        move_replacing(path, &target)?;
        error!("Unreadable raw batch moved to {}", target.display());
        Ok(())
    }

    /// Runs a pass every `interval` until cancelled. A pass in progress
    /// always finishes before shutdown.
    pub async fn run_loop(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_pass() {
                        Ok(AggregateOutcome::Idle) => info!("No raw batches to process, waiting"),
                        Ok(_) => {}
                        Err(e) => error!("Aggregation pass failed: {}", e),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Aggregator shutting down");
                    break;
                }
            }
        }
    }
}

/// `Ok(None)` marks a file that exists but is not a raw batch.
fn read_batch(path: &Path) -> Result<Option<Vec<SampleRecord>>> {
    let bytes = fs::read(path)?;
    match serde_json::from_slice::<RawBatchFile>(&bytes) {
        Ok(batch) => Ok(Some(batch.into_records())),
        Err(e) => {
            error!("Cannot parse raw batch {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

fn remove_batches(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            error!("Failed to remove consumed batch {}: {}", path.display(), e);
        }
    }
}

fn offset_ms(ts: &DateTime<Utc>, start: &DateTime<Utc>) -> f64 {
    let delta = *ts - *start;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1000.0,
        None => delta.num_milliseconds() as f64,
    }
}

/// Encodes time-sorted records. Scale factors are applied here and
/// nowhere else.
pub fn encode_segment(
    sorted: &[(DateTime<Utc>, SampleRecord)],
    settings: &AggregatorSettings,
) -> Result<EncodedSegment> {
    let (start, end) = match (sorted.first(), sorted.last()) {
        (Some((first, _)), Some((last, _))) => (*first, *last),
        _ => return Err(RelayError::InvalidRecord("no records to encode".to_string())),
    };

    let encoding = &settings.encoding;
    let offsets: Vec<f64> = sorted.iter().map(|(ts, _)| offset_ms(ts, &start)).collect();
    let rows: Vec<ValueRow> = sorted
        .iter()
        .map(|(_, record)| codec::apply_scale(record.channels(), &encoding.scale_factors))
        .collect();

    Ok(EncodedSegment {
        time: codec::encode_time_channel(&offsets, encoding.endianness),
        values: codec::encode_value_channel(&rows, encoding.endianness, encoding.value_bits)?,
        metadata: SegmentMetadata::build(&settings.metadata, encoding, &start, &end, sorted.len()),
    })
}
