// Sample reassembly: transport fragments -> records -> raw batch files

use crate::core::constants::{raw_batch_file_name, DEFAULT_BATCH_SIZE, DEFAULT_MAX_FRAGMENT_BYTES};
use crate::core::error::{RelayError, Result};
use crate::core::format::SampleRecord;
use crate::core::queue::{write_atomic, QueueLayout};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Result of one decode attempt over the reassembly buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Complete(SampleRecord),
    /// More fragments are needed; the buffer is kept.
    Incomplete,
    /// The buffered bytes can never form a record; they were dropped.
    Invalid(String),
}

pub struct FragmentDecoder {
    buffer: Vec<u8>,
    max_bytes: usize,
}

impl FragmentDecoder {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_bytes,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends one fragment and decodes every record now complete.
    /// A record that parses but fails validation is skipped and decoding
    /// goes on; it stops once more bytes are needed or nothing is buffered.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<DecodeOutcome> {
        self.buffer.extend_from_slice(fragment);

        let mut outcomes = Vec::new();
        loop {
            let outcome = self.decode_next();
            let done = match outcome {
                DecodeOutcome::Complete(_) => false,
                DecodeOutcome::Incomplete => true,
                DecodeOutcome::Invalid(_) => self.buffer.is_empty(),
            };
            outcomes.push(outcome);
            if done {
                break;
            }
        }
        outcomes
    }

    fn decode_next(&mut self) -> DecodeOutcome {
        match self.buffer.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => {
                self.buffer.drain(..start);
            }
            None => {
                self.buffer.clear();
                return DecodeOutcome::Incomplete;
            }
        }

        let (result, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<SampleRecord>();
            let result = stream.next();
            (result, stream.byte_offset())
        };

        match result {
            None => DecodeOutcome::Incomplete,
            Some(Ok(record)) => {
                self.buffer.drain(..consumed);
                match record.validate() {
                    Ok(_) => DecodeOutcome::Complete(record),
                    Err(e) => DecodeOutcome::Invalid(e.to_string()),
                }
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buffer.len() > self.max_bytes {
                    let dropped = self.buffer.len();
                    self.buffer.clear();
                    DecodeOutcome::Invalid(format!(
                        "{} buffered bytes without a complete record (limit {})",
                        dropped, self.max_bytes
                    ))
                } else {
                    DecodeOutcome::Incomplete
                }
            }
            Some(Err(e)) => {
                self.buffer.clear();
                DecodeOutcome::Invalid(e.to_string())
            }
        }
    }
}

/// Accumulates records and writes one raw batch file per `batch_size`.
pub struct BatchWriter {
    buffer_dir: PathBuf,
    batch_size: usize,
    next_index: u64,
    records: Vec<SampleRecord>,
}

impl BatchWriter {
    /// Resumes numbering after the highest batch still on disk.
    pub fn open(layout: &QueueLayout, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(RelayError::InvalidRecord("batch size must be positive".to_string()));
        }
        let next_index = layout.next_batch_index()?;
        Ok(Self {
            buffer_dir: layout.buffer_dir.clone(),
            batch_size,
            next_index,
            records: Vec::with_capacity(batch_size),
        })
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn pending(&self) -> usize {
        self.records.len()
    }

    pub fn push(&mut self, record: SampleRecord) -> Result<Option<PathBuf>> {
        self.records.push(record);
        if self.records.len() >= self.batch_size {
            return self.write_batch(self.batch_size).map(Some);
        }
        Ok(None)
    }

    /// Writes whatever is pending, even a short batch.
    pub fn flush_partial(&mut self) -> Result<Option<PathBuf>> {
        if self.records.is_empty() {
            return Ok(None);
        }
        let count = self.records.len().min(self.batch_size);
        self.write_batch(count).map(Some)
    }

    fn write_batch(&mut self, count: usize) -> Result<PathBuf> {
        let path = self.buffer_dir.join(raw_batch_file_name(self.next_index));
        let bytes = serde_json::to_vec_pretty(&self.records[..count])?;
        write_atomic(&path, &bytes)?;

        self.records.drain(..count);
        info!("Batch {} saved to {} ({} records)", self.next_index, path.display(), count);
        self.next_index += 1;
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReassemblerSettings {
    pub batch_size: usize,
    pub max_fragment_bytes: usize,
}

impl Default for ReassemblerSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_fragment_bytes: DEFAULT_MAX_FRAGMENT_BYTES,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestReport {
    pub records: usize,
    pub invalid: usize,
    pub batches: Vec<PathBuf>,
}

pub struct Reassembler {
    decoder: FragmentDecoder,
    writer: BatchWriter,
    closed: bool,
}

impl Reassembler {
    pub fn open(layout: &QueueLayout, settings: ReassemblerSettings) -> Result<Self> {
        layout.clear_partials(&layout.buffer_dir)?;
        let writer = BatchWriter::open(layout, settings.batch_size)?;
        info!(
            "Reassembler ready: batch size {}, next batch index {}",
            settings.batch_size,
            writer.next_index()
        );
        Ok(Self {
            decoder: FragmentDecoder::new(settings.max_fragment_bytes),
            writer,
            closed: false,
        })
    }

    pub fn ingest_fragment(&mut self, fragment: &[u8]) -> Result<IngestReport> {
        if self.closed {
            return Err(RelayError::Closed);
        }
        let mut report = IngestReport::default();
        let mut write_error = None;

        // A failed batch write keeps its records pending, so keep draining
        // the decoder and report the first failure at the end.
        for outcome in self.decoder.push(fragment) {
            match outcome {
                DecodeOutcome::Complete(record) => {
                    report.records += 1;
                    match self.writer.push(record) {
                        Ok(Some(path)) => report.batches.push(path),
                        Ok(None) => {}
                        Err(e) => {
                            error!("Raw batch write failed: {}", e);
                            if write_error.is_none() {
                                write_error = Some(e);
                            }
                        }
                    }
                }
                DecodeOutcome::Incomplete => {
                    debug!("Waiting for more fragments ({} bytes buffered)", self.decoder.buffered());
                }
                DecodeOutcome::Invalid(reason) => {
                    report.invalid += 1;
                    warn!("Discarded malformed fragment data: {}", reason);
                }
            }
        }

        match write_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Adds an already-decoded record, bypassing the fragment buffer.
    /// A write error means the record was kept and is still pending.
    pub fn ingest_record(&mut self, record: SampleRecord) -> Result<Option<PathBuf>> {
        if self.closed {
            return Err(RelayError::Closed);
        }
        record.validate()?;
        self.writer.push(record)
    }

    pub fn pending(&self) -> usize {
        self.writer.pending()
    }

    /// Persists the open batch so no decoded record is lost on exit.
    /// Later ingest calls are refused.
    pub fn shutdown(&mut self) -> Result<Option<PathBuf>> {
        self.closed = true;
        if self.decoder.buffered() > 0 {
            warn!("Dropping {} bytes of incomplete fragment data", self.decoder.buffered());
        }
        self.writer.flush_partial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::{Axes, RawBatchFile};
    use std::fs;

    fn record(i: usize) -> SampleRecord {
        SampleRecord::new(
            format!("2024-01-01T00:{:02}:{:02}Z", i / 60, i % 60),
            Axes::new(i as f64, 0.0, -9.8),
            Axes::new(0.0, 0.5, 0.0),
        )
    }

    fn payload(i: usize) -> Vec<u8> {
        serde_json::to_vec(&record(i)).unwrap()
    }

    fn open(batch_size: usize) -> (tempfile::TempDir, QueueLayout, Reassembler) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = QueueLayout::under(tmp.path());
        layout.ensure().unwrap();
        let reassembler = Reassembler::open(
            &layout,
            ReassemblerSettings {
                batch_size,
                max_fragment_bytes: 4096,
            },
        )
        .unwrap();
        (tmp, layout, reassembler)
    }

    #[test]
    fn any_chunking_decodes_the_same_record() {
        let bytes = payload(7);
        for chunk in [1, 2, 5, 13, bytes.len()] {
            let mut decoder = FragmentDecoder::new(4096);
            let mut decoded = Vec::new();
            for piece in bytes.chunks(chunk) {
                for outcome in decoder.push(piece) {
                    match outcome {
                        DecodeOutcome::Complete(r) => decoded.push(r),
                        DecodeOutcome::Incomplete => {}
                        DecodeOutcome::Invalid(reason) => panic!("chunk {chunk}: {reason}"),
                    }
                }
            }
            assert_eq!(decoded, vec![record(7)], "chunk size {chunk}");
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn partial_payload_is_incomplete_not_invalid() {
        let bytes = payload(1);
        let mut decoder = FragmentDecoder::new(4096);
        assert_eq!(decoder.push(&bytes[..10]), vec![DecodeOutcome::Incomplete]);
        assert_eq!(decoder.buffered(), 10);
    }

    #[test]
    fn malformed_input_clears_buffer() {
        let mut decoder = FragmentDecoder::new(4096);
        let outcomes = decoder.push(b"{\"timestamp\": ]");
        assert!(matches!(outcomes[0], DecodeOutcome::Invalid(_)));
        assert_eq!(decoder.buffered(), 0);

        // a valid record right after still decodes
        let outcomes = decoder.push(&payload(2));
        assert_eq!(outcomes[0], DecodeOutcome::Complete(record(2)));
    }

    #[test]
    fn structurally_invalid_record_is_rejected() {
        let mut decoder = FragmentDecoder::new(4096);
        let outcomes = decoder.push(br#"{"timestamp":"2024-01-01T00:00:00Z","accel":{"x":1}}"#);
        assert!(matches!(outcomes[0], DecodeOutcome::Invalid(_)));

        let outcomes = decoder.push(
            br#"{"timestamp":"soon","accel":{"x":1,"y":0,"z":0},"gyro":{"x":0,"y":0,"z":0}}"#,
        );
        assert!(matches!(outcomes[0], DecodeOutcome::Invalid(_)));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn rejected_record_does_not_hide_the_next_one() {
        let mut bytes =
            br#"{"timestamp":"soon","accel":{"x":1,"y":0,"z":0},"gyro":{"x":0,"y":0,"z":0}}"#.to_vec();
        bytes.extend_from_slice(&payload(3));

        let mut decoder = FragmentDecoder::new(4096);
        let outcomes = decoder.push(&bytes);
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], DecodeOutcome::Invalid(_)));
        assert_eq!(outcomes[1], DecodeOutcome::Complete(record(3)));
        assert_eq!(outcomes[2], DecodeOutcome::Incomplete);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn record_after_rejected_one_survives_shutdown() {
        let (_tmp, _layout, mut reassembler) = open(10);
        let mut bytes =
            br#"{"timestamp":"soon","accel":{"x":1,"y":0,"z":0},"gyro":{"x":0,"y":0,"z":0}}"#.to_vec();
        bytes.extend_from_slice(&payload(4));

        let report = reassembler.ingest_fragment(&bytes).unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.invalid, 1);

        let path = reassembler.shutdown().unwrap().unwrap();
        let file: RawBatchFile = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(file.into_records(), vec![record(4)]);
    }

    #[test]
    fn ingest_is_refused_after_shutdown() {
        let (_tmp, layout, mut reassembler) = open(10);
        reassembler.ingest_record(record(0)).unwrap();
        assert!(reassembler.shutdown().unwrap().is_some());

        assert!(matches!(
            reassembler.ingest_fragment(&payload(1)),
            Err(RelayError::Closed)
        ));
        assert!(matches!(
            reassembler.ingest_record(record(2)),
            Err(RelayError::Closed)
        ));
        assert_eq!(reassembler.pending(), 0);
        assert_eq!(layout.list_raw_batches().unwrap().len(), 1);
    }

    #[test]
    fn runaway_buffer_is_dropped() {
        let mut decoder = FragmentDecoder::new(16);
        let outcomes = decoder.push(br#"{"timestamp":"2024-01-01T00:00:00"#);
        assert!(matches!(outcomes[0], DecodeOutcome::Invalid(_)));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn back_to_back_records_in_one_fragment() {
        let mut bytes = payload(0);
        bytes.extend_from_slice(b"\n");
        bytes.extend_from_slice(&payload(1));
        bytes.extend_from_slice(&payload(2)[..5]);

        let mut decoder = FragmentDecoder::new(4096);
        let outcomes = decoder.push(&bytes);
        assert_eq!(
            outcomes,
            vec![
                DecodeOutcome::Complete(record(0)),
                DecodeOutcome::Complete(record(1)),
                DecodeOutcome::Incomplete,
            ]
        );
        assert_eq!(decoder.buffered(), 5);
    }

    #[test]
    fn full_batch_produces_exactly_one_file_in_arrival_order() {
        let (_tmp, layout, mut reassembler) = open(5);

        let mut batches = Vec::new();
        for i in 0..5 {
            let bytes = payload(i);
            let (head, tail) = bytes.split_at(bytes.len() / 2);
            batches.extend(reassembler.ingest_fragment(head).unwrap().batches);
            batches.extend(reassembler.ingest_fragment(tail).unwrap().batches);
        }

        assert_eq!(batches.len(), 1);
        assert_eq!(layout.list_raw_batches().unwrap().len(), 1);
        let file: RawBatchFile = serde_json::from_slice(&fs::read(&batches[0]).unwrap()).unwrap();
        let records = file.into_records();
        assert_eq!(records, (0..5).map(record).collect::<Vec<_>>());
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn batch_index_resumes_after_restart() {
        let (_tmp, layout, mut reassembler) = open(2);
        for i in 0..4 {
            reassembler.ingest_record(record(i)).unwrap();
        }
        drop(reassembler);

        let mut reopened = Reassembler::open(
            &layout,
            ReassemblerSettings {
                batch_size: 2,
                max_fragment_bytes: 4096,
            },
        )
        .unwrap();
        reopened.ingest_record(record(4)).unwrap();
        let path = reopened.shutdown().unwrap().unwrap();

        assert_eq!(path.file_name().unwrap(), "segment2_raw.json");
        assert_eq!(layout.list_raw_batches().unwrap().len(), 3);
    }
}
