use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tsdf_relay::core::error::Result;
use tsdf_relay::core::format::SampleRecord;
use tsdf_relay::core::reassembler::{IngestReport, Reassembler};

#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestStats {
    pub fragments: u64,
    pub records: u64,
    pub invalid: u64,
    pub write_failures: u64,
    pub batches: u64,
    pub pending: usize,
}

pub struct IngestState {
    pub reassembler: Reassembler,
    pub stats: IngestStats,
}

/// Shared by every route of the fragment receiver. All fragment sources
/// feed the same reassembler, one event at a time.
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<Mutex<IngestState>>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(reassembler: Reassembler, shutdown: CancellationToken) -> Self {
        Self {
            ingest: Arc::new(Mutex::new(IngestState {
                reassembler,
                stats: IngestStats::default(),
            })),
            shutdown,
        }
    }

    pub async fn ingest_fragment(&self, fragment: &[u8]) -> Result<IngestReport> {
        let mut guard = self.ingest.lock().await;
        guard.stats.fragments += 1;
        let result = guard.reassembler.ingest_fragment(fragment);
        if let Ok(report) = &result {
            guard.stats.records += report.records as u64;
            guard.stats.invalid += report.invalid as u64;
            guard.stats.batches += report.batches.len() as u64;
        }
        result
    }

    pub async fn ingest_record(&self, record: SampleRecord) -> Result<Option<PathBuf>> {
        let mut guard = self.ingest.lock().await;
        let result = guard.reassembler.ingest_record(record);
        match &result {
            Ok(batch) => {
                guard.stats.records += 1;
                if batch.is_some() {
                    guard.stats.batches += 1;
                }
            }
            Err(e) if e.is_rejected_input() => guard.stats.invalid += 1,
            // Kept in the open batch; it is written with the next one.
            Err(_) => {
                guard.stats.records += 1;
                guard.stats.write_failures += 1;
            }
        }
        result
    }

    pub async fn stats(&self) -> IngestStats {
        let guard = self.ingest.lock().await;
        IngestStats {
            pending: guard.reassembler.pending(),
            ..guard.stats.clone()
        }
    }

    /// Writes the open batch; called once the server has stopped.
    pub async fn flush(&self) -> Result<Option<PathBuf>> {
        self.ingest.lock().await.reassembler.shutdown()
    }
}
