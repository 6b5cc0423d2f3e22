// Segment upload: archive, obtain a one-time destination, write, retire

use crate::core::archive::pack_segment;
use crate::core::constants::CompressionType;
use crate::core::error::{RelayError, Result};
use crate::core::queue::{move_replacing, QueueLayout};
use crate::core::segment::verify_segment;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A write target issued by the ingestion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub handle: String,
    pub key: String,
}

/// Remote ingestion boundary.
///
/// Destinations are single-use and writes are not assumed idempotent: a
/// write whose success acknowledgment is lost is retried against a fresh
/// destination, which can deliver the archive twice.
#[async_trait]
pub trait IngestClient: Send + Sync {
    /// `Ok(None)` means the service answered but issued no destination.
    async fn request_destination(&self, client_id: &str) -> Result<Option<Destination>>;

    async fn write_archive(&self, destination: &Destination, bytes: &[u8]) -> Result<()>;

    /// Whether a destination may be written again after a failed write.
    fn destinations_reusable(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct UploaderSettings {
    pub client_id: String,
    pub retry_backoff: Duration,
    pub compression: CompressionType,
    /// Consecutive failed packaging passes before a segment is moved to
    /// quarantine. `None` retries forever.
    pub quarantine_after_failures: Option<u32>,
}

impl Default for UploaderSettings {
    fn default() -> Self {
        Self {
            client_id: "tsdf-relay".to_string(),
            retry_backoff: Duration::from_secs(30),
            compression: CompressionType::Gzip,
            quarantine_after_failures: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOutcome {
    Sent { archive: PathBuf },
    /// Packaging failed; the segment stays for the next pass.
    Skipped { reason: String },
    Quarantined { to: PathBuf },
    /// Shutdown was requested while waiting to transmit.
    Cancelled,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PassReport {
    pub sent: usize,
    pub skipped: usize,
    pub quarantined: usize,
    pub cancelled: bool,
}

pub struct Uploader<C: IngestClient> {
    layout: QueueLayout,
    settings: UploaderSettings,
    client: C,
    failures: HashMap<String, u32>,
}

impl<C: IngestClient> Uploader<C> {
    pub fn open(layout: QueueLayout, settings: UploaderSettings, client: C) -> Result<Self> {
        layout.ensure()?;
        layout.clear_partials(&layout.outbox_dir())?;
        Ok(Self {
            layout,
            settings,
            client,
            failures: HashMap::new(),
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Ships every segment currently in the output area, lowest index first.
    pub async fn run_pass(&mut self, cancel: &CancellationToken) -> Result<PassReport> {
        let mut report = PassReport::default();
        let segments = self.layout.list_segments()?;
        if segments.is_empty() {
            info!("No segments to send, waiting");
            return Ok(report);
        }

        for (_, dir) in segments {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.ship_segment(&dir, cancel).await {
                Ok(SegmentOutcome::Sent { .. }) => report.sent += 1,
                Ok(SegmentOutcome::Skipped { .. }) => report.skipped += 1,
                Ok(SegmentOutcome::Quarantined { .. }) => report.quarantined += 1,
                Ok(SegmentOutcome::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    error!("[{}] upload pass failed: {}", dir.display(), e);
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    pub async fn ship_segment(&mut self, dir: &Path, cancel: &CancellationToken) -> Result<SegmentOutcome> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dir.display().to_string());

        // Only a defect in the segment itself counts toward quarantine.
        match verify_segment(dir) {
            Ok(_) => {
                self.failures.remove(&name);
            }
            Err(
                e @ (RelayError::MissingArtifact { .. }
                | RelayError::CorruptedSegment { .. }
                | RelayError::UnsupportedEncoding(_)),
            ) => return self.packaging_failed(dir, &name, e),
            Err(e) => return Ok(self.transient_skip(&name, e)),
        }

        let archive = match pack_segment(dir, &self.layout.outbox_dir(), self.settings.compression) {
            Ok(path) => path,
            Err(e) => return Ok(self.transient_skip(&name, e)),
        };
        info!("[{}] archived to {}", name, archive.display());

        let bytes = fs::read(&archive)?;
        if !self.transmit(&name, &bytes, cancel).await {
            info!("[{}] upload interrupted by shutdown, will resume on next start", name);
            return Ok(SegmentOutcome::Cancelled);
        }

        let archive_name = archive
            .file_name()
            .map(|n| n.to_owned())
            .ok_or_else(|| RelayError::Remote(format!("archive for {} has no file name", name)))?;
        let sent = self.layout.sent_dir.join(archive_name);
        move_replacing(&archive, &sent)?;
        fs::remove_dir_all(dir)?;

        info!("[{}] sent, archive moved to {}", name, sent.display());
        Ok(SegmentOutcome::Sent { archive: sent })
    }

    fn packaging_failed(&mut self, dir: &Path, name: &str, err: RelayError) -> Result<SegmentOutcome> {
        let count = self.failures.entry(name.to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        if let Some(limit) = self.settings.quarantine_after_failures {
            if count >= limit {
                let target = self.layout.quarantine_dir.join(name);
                move_replacing(dir, &target)?;
                self.failures.remove(name);
                error!(
                    "[{}] quarantined after {} failed attempts: {}",
                    name, count, err
                );
                return Ok(SegmentOutcome::Quarantined { to: target });
            }
        }

        error!("[{}] cannot package segment (attempt {}): {}", name, count, err);
        Ok(SegmentOutcome::Skipped {
            reason: err.to_string(),
        })
    }

    fn transient_skip(&self, name: &str, err: RelayError) -> SegmentOutcome {
        warn!("[{}] cannot package segment, will retry: {}", name, err);
        SegmentOutcome::Skipped {
            reason: err.to_string(),
        }
    }

    /// Loops until the archive is written. Returns `false` only when
    /// cancelled.
    async fn transmit(&self, name: &str, bytes: &[u8], cancel: &CancellationToken) -> bool {
        let mut attempt: u64 = 0;
        let mut reusable: Option<Destination> = None;

        loop {
            if cancel.is_cancelled() {
                return false;
            }
            attempt += 1;

            let destination = match reusable.take() {
                Some(destination) => destination,
                None => match self.client.request_destination(&self.settings.client_id).await {
                    Ok(Some(destination)) => destination,
                    Ok(None) => {
                        warn!("[{}] no upload destination issued (attempt {})", name, attempt);
                        if !self.backoff(cancel).await {
                            return false;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!("[{}] destination request failed (attempt {}): {}", name, attempt, e);
                        if !self.backoff(cancel).await {
                            return false;
                        }
                        continue;
                    }
                },
            };

            info!(
                "[{}] sending {} bytes to {} (attempt {})",
                name,
                bytes.len(),
                destination.key,
                attempt
            );
            match self.client.write_archive(&destination, bytes).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!("[{}] write failed (attempt {}): {}", name, attempt, e);
                    if self.client.destinations_reusable() {
                        reusable = Some(destination);
                    }
                    if !self.backoff(cancel).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.retry_backoff) => true,
            _ = cancel.cancelled() => false,
        }
    }

    pub async fn run_loop(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_pass(&cancel).await {
                        Ok(report) if report.sent + report.skipped + report.quarantined > 0 => info!(
                            "Upload pass done: {} sent, {} skipped, {} quarantined",
                            report.sent, report.skipped, report.quarantined
                        ),
                        Ok(_) => {}
                        Err(e) => error!("Upload pass failed: {}", e),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Uploader shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::read_archive;
    use crate::core::codec;
    use crate::core::constants::*;
    use crate::core::format::{EncodingSettings, MetadataSettings, SegmentMetadata};
    use crate::core::segment::{publish_segment, EncodedSegment};
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Reply {
        Issue,
        Refuse,
        Fail,
    }

    #[derive(Default)]
    struct ScriptedClient {
        requests: Mutex<VecDeque<Reply>>,
        writes: Mutex<VecDeque<bool>>,
        issued: Mutex<u32>,
        written: Mutex<Vec<(String, Vec<u8>)>>,
        attempted_handles: Mutex<Vec<String>>,
        reusable: bool,
    }

    impl ScriptedClient {
        fn new(requests: Vec<Reply>, writes: Vec<bool>) -> Self {
            Self {
                requests: Mutex::new(requests.into()),
                writes: Mutex::new(writes.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl IngestClient for ScriptedClient {
        async fn request_destination(&self, client_id: &str) -> Result<Option<Destination>> {
            assert_eq!(client_id, "watch-01");
            let reply = self.requests.lock().unwrap().pop_front().unwrap_or(Reply::Issue);
            match reply {
                Reply::Issue => {
                    let mut issued = self.issued.lock().unwrap();
                    *issued += 1;
                    Ok(Some(Destination {
                        handle: format!("https://ingest.test/put/{}", issued),
                        key: format!("key-{}", issued),
                    }))
                }
                Reply::Refuse => Ok(None),
                Reply::Fail => Err(RelayError::Remote("connection refused".to_string())),
            }
        }

        async fn write_archive(&self, destination: &Destination, bytes: &[u8]) -> Result<()> {
            self.attempted_handles.lock().unwrap().push(destination.handle.clone());
            let ok = self.writes.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                self.written
                    .lock()
                    .unwrap()
                    .push((destination.handle.clone(), bytes.to_vec()));
                Ok(())
            } else {
                Err(RelayError::Remote("status 503".to_string()))
            }
        }

        fn destinations_reusable(&self) -> bool {
            self.reusable
        }
    }

    fn settings() -> UploaderSettings {
        UploaderSettings {
            client_id: "watch-01".to_string(),
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn setup() -> (tempfile::TempDir, QueueLayout, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = QueueLayout::under(tmp.path());
        layout.ensure().unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let segment = EncodedSegment {
            time: codec::encode_time_channel(&[0.0], Endianness::Little),
            values: codec::encode_value_channel(&[[0.5; VALUE_CHANNELS]], Endianness::Little, 64)
                .unwrap(),
            metadata: SegmentMetadata::build(
                &MetadataSettings::default(),
                &EncodingSettings::default(),
                &ts,
                &ts,
                1,
            ),
        };
        let dir = publish_segment(&layout.output_dir, 0, &segment).unwrap();
        (tmp, layout, dir)
    }

    #[tokio::test]
    async fn sends_and_retires_segment() {
        let (_tmp, layout, dir) = setup();
        let mut uploader = Uploader::open(layout.clone(), settings(), ScriptedClient::default()).unwrap();

        let report = uploader.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.sent, 1);

        assert!(!dir.exists());
        let sent = layout.sent_dir.join("segment0.tar.gz");
        let bytes = fs::read(&sent).unwrap();
        assert_eq!(uploader.client.written.lock().unwrap()[0].1, bytes);

        let entries = read_archive(&bytes, CompressionType::Gzip).unwrap();
        assert!(entries.iter().any(|(n, _)| n == "segment0/IMU_values.bin"));
        assert_eq!(fs::read_dir(layout.outbox_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn retries_until_delivered_with_fresh_destinations() {
        let (_tmp, layout, dir) = setup();
        let client = ScriptedClient::new(
            vec![Reply::Fail, Reply::Refuse, Reply::Issue, Reply::Fail, Reply::Issue],
            vec![false, true],
        );
        let mut uploader = Uploader::open(layout.clone(), settings(), client).unwrap();

        let report = uploader.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.sent, 1);
        assert!(!dir.exists());
        assert!(layout.sent_dir.join("segment0.tar.gz").exists());

        let handles = uploader.client.attempted_handles.lock().unwrap().clone();
        assert_eq!(
            handles,
            vec!["https://ingest.test/put/1", "https://ingest.test/put/2"]
        );
        assert_eq!(uploader.client.written.lock().unwrap().len(), 1);

        // nothing left to do
        let report = uploader.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, PassReport::default());
    }

    #[tokio::test]
    async fn reusable_destination_is_written_again() {
        let (_tmp, layout, _dir) = setup();
        let mut client = ScriptedClient::new(vec![], vec![false, false, true]);
        client.reusable = true;
        let mut uploader = Uploader::open(layout, settings(), client).unwrap();

        uploader.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(*uploader.client.issued.lock().unwrap(), 1);
        assert_eq!(uploader.client.attempted_handles.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_artifact_skips_then_quarantines() {
        let (_tmp, layout, dir) = setup();
        fs::remove_file(dir.join(TIME_FILE)).unwrap();
        let mut policy = settings();
        policy.quarantine_after_failures = Some(2);
        let mut uploader = Uploader::open(layout.clone(), policy, ScriptedClient::default()).unwrap();

        let first = uploader.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.skipped, 1);
        assert!(dir.exists());

        let second = uploader.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(second.quarantined, 1);
        assert!(!dir.exists());
        assert!(layout.quarantine_dir.join("segment0").is_dir());
        assert_eq!(*uploader.client.issued.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn outbox_failure_never_quarantines_a_sound_segment() {
        let (_tmp, layout, dir) = setup();
        let mut policy = settings();
        policy.quarantine_after_failures = Some(1);
        let mut uploader = Uploader::open(layout.clone(), policy, ScriptedClient::default()).unwrap();
        fs::remove_dir_all(layout.outbox_dir()).unwrap();
        fs::write(layout.outbox_dir(), b"not a directory").unwrap();

        for _ in 0..3 {
            let report = uploader.run_pass(&CancellationToken::new()).await.unwrap();
            assert_eq!(report.skipped, 1);
            assert_eq!(report.quarantined, 0);
        }
        assert!(dir.exists());
        assert!(!layout.quarantine_dir.join("segment0").exists());

        // once the outbox is back the segment ships normally
        fs::remove_file(layout.outbox_dir()).unwrap();
        fs::create_dir(layout.outbox_dir()).unwrap();
        let report = uploader.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.sent, 1);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn without_policy_broken_segment_stays() {
        let (_tmp, layout, dir) = setup();
        fs::write(dir.join(MANIFEST_FILE), b"{").unwrap();
        let mut uploader = Uploader::open(layout, settings(), ScriptedClient::default()).unwrap();

        for _ in 0..3 {
            let report = uploader.run_pass(&CancellationToken::new()).await.unwrap();
            assert_eq!(report.skipped, 1);
        }
        assert!(dir.exists());
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff_and_keeps_segment() {
        let (_tmp, layout, dir) = setup();
        let mut slow = settings();
        slow.retry_backoff = Duration::from_secs(3600);
        let client = ScriptedClient::new(vec![Reply::Fail], vec![]);
        let mut uploader = Uploader::open(layout.clone(), slow, client).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = uploader.run_pass(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.sent, 0);
        assert!(dir.exists());
        assert!(!layout.sent_dir.join("segment0.tar.gz").exists());
    }

    #[tokio::test]
    async fn stale_sent_entry_is_replaced() {
        let (_tmp, layout, _dir) = setup();
        fs::write(layout.sent_dir.join("segment0.tar.gz"), b"partial").unwrap();
        let mut uploader = Uploader::open(layout.clone(), settings(), ScriptedClient::default()).unwrap();

        uploader.run_pass(&CancellationToken::new()).await.unwrap();
        let bytes = fs::read(layout.sent_dir.join("segment0.tar.gz")).unwrap();
        assert_ne!(bytes, b"partial");
    }
}
