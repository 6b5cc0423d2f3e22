use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use tsdf_relay::core::aggregator::AggregatorSettings;
use tsdf_relay::core::constants::{CompressionType, DEFAULT_BATCH_SIZE, DEFAULT_MAX_FRAGMENT_BYTES};
use tsdf_relay::core::format::{EncodingSettings, MetadataSettings};
use tsdf_relay::core::queue::QueueLayout;
use tsdf_relay::core::reassembler::ReassemblerSettings;
use tsdf_relay::core::uploader::UploaderSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub name: String,
    pub client_id: String,
    pub endpoint: Endpoint,
    pub paths: Paths,
    pub reassembler: ReassemblerConfig,
    pub aggregator: AggregatorConfig,
    pub uploader: UploaderConfig,
    pub metadata: MetadataSettings,
    pub encoding: EncodingSettings,
    pub patient_config: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "tsdf-relay".to_string(),
            client_id: "tsdf-relay".to_string(),
            endpoint: Endpoint::default(),
            paths: Paths::default(),
            reassembler: ReassemblerConfig::default(),
            aggregator: AggregatorConfig::default(),
            uploader: UploaderConfig::default(),
            metadata: MetadataSettings::default(),
            encoding: EncodingSettings::default(),
            patient_config: PathBuf::from("patient_config.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub base_url: String,
    pub destination_path: String,
    pub timeout_secs: u64,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4000".to_string(),
            destination_path: "/api/tsdf/upload-url".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Endpoint {
    pub fn destination_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.destination_path.trim_start_matches('/')
        )
    }
}

/// Queue areas. Unset areas follow the conventional layout under `base_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub base_dir: PathBuf,
    pub buffer_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub sent_dir: Option<PathBuf>,
    pub quarantine_dir: Option<PathBuf>,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("toSendData"),
            buffer_dir: None,
            output_dir: None,
            sent_dir: None,
            quarantine_dir: None,
        }
    }
}

impl Paths {
    pub fn layout(&self) -> QueueLayout {
        let conventional = QueueLayout::under(&self.base_dir);
        QueueLayout::new(
            self.buffer_dir.clone().unwrap_or(conventional.buffer_dir),
            self.output_dir.clone().unwrap_or(conventional.output_dir),
            self.sent_dir.clone().unwrap_or(conventional.sent_dir),
            self.quarantine_dir.clone().unwrap_or(conventional.quarantine_dir),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblerConfig {
    pub batch_size: usize,
    pub max_fragment_bytes: usize,
    pub connection: Connection,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_fragment_bytes: DEFAULT_MAX_FRAGMENT_BYTES,
            connection: Connection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Connection {
    pub ip: String,
    pub port: u16,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub poll_interval_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub poll_interval_secs: u64,
    pub retry_backoff_secs: u64,
    pub quarantine_after_failures: Option<u32>,
    pub compression: CompressionType,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            retry_backoff_secs: 30,
            quarantine_after_failures: None,
            compression: CompressionType::Gzip,
        }
    }
}

impl RelayConfig {
    pub fn reassembler_settings(&self) -> ReassemblerSettings {
        ReassemblerSettings {
            batch_size: self.reassembler.batch_size,
            max_fragment_bytes: self.reassembler.max_fragment_bytes,
        }
    }

    pub fn aggregator_settings(&self, patient_id: Option<String>) -> AggregatorSettings {
        let mut metadata = self.metadata.clone();
        if let Some(id) = patient_id {
            metadata.subject_id = id;
        }
        AggregatorSettings {
            metadata,
            encoding: self.encoding.clone(),
        }
    }

    pub fn uploader_settings(&self) -> UploaderSettings {
        UploaderSettings {
            client_id: self.client_id.clone(),
            retry_backoff: Duration::from_secs(self.uploader.retry_backoff_secs),
            compression: self.uploader.compression,
            quarantine_after_failures: self.uploader.quarantine_after_failures,
        }
    }

    pub fn aggregator_interval(&self) -> Duration {
        Duration::from_secs(self.aggregator.poll_interval_secs.max(1))
    }

    pub fn uploader_interval(&self) -> Duration {
        Duration::from_secs(self.uploader.poll_interval_secs.max(1))
    }
}

/// Contents of the patient file written by `set-patient-id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientConfig {
    pub patient_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsdf_relay::core::constants::Endianness;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: RelayConfig = serde_json::from_str(
            r#"{
                "client_id": "watch-01",
                "paths": { "base_dir": "/data", "sent_dir": "/archive" },
                "encoding": { "scale_factors": [2, 2, 2, 1, 1, 1] },
                "uploader": { "quarantine_after_failures": 5, "compression": "zstd" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.reassembler.batch_size, 400);
        assert_eq!(config.encoding.endianness, Endianness::Little);
        assert_eq!(config.encoding.scale_factors, [2.0, 2.0, 2.0, 1.0, 1.0, 1.0]);

        let layout = config.paths.layout();
        assert_eq!(layout.buffer_dir, PathBuf::from("/data/buffer"));
        assert_eq!(layout.sent_dir, PathBuf::from("/archive"));

        let uploader = config.uploader_settings();
        assert_eq!(uploader.client_id, "watch-01");
        assert_eq!(uploader.retry_backoff, Duration::from_secs(30));
        assert_eq!(uploader.quarantine_after_failures, Some(5));
        assert_eq!(uploader.compression, CompressionType::Zstd);
    }

    #[test]
    fn patient_file_overrides_subject() {
        let config = RelayConfig::default();
        assert_eq!(config.aggregator_settings(None).metadata.subject_id, "X");
        assert_eq!(
            config.aggregator_settings(Some("P-17".to_string())).metadata.subject_id,
            "P-17"
        );
    }

    #[test]
    fn destination_url_joins_cleanly() {
        let endpoint = Endpoint {
            base_url: "https://ingest.example/".to_string(),
            destination_path: "/v1/upload-url".to_string(),
            timeout_secs: 5,
        };
        assert_eq!(endpoint.destination_url(), "https://ingest.example/v1/upload-url");
    }
}
