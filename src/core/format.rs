// Data structures for raw batches and TSDF segments

use crate::core::constants::*;
use crate::core::error::{RelayError, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Axes {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Axes {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// One inertial reading as delivered by the wearable.
///
/// The timestamp is kept as received so a raw batch file reproduces the
/// device payload exactly; it is parsed and normalized at transform time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub timestamp: String,
    pub accel: Axes,
    pub gyro: Axes,
}

impl SampleRecord {
    pub fn new(timestamp: impl Into<String>, accel: Axes, gyro: Axes) -> Self {
        Self {
            timestamp: timestamp.into(),
            accel,
            gyro,
        }
    }

    /// Checks the record is usable and returns its UTC instant.
    pub fn validate(&self) -> Result<DateTime<Utc>> {
        if !self.accel.is_finite() || !self.gyro.is_finite() {
            return Err(RelayError::InvalidRecord(format!(
                "non-finite channel value at {}",
                self.timestamp
            )));
        }
        parse_timestamp(&self.timestamp)
    }

    /// Channel values in value-stream column order.
    pub fn channels(&self) -> [f64; VALUE_CHANNELS] {
        [
            self.accel.x,
            self.accel.y,
            self.accel.z,
            self.gyro.x,
            self.gyro.y,
            self.gyro.z,
        ]
    }
}

/// Parses an ISO-8601 timestamp. Zoned values are converted to UTC,
/// values without a zone are taken as UTC already.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }

    Err(RelayError::InvalidTimestamp(raw.to_string()))
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// On-disk shape of a raw batch. Bare arrays are what the reassembler
/// writes; the wrapped form comes from older receivers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawBatchFile {
    Records(Vec<SampleRecord>),
    Wrapped { samples: Vec<SampleRecord> },
}

impl RawBatchFile {
    pub fn into_records(self) -> Vec<SampleRecord> {
        match self {
            RawBatchFile::Records(records) => records,
            RawBatchFile::Wrapped { samples } => samples,
        }
    }
}

/// Descriptive fields copied into every segment's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    pub study_id: String,
    pub device_id: String,
    pub subject_id: String,
    pub source_protobuf: String,
    pub metadata_version: String,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            study_id: "PPP".to_string(),
            device_id: "Verily Study Watch".to_string(),
            subject_id: "X".to_string(),
            source_protobuf: "WatchData.IMU.Week104.raw".to_string(),
            metadata_version: "0.1".to_string(),
        }
    }
}

/// Binary layout of the value stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingSettings {
    pub endianness: Endianness,
    pub value_bits: u8,
    pub scale_factors: [f64; VALUE_CHANNELS],
}

impl Default for EncodingSettings {
    fn default() -> Self {
        Self {
            endianness: Endianness::Little,
            value_bits: 64,
            scale_factors: [1.0; VALUE_CHANNELS],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub file_name: String,
    pub channels: Vec<String>,
    pub units: Vec<String>,
    pub bits: u8,
    pub scale_factors: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    pub study_id: String,
    pub device_id: String,
    pub subject_id: String,
    pub ppp_source_protobuf: String,
    pub metadata_version: String,
    pub endianness: Endianness,
    pub data_type: String,
    pub start_iso8601: String,
    pub end_iso8601: String,
    pub rows: usize,
    pub sensors: Vec<SensorDescriptor>,
}

impl SegmentMetadata {
    pub fn build(
        meta: &MetadataSettings,
        encoding: &EncodingSettings,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
        rows: usize,
    ) -> Self {
        let time_sensor = SensorDescriptor {
            file_name: TIME_FILE.to_string(),
            channels: vec![TIME_CHANNEL_NAME.to_string()],
            units: vec![TIME_CHANNEL_UNIT.to_string()],
            bits: TIME_BITS,
            scale_factors: vec![1.0],
        };
        let value_sensor = SensorDescriptor {
            file_name: VALUES_FILE.to_string(),
            channels: VALUE_CHANNEL_NAMES.iter().map(|c| c.to_string()).collect(),
            units: VALUE_CHANNEL_UNITS.iter().map(|u| u.to_string()).collect(),
            bits: encoding.value_bits,
            scale_factors: encoding.scale_factors.to_vec(),
        };

        Self {
            study_id: meta.study_id.clone(),
            device_id: meta.device_id.clone(),
            subject_id: meta.subject_id.clone(),
            ppp_source_protobuf: meta.source_protobuf.clone(),
            metadata_version: meta.metadata_version.clone(),
            endianness: encoding.endianness,
            data_type: DATA_TYPE.to_string(),
            start_iso8601: format_timestamp(start),
            end_iso8601: format_timestamp(end),
            rows,
            sensors: vec![time_sensor, value_sensor],
        }
    }

    pub fn sensor(&self, file_name: &str) -> Option<&SensorDescriptor> {
        self.sensors.iter().find(|s| s.file_name == file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub file_name: String,
    pub bytes: u64,
}

/// Written last into a segment; its presence and agreement with the
/// artifacts on disk is what makes a segment ready for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentManifest {
    pub version: u32,
    pub rows: usize,
    pub artifacts: Vec<ArtifactEntry>,
}
