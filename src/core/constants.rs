// Layout and format constants for the segment pipeline

use serde::{Deserialize, Serialize};

pub const SEGMENT_PREFIX: &str = "segment";
pub const RAW_BATCH_SUFFIX: &str = "_raw.json";

pub const TIME_FILE: &str = "IMU_time.bin";
pub const VALUES_FILE: &str = "IMU_values.bin";
pub const META_FILE: &str = "IMU_meta.json";
pub const MANIFEST_FILE: &str = "manifest.json";

// Marker for in-progress artifacts; never matches a queue name
pub const PARTIAL_PREFIX: &str = ".";
pub const PARTIAL_SUFFIX: &str = ".partial";

pub const DEFAULT_BATCH_SIZE: usize = 400;
pub const DEFAULT_MAX_FRAGMENT_BYTES: usize = 64 * 1024;

// Row layout: acc_x acc_y acc_z gyro_x gyro_y gyro_z
pub const VALUE_CHANNELS: usize = 6;
pub const VALUE_CHANNEL_NAMES: [&str; VALUE_CHANNELS] = [
    "acceleration_x",
    "acceleration_y",
    "acceleration_z",
    "gyroscope_x",
    "gyroscope_y",
    "gyroscope_z",
];
pub const VALUE_CHANNEL_UNITS: [&str; VALUE_CHANNELS] =
    ["m/s/s", "m/s/s", "m/s/s", "deg/s", "deg/s", "deg/s"];

pub const TIME_CHANNEL_NAME: &str = "time";
pub const TIME_CHANNEL_UNIT: &str = "ms";
pub const TIME_BITS: u8 = 64;

pub const DATA_TYPE: &str = "float";
pub const MANIFEST_VERSION: u32 = 1;

// Archive codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    Gzip,
    Zstd,
    Lz4,
}

impl CompressionType {
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::Gzip => "tar.gz",
            CompressionType::Zstd => "tar.zst",
            CompressionType::Lz4 => "tar.lz4",
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        [CompressionType::Gzip, CompressionType::Zstd, CompressionType::Lz4]
            .into_iter()
            .find(|c| name.ends_with(&format!(".{}", c.extension())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endianness::Little => "little",
            Endianness::Big => "big",
        }
    }
}

pub fn segment_dir_name(index: u64) -> String {
    format!("{}{}", SEGMENT_PREFIX, index)
}

pub fn raw_batch_file_name(index: u64) -> String {
    format!("{}{}{}", SEGMENT_PREFIX, index, RAW_BATCH_SUFFIX)
}

/// Parses `segment{N}` into `N`.
pub fn parse_segment_index(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(SEGMENT_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Parses `segment{N}_raw.json` into `N`.
pub fn parse_raw_batch_index(name: &str) -> Option<u64> {
    parse_segment_index(name.strip_suffix(RAW_BATCH_SUFFIX)?)
}

/// Parses `segment{N}.tar.*` into `N`.
pub fn parse_archive_index(name: &str) -> Option<u64> {
    let codec = CompressionType::from_file_name(name)?;
    let stem = name.strip_suffix(&format!(".{}", codec.extension()))?;
    parse_segment_index(stem)
}
