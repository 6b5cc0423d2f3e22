// Compression backends for segment archives

use crate::core::constants::CompressionType;
use crate::core::error::{RelayError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub fn compress(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| RelayError::CompressionFailed(format!("Gzip: {}", e)))
        }

        #[cfg(feature = "lz4")]
        CompressionType::Lz4 => lz4::block::compress(data, None, true)
            .map_err(|e| RelayError::CompressionFailed(format!("LZ4: {}", e))),

        #[cfg(not(feature = "lz4"))]
        CompressionType::Lz4 => Err(RelayError::UnsupportedCompression("lz4".to_string())),

        #[cfg(feature = "zstd")]
        CompressionType::Zstd => zstd::encode_all(data, 0)
            .map_err(|e| RelayError::CompressionFailed(format!("Zstd: {}", e))),

        #[cfg(not(feature = "zstd"))]
        CompressionType::Zstd => Err(RelayError::UnsupportedCompression("zstd".to_string())),
    }
}

pub fn decompress(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| RelayError::CompressionFailed(format!("Gzip: {}", e)))?;
            Ok(decompressed)
        }

        #[cfg(feature = "lz4")]
        CompressionType::Lz4 => lz4::block::decompress(data, None)
            .map_err(|e| RelayError::CompressionFailed(format!("LZ4: {}", e))),

        #[cfg(not(feature = "lz4"))]
        CompressionType::Lz4 => Err(RelayError::UnsupportedCompression("lz4".to_string())),

        #[cfg(feature = "zstd")]
        CompressionType::Zstd => zstd::decode_all(data)
            .map_err(|e| RelayError::CompressionFailed(format!("Zstd: {}", e))),

        #[cfg(not(feature = "zstd"))]
        CompressionType::Zstd => Err(RelayError::UnsupportedCompression("zstd".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_stream_is_standard() {
        let original = b"hello world";
        let compressed = compress(original, CompressionType::Gzip).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        assert_eq!(decompress(&compressed, CompressionType::Gzip).unwrap(), original);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress(b"not gzip", CompressionType::Gzip).is_err());
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn test_zstd_backend() {
        let original = vec![7u8; 4096];
        let compressed = compress(&original, CompressionType::Zstd).unwrap();
        assert!(compressed.len() < original.len());
        assert_eq!(decompress(&compressed, CompressionType::Zstd).unwrap(), original);
    }
}
