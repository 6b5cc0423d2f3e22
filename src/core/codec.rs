// Binary channel encoding for TSDF segments
//
// Time stream: one f64 per row (ms since the first row).
// Value stream: VALUE_CHANNELS floats per row, row-major, 32 or 64 bit.

use crate::core::constants::{Endianness, TIME_BITS, VALUE_CHANNELS};
use crate::core::error::{RelayError, Result};

pub type ValueRow = [f64; VALUE_CHANNELS];

pub fn apply_scale(channels: ValueRow, factors: &ValueRow) -> ValueRow {
    let mut scaled = channels;
    for (value, factor) in scaled.iter_mut().zip(factors.iter()) {
        *value *= factor;
    }
    scaled
}

fn put_f64(out: &mut Vec<u8>, value: f64, endianness: Endianness) {
    match endianness {
        Endianness::Little => out.extend_from_slice(&value.to_le_bytes()),
        Endianness::Big => out.extend_from_slice(&value.to_be_bytes()),
    }
}

fn put_f32(out: &mut Vec<u8>, value: f32, endianness: Endianness) {
    match endianness {
        Endianness::Little => out.extend_from_slice(&value.to_le_bytes()),
        Endianness::Big => out.extend_from_slice(&value.to_be_bytes()),
    }
}

fn get_f64(bytes: &[u8], endianness: Endianness) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    match endianness {
        Endianness::Little => f64::from_le_bytes(buf),
        Endianness::Big => f64::from_be_bytes(buf),
    }
}

fn get_f32(bytes: &[u8], endianness: Endianness) -> f32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    match endianness {
        Endianness::Little => f32::from_le_bytes(buf),
        Endianness::Big => f32::from_be_bytes(buf),
    }
}

pub fn value_width(bits: u8) -> Result<usize> {
    match bits {
        32 => Ok(4),
        64 => Ok(8),
        other => Err(RelayError::UnsupportedEncoding(format!(
            "{} bit float",
            other
        ))),
    }
}

pub fn time_stream_len(rows: usize) -> u64 {
    (rows * (TIME_BITS as usize / 8)) as u64
}

pub fn value_stream_len(rows: usize, bits: u8) -> Result<u64> {
    Ok((rows * VALUE_CHANNELS * value_width(bits)?) as u64)
}

pub fn encode_time_channel(offsets_ms: &[f64], endianness: Endianness) -> Vec<u8> {
    let mut out = Vec::with_capacity(time_stream_len(offsets_ms.len()) as usize);
    for offset in offsets_ms {
        put_f64(&mut out, *offset, endianness);
    }
    out
}

/// Encodes already-scaled rows.
pub fn encode_value_channel(rows: &[ValueRow], endianness: Endianness, bits: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(value_stream_len(rows.len(), bits)? as usize);
    for row in rows {
        for value in row {
            if bits == 32 {
                put_f32(&mut out, *value as f32, endianness);
            } else {
                put_f64(&mut out, *value, endianness);
            }
        }
    }
    Ok(out)
}

pub fn decode_time_channel(bytes: &[u8], endianness: Endianness) -> Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(RelayError::UnsupportedEncoding(format!(
            "time stream length {} is not a multiple of 8",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| get_f64(chunk, endianness))
        .collect())
}

pub fn decode_value_channel(bytes: &[u8], endianness: Endianness, bits: u8) -> Result<Vec<ValueRow>> {
    let width = value_width(bits)?;
    let row_len = width * VALUE_CHANNELS;
    if bytes.len() % row_len != 0 {
        return Err(RelayError::UnsupportedEncoding(format!(
            "value stream length {} is not a multiple of {}",
            bytes.len(),
            row_len
        )));
    }

    let mut rows = Vec::with_capacity(bytes.len() / row_len);
    for raw_row in bytes.chunks_exact(row_len) {
        let mut row = [0.0; VALUE_CHANNELS];
        for (i, cell) in raw_row.chunks_exact(width).enumerate() {
            row[i] = if width == 4 {
                get_f32(cell, endianness) as f64
            } else {
                get_f64(cell, endianness)
            };
        }
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_is_applied_per_channel() {
        let scaled = apply_scale([1.0, 0.0, -9.8, 0.5, 0.0, 3.0], &[2.0, 2.0, 2.0, 1.0, 1.0, 10.0]);
        assert_eq!(scaled, [2.0, 0.0, -19.6, 0.5, 0.0, 30.0]);
    }

    #[test]
    fn big_endian_time_stream_layout() {
        let bytes = encode_time_channel(&[1000.0], Endianness::Big);
        assert_eq!(bytes, 1000.0f64.to_be_bytes().to_vec());
        assert_eq!(decode_time_channel(&bytes, Endianness::Big).unwrap(), vec![1000.0]);
    }

    #[test]
    fn narrow_value_stream_keeps_f32_precision() {
        let rows = vec![[2.0, 0.0, -19.6, 0.0, 0.0, 0.125]];
        let bytes = encode_value_channel(&rows, Endianness::Little, 32).unwrap();
        assert_eq!(bytes.len() as u64, value_stream_len(1, 32).unwrap());

        let decoded = decode_value_channel(&bytes, Endianness::Little, 32).unwrap();
        assert_eq!(decoded[0][2], -19.6f32 as f64);
        assert_eq!(decoded[0][5], 0.125);
    }

    #[test]
    fn rejects_unknown_width_and_torn_streams() {
        assert!(encode_value_channel(&[[0.0; VALUE_CHANNELS]], Endianness::Little, 16).is_err());
        assert!(decode_time_channel(&[0u8; 7], Endianness::Little).is_err());
        assert!(decode_value_channel(&[0u8; 40], Endianness::Little, 64).is_err());
    }
}
