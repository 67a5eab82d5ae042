//! Sequence-tensor codec: packs a `T x D` [`Embedding`] into the
//! gzip-compressed little-endian f16 blob stored as `seq_blob`
//! (spec.md §4.6). Round-trips within f16 quantization tolerance.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use half::f16;
use std::io::{Read, Write};

use crate::embedding::Embedding;
use crate::error::StoreError;

/// Gzip-compress the row-major f16 encoding of `embedding`. Returns the
/// blob alongside its `(t, d)` shape header.
pub fn encode(embedding: &Embedding) -> Result<(Vec<u8>, u32, u32), StoreError> {
  let t = embedding.tokens();
  let d = embedding.dim();
  let mut raw = Vec::with_capacity(t * d * 2);
  for row in &embedding.rows {
    for &value in row {
      raw.extend_from_slice(&f16::from_f32(value).to_le_bytes());
    }
  }

  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(&raw).map_err(StoreError::Io)?;
  let blob = encoder.finish().map_err(StoreError::Io)?;
  Ok((blob, t as u32, d as u32))
}

/// Inverse of [`encode`]. `t` and `d` come from the stored shape header.
pub fn decode(blob: &[u8], t: u32, d: u32) -> Result<Embedding, StoreError> {
  let mut raw = Vec::new();
  GzDecoder::new(blob).read_to_end(&mut raw).map_err(StoreError::Io)?;

  let (t, d) = (t as usize, d as usize);
  let expected_len = t * d * 2;
  if raw.len() != expected_len {
    return Err(StoreError::InvalidInput(format!(
      "seq_blob decoded to {} bytes, expected {} for shape ({t}, {d})",
      raw.len(),
      expected_len
    )));
  }

  let mut rows = Vec::with_capacity(t);
  for chunk in raw.chunks_exact(d * 2) {
    let row = chunk.chunks_exact(2).map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32()).collect();
    rows.push(row);
  }
  Ok(Embedding::new(rows))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_within_f16_tolerance() {
    let embedding = Embedding::new(vec![vec![0.25, -0.5, 1.0], vec![0.125, 0.75, -1.0]]);
    let (blob, t, d) = encode(&embedding).unwrap();
    let decoded = decode(&blob, t, d).unwrap();
    assert_eq!(decoded.tokens(), embedding.tokens());
    for (original_row, decoded_row) in embedding.rows.iter().zip(decoded.rows.iter()) {
      for (a, b) in original_row.iter().zip(decoded_row.iter()) {
        assert!((a - b).abs() < 1e-2, "{a} vs {b}");
      }
    }
  }

  #[test]
  fn single_token_sequence_round_trips() {
    let embedding = Embedding::new(vec![vec![0.0; 4]]);
    let (blob, t, d) = encode(&embedding).unwrap();
    assert_eq!((t, d), (1, 4));
    let decoded = decode(&blob, t, d).unwrap();
    assert_eq!(decoded.tokens(), 1);
  }

  #[test]
  fn shape_mismatch_is_rejected() {
    let embedding = Embedding::new(vec![vec![1.0, 2.0]]);
    let (blob, _t, _d) = encode(&embedding).unwrap();
    let err = decode(&blob, 5, 5).unwrap_err();
    assert!(matches!(err, StoreError::InvalidInput(_)));
  }
}
