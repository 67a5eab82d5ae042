//! Deterministic local provider, default/dev stand-in for a real ColPali
//! inference runtime. Produces stable pseudo-embeddings from a SHA-256 of
//! the input so the crate is runnable and testable without a GPU or an
//! external service, the same role the teacher's mock provider test
//! doubles play in its embedding test suite.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{Embedding, EmbeddingMode, VisionLanguageProvider};
use crate::error::EmbeddingError;

pub struct HashEmbeddingProvider {
  dim: usize,
}

impl HashEmbeddingProvider {
  pub fn new(dim: usize) -> Self {
    Self { dim: dim.max(1) }
  }

  fn embed_one(&self, bytes: &[u8]) -> Embedding {
    if bytes.is_empty() {
      return Embedding::zero(self.dim);
    }
    // One token per 32-byte hash block, enough blocks to cover `dim`
    // floats per token; deterministic and bit-identical across runs for
    // identical input, as spec.md §4.5 requires.
    let token_count = (bytes.len() / 64).max(1).min(32);
    let mut rows = Vec::with_capacity(token_count);
    for token_idx in 0..token_count {
      let mut hasher = Sha256::new();
      hasher.update(bytes);
      hasher.update(token_idx.to_le_bytes());
      let digest = hasher.finalize();
      let mut row = Vec::with_capacity(self.dim);
      for i in 0..self.dim {
        let byte = digest[i % digest.len()];
        row.push((byte as f32 / 255.0) * 2.0 - 1.0);
      }
      rows.push(row);
    }
    Embedding::new(rows)
  }
}

#[async_trait]
impl VisionLanguageProvider for HashEmbeddingProvider {
  fn name(&self) -> &str {
    "hash-local"
  }

  fn dimensions(&self) -> usize {
    self.dim
  }

  async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<Embedding>, EmbeddingError> {
    Ok(images.iter().map(|bytes| self.embed_one(bytes)).collect())
  }

  async fn embed_text(&self, texts: &[String], _mode: EmbeddingMode) -> Result<Vec<Embedding>, EmbeddingError> {
    Ok(texts.iter().map(|text| self.embed_one(text.as_bytes())).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn identical_input_is_bit_identical_across_calls() {
    let provider = HashEmbeddingProvider::new(16);
    let a = provider.embed_text(&["hello world".to_string()], EmbeddingMode::Document).await.unwrap();
    let b = provider.embed_text(&["hello world".to_string()], EmbeddingMode::Document).await.unwrap();
    assert_eq!(a, b);
  }

  #[tokio::test]
  async fn empty_string_produces_single_token_zero_sequence() {
    let provider = HashEmbeddingProvider::new(8);
    let out = provider.embed_text(&[String::new()], EmbeddingMode::Document).await.unwrap();
    assert_eq!(out[0].tokens(), 1);
    assert!(out[0].rows[0].iter().all(|&v| v == 0.0));
  }
}
