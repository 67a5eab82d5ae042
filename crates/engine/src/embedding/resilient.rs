//! Resilience wrapper for remote embedding providers: exponential backoff
//! with jitter, retryable-status classification, and binary-split retry to
//! isolate a single bad input in a batch — the same shape as the teacher's
//! `ResilientProvider<P>`, generalized from single-vector text embeddings
//! to late-interaction image/text embedding batches.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{Embedding, EmbeddingMode, VisionLanguageProvider};
use crate::error::EmbeddingError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  pub backoff_multiplier: f64,
  pub request_timeout: Duration,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 2,
      initial_backoff: Duration::from_millis(500),
      max_backoff: Duration::from_secs(2),
      backoff_multiplier: 4.0,
      request_timeout: Duration::from_secs(30),
    }
  }
}

impl RetryConfig {
  /// Slightly more patient defaults for a cloud-hosted inference endpoint.
  pub fn for_cloud() -> Self {
    Self {
      max_retries: 3,
      initial_backoff: Duration::from_millis(500),
      max_backoff: Duration::from_secs(8),
      backoff_multiplier: 2.0,
      request_timeout: Duration::from_secs(60),
    }
  }

  fn backoff_for_attempt(&self, attempt: u32) -> Duration {
    let scaled = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
    let base = scaled.min(self.max_backoff.as_secs_f64());
    let jitter = pseudo_random_fraction() * base * 0.25;
    Duration::from_secs_f64(base + jitter)
  }
}

/// Nanosecond-clock based jitter source, avoiding a dependency on an
/// external `rand` crate for a single use (the teacher does the same in
/// its retry backoff).
fn pseudo_random_fraction() -> f64 {
  let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or(0);
  (nanos % 1000) as f64 / 1000.0
}

fn is_retryable(err: &EmbeddingError) -> bool {
  match err {
    EmbeddingError::Timeout => true,
    EmbeddingError::Request(e) => e.is_timeout() || e.is_connect() || e.status().map(|s| s.as_u16()).is_some_and(|code| matches!(code, 429 | 502 | 503 | 504)),
    EmbeddingError::Provider(_) | EmbeddingError::NoProvider | EmbeddingError::DeviceUnavailable(_) => false,
  }
}

pub struct ResilientProvider<P: VisionLanguageProvider> {
  inner: P,
  config: RetryConfig,
}

impl<P: VisionLanguageProvider> ResilientProvider<P> {
  pub fn new(inner: P) -> Self {
    Self { inner, config: RetryConfig::default() }
  }

  pub fn with_config(inner: P, config: RetryConfig) -> Self {
    Self { inner, config }
  }

  async fn embed_text_with_retry(&self, texts: &[String], mode: EmbeddingMode) -> Result<Vec<Embedding>, EmbeddingError> {
    let mut attempt = 0;
    loop {
      match tokio::time::timeout(self.config.request_timeout, self.inner.embed_text(texts, mode)).await {
        Ok(Ok(result)) => return Ok(result),
        Ok(Err(err)) if is_retryable(&err) && attempt < self.config.max_retries => {
          warn!(attempt, error = %err, "retrying embedding batch");
          tokio::time::sleep(self.config.backoff_for_attempt(attempt)).await;
          attempt += 1;
        }
        Ok(Err(err)) if texts.len() > 1 && is_retryable(&err) => {
          // Out of retries for the whole batch; split to isolate a bad input.
          return self.split_and_retry(texts, mode).await;
        }
        Ok(Err(err)) => return Err(err),
        Err(_) => {
          if attempt < self.config.max_retries {
            attempt += 1;
            continue;
          }
          return Err(EmbeddingError::Timeout);
        }
      }
    }
  }

  fn split_and_retry<'a>(
    &'a self,
    texts: &'a [String],
    mode: EmbeddingMode,
  ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<Embedding>, EmbeddingError>> + Send + 'a>> {
    Box::pin(async move {
      let mid = texts.len() / 2;
      let (left, right) = texts.split_at(mid);
      let (left_result, right_result) =
        tokio::join!(self.embed_text_with_retry(left, mode), self.embed_text_with_retry(right, mode));
      let mut combined = left_result?;
      combined.extend(right_result?);
      Ok(combined)
    })
  }
}

#[async_trait]
impl<P: VisionLanguageProvider> VisionLanguageProvider for ResilientProvider<P> {
  fn name(&self) -> &str {
    self.inner.name()
  }

  fn dimensions(&self) -> usize {
    self.inner.dimensions()
  }

  async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<Embedding>, EmbeddingError> {
    // Images share the same retry/timeout envelope as text; split-on-failure
    // is not applied here since image batches are typically small and
    // already bounded by BATCH_SIZE_VISUAL.
    let mut attempt = 0;
    loop {
      match tokio::time::timeout(self.config.request_timeout, self.inner.embed_images(images)).await {
        Ok(Ok(result)) => return Ok(result),
        Ok(Err(err)) if is_retryable(&err) && attempt < self.config.max_retries => {
          tokio::time::sleep(self.config.backoff_for_attempt(attempt)).await;
          attempt += 1;
        }
        Ok(Err(err)) => return Err(err),
        Err(_) if attempt < self.config.max_retries => {
          attempt += 1;
        }
        Err(_) => return Err(EmbeddingError::Timeout),
      }
    }
  }

  async fn embed_text(&self, texts: &[String], mode: EmbeddingMode) -> Result<Vec<Embedding>, EmbeddingError> {
    self.embed_text_with_retry(texts, mode).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::EmbedDevice;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  struct FlakyProvider {
    calls: Arc<AtomicUsize>,
    fail_first_n: usize,
  }

  #[async_trait]
  impl VisionLanguageProvider for FlakyProvider {
    fn name(&self) -> &str {
      "flaky"
    }
    fn dimensions(&self) -> usize {
      4
    }
    async fn embed_images(&self, _images: &[Vec<u8>]) -> Result<Vec<Embedding>, EmbeddingError> {
      unimplemented!()
    }
    async fn embed_text(&self, texts: &[String], _mode: EmbeddingMode) -> Result<Vec<Embedding>, EmbeddingError> {
      let call = self.calls.fetch_add(1, Ordering::SeqCst);
      if call < self.fail_first_n {
        return Err(EmbeddingError::Timeout);
      }
      Ok(texts.iter().map(|_| Embedding::zero(4)).collect())
    }
    async fn try_device(&self, _device: EmbedDevice) -> Result<(), EmbeddingError> {
      Ok(())
    }
  }

  #[tokio::test]
  async fn retries_transient_failures_then_succeeds() {
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = ResilientProvider::new(FlakyProvider { calls: calls.clone(), fail_first_n: 1 });
    let out = provider.embed_text(&["a".to_string()], EmbeddingMode::Document).await.unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn non_retryable_error_propagates_immediately() {
    struct AlwaysProviderError;
    #[async_trait]
    impl VisionLanguageProvider for AlwaysProviderError {
      fn name(&self) -> &str {
        "always-error"
      }
      fn dimensions(&self) -> usize {
        4
      }
      async fn embed_images(&self, _images: &[Vec<u8>]) -> Result<Vec<Embedding>, EmbeddingError> {
        unimplemented!()
      }
      async fn embed_text(&self, _texts: &[String], _mode: EmbeddingMode) -> Result<Vec<Embedding>, EmbeddingError> {
        Err(EmbeddingError::Provider("bad request".into()))
      }
    }

    let provider = ResilientProvider::new(AlwaysProviderError);
    let err = provider.embed_text(&["a".to_string()], EmbeddingMode::Document).await.unwrap_err();
    assert!(matches!(err, EmbeddingError::Provider(_)));
  }
}
