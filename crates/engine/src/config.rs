//! Environment-driven configuration. Constructed once at process startup and
//! shared by `Arc` for the life of the process; nothing in this module
//! re-reads the environment after `from_env()` returns.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Device an embedding model should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedDevice {
  Mps,
  Cuda,
  #[default]
  Cpu,
}

impl EmbedDevice {
  fn parse(s: &str) -> Self {
    match s.to_lowercase().as_str() {
      "mps" => EmbedDevice::Mps,
      "cuda" => EmbedDevice::Cuda,
      _ => EmbedDevice::Cpu,
    }
  }

  /// Next device to try if this one is unavailable, per the mps -> cuda -> cpu chain.
  pub fn fallback(self) -> Option<EmbedDevice> {
    match self {
      EmbedDevice::Mps => Some(EmbedDevice::Cuda),
      EmbedDevice::Cuda => Some(EmbedDevice::Cpu),
      EmbedDevice::Cpu => None,
    }
  }
}

/// Inference precision, applied if the device supports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedPrecision {
  Fp16,
  Int8,
  #[default]
  Fp32,
}

impl EmbedPrecision {
  fn parse(s: &str) -> Self {
    match s.to_lowercase().as_str() {
      "fp16" => EmbedPrecision::Fp16,
      "int8" => EmbedPrecision::Int8,
      _ => EmbedPrecision::Fp32,
    }
  }

  pub fn fallback(self) -> Option<EmbedPrecision> {
    match self {
      EmbedPrecision::Fp16 => Some(EmbedPrecision::Int8),
      EmbedPrecision::Int8 => Some(EmbedPrecision::Fp32),
      EmbedPrecision::Fp32 => None,
    }
  }
}

const DEFAULT_FORMATS: &[&str] = &[
  "pdf", "docx", "pptx", "xlsx", "html", "xhtml", "md", "asciidoc", "csv", "mp3", "wav", "vtt", "png", "jpg", "jpeg",
  "tiff", "bmp", "webp",
];

/// Immutable snapshot of environment-driven configuration, per spec.md §4.2 /
/// SPEC_FULL.md §4.2. Built once via [`ProcessingConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
  pub supported_formats: HashSet<String>,
  pub max_file_size_mb: f64,
  pub upload_dir: PathBuf,
  pub text_chunk_size: usize,
  pub text_chunk_overlap: usize,
  pub page_render_dpi: u32,
  pub worker_threads: usize,
  pub enable_queue: bool,
  pub log_level: String,
  pub log_format: String,
  pub log_file: Option<PathBuf>,
  pub embed_device: EmbedDevice,
  pub embed_precision: EmbedPrecision,
  pub embed_dim: usize,
  pub batch_size_visual: usize,
  pub batch_size_text: usize,
  pub status_ttl: Duration,
  pub status_cleanup_interval: Duration,
  pub representative_token_index: usize,
  pub data_dir: PathBuf,
  pub http_bind_addr: String,
  pub cors_allowed_origins: Vec<String>,
  pub query_cache_capacity: usize,
  pub watch_quiet_period: Duration,
}

fn env_str(key: &str, default: &str) -> String {
  std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
  std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Default for ProcessingConfig {
  fn default() -> Self {
    Self {
      supported_formats: DEFAULT_FORMATS.iter().map(|s| s.to_string()).collect(),
      max_file_size_mb: 50.0,
      upload_dir: PathBuf::from("./uploads"),
      text_chunk_size: 250,
      text_chunk_overlap: 50,
      page_render_dpi: 150,
      worker_threads: num_cpus::get().max(1),
      enable_queue: true,
      log_level: "info".to_string(),
      log_format: "pretty".to_string(),
      log_file: None,
      embed_device: EmbedDevice::Cpu,
      embed_precision: EmbedPrecision::Fp32,
      embed_dim: 128,
      batch_size_visual: 4,
      batch_size_text: 16,
      status_ttl: Duration::from_secs(3600),
      status_cleanup_interval: Duration::from_secs(15 * 60),
      representative_token_index: 0,
      data_dir: dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("docsearch"),
      http_bind_addr: "127.0.0.1:8787".to_string(),
      cors_allowed_origins: Vec::new(),
      query_cache_capacity: 1000,
      watch_quiet_period: Duration::from_secs(2),
    }
  }
}

impl ProcessingConfig {
  /// Build a config snapshot from the process environment. Missing optional
  /// variables fall back to documented defaults; nothing here can fail a
  /// startup for an absent variable.
  pub fn from_env() -> Self {
    let default = Self::default();

    let supported_formats = std::env::var("SUPPORTED_FORMATS")
      .ok()
      .map(|v| {
        v.split(',')
          .map(|s| s.trim().trim_start_matches('.').to_lowercase())
          .filter(|s| !s.is_empty())
          .collect::<HashSet<_>>()
      })
      .unwrap_or(default.supported_formats);

    let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
      .ok()
      .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
      .unwrap_or_default();

    Self {
      supported_formats,
      max_file_size_mb: env_parse("MAX_FILE_SIZE_MB", default.max_file_size_mb),
      upload_dir: env_str("UPLOAD_DIR", &default.upload_dir.to_string_lossy()).into(),
      text_chunk_size: env_parse("TEXT_CHUNK_SIZE", default.text_chunk_size),
      text_chunk_overlap: env_parse("TEXT_CHUNK_OVERLAP", default.text_chunk_overlap),
      page_render_dpi: env_parse("PAGE_RENDER_DPI", default.page_render_dpi),
      worker_threads: env_parse("WORKER_THREADS", default.worker_threads),
      enable_queue: env_parse("ENABLE_QUEUE", default.enable_queue),
      log_level: env_str("LOG_LEVEL", &default.log_level),
      log_format: env_str("LOG_FORMAT", &default.log_format),
      log_file: std::env::var("LOG_FILE").ok().map(PathBuf::from),
      embed_device: std::env::var("EMBED_DEVICE").map(|v| EmbedDevice::parse(&v)).unwrap_or(default.embed_device),
      embed_precision: std::env::var("EMBED_PRECISION")
        .map(|v| EmbedPrecision::parse(&v))
        .unwrap_or(default.embed_precision),
      embed_dim: env_parse("EMBED_DIM", default.embed_dim),
      batch_size_visual: env_parse("BATCH_SIZE_VISUAL", default.batch_size_visual),
      batch_size_text: env_parse("BATCH_SIZE_TEXT", default.batch_size_text),
      status_ttl: Duration::from_secs(env_parse("STATUS_TTL_SECONDS", default.status_ttl.as_secs())),
      status_cleanup_interval: Duration::from_secs(env_parse(
        "STATUS_CLEANUP_INTERVAL_SECONDS",
        default.status_cleanup_interval.as_secs(),
      )),
      representative_token_index: env_parse("REPRESENTATIVE_TOKEN_INDEX", default.representative_token_index),
      data_dir: env_str("DATA_DIR", &default.data_dir.to_string_lossy()).into(),
      http_bind_addr: env_str("HTTP_BIND_ADDR", &default.http_bind_addr),
      cors_allowed_origins,
      query_cache_capacity: env_parse("QUERY_CACHE_CAPACITY", default.query_cache_capacity),
      watch_quiet_period: Duration::from_millis(env_parse("WATCH_QUIET_PERIOD_MS", default.watch_quiet_period.as_millis() as u64)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_formats_include_spec_list() {
    let config = ProcessingConfig::default();
    for ext in ["pdf", "docx", "md", "csv", "png"] {
      assert!(config.supported_formats.contains(ext));
    }
  }

  #[test]
  fn device_fallback_chain_ends_at_cpu() {
    assert_eq!(EmbedDevice::Mps.fallback(), Some(EmbedDevice::Cuda));
    assert_eq!(EmbedDevice::Cuda.fallback(), Some(EmbedDevice::Cpu));
    assert_eq!(EmbedDevice::Cpu.fallback(), None);
  }

  #[test]
  fn precision_fallback_chain_ends_at_fp32() {
    assert_eq!(EmbedPrecision::Fp16.fallback(), Some(EmbedPrecision::Int8));
    assert_eq!(EmbedPrecision::Int8.fallback(), Some(EmbedPrecision::Fp32));
    assert_eq!(EmbedPrecision::Fp32.fallback(), None);
  }
}
