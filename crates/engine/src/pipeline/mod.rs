//! IngestionPipeline: validate -> parse -> embed (visual/text) -> store,
//! one task per document, concurrency bounded across documents rather than
//! within one (spec.md §4.7, §5). Grounded on the teacher's
//! `actor/pipeline` for its use of `CancellationToken` and `thiserror`
//! stage errors, but reshaped: the teacher fans a single corpus scan
//! through a multi-stage channel pipeline, while this crate processes
//! documents independently and bounds fan-out with a `Semaphore`, since
//! each submission here is an already-identified single document rather
//! than a directory crawl.

pub mod chunker;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ProcessingConfig;
use crate::embedding::EmbeddingEngine;
use crate::error::{EmbeddingError, PipelineError, StoreError};
use crate::events::EventBus;
use crate::parser::{DocumentParser, ParsedDocument, ParserRegistry};
use crate::status::{DocState, StatusManager, UpdateFields};
use crate::store::{Collection, PendingRecord, VectorStore};
use crate::validate;

const MAX_RETRIES: u32 = 2;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

const PARSE_TIMEOUT: Duration = Duration::from_secs(60);
const EMBED_TIMEOUT: Duration = Duration::from_secs(300);
const STORE_TIMEOUT: Duration = Duration::from_secs(60);

/// Orchestrates one document through parsing, embedding, and storage.
/// Shared `Arc` across HTTP handlers, the CLI, and the filesystem watcher.
pub struct IngestionPipeline {
  config: Arc<ProcessingConfig>,
  status: Arc<StatusManager>,
  store: Arc<VectorStore>,
  embedding: Arc<EmbeddingEngine>,
  parsers: Arc<ParserRegistry>,
  limiter: Arc<Semaphore>,
  cancellations: DashMap<String, CancellationToken>,
}

impl IngestionPipeline {
  pub fn new(
    config: Arc<ProcessingConfig>,
    events: Arc<EventBus>,
    store: Arc<VectorStore>,
    embedding: Arc<EmbeddingEngine>,
  ) -> Self {
    let worker_threads = config.worker_threads.max(1);
    Self {
      status: Arc::new(StatusManager::new(events)),
      limiter: Arc::new(Semaphore::new(worker_threads)),
      config,
      store,
      embedding,
      parsers: Arc::new(ParserRegistry::with_builtins()),
      cancellations: DashMap::new(),
    }
  }

  pub fn status_manager(&self) -> Arc<StatusManager> {
    self.status.clone()
  }

  /// Validate and accept `bytes` as `filename` for asynchronous processing,
  /// returning the content-addressed `doc_id` immediately. Resubmitting the
  /// same bytes while a prior run is still active is an at-most-once build:
  /// the second caller gets back the same `doc_id` and observes the first
  /// run's status rather than an error (spec.md §4.7 "at-most-once build").
  /// Resubmitting after a terminal outcome restarts processing from scratch
  /// (spec.md §4.1 idempotent resubmission).
  pub fn submit(self: &Arc<Self>, filename: &str, bytes: Vec<u8>, metadata: serde_json::Value) -> Result<String, PipelineError> {
    validate::validate(std::path::Path::new(filename), bytes.len() as u64, &self.config)?;
    let doc_id = fingerprint(&bytes);

    if let Err(err) = self.status.create(&doc_id, filename, metadata) {
      return match err {
        crate::status::StatusError::AlreadyActive(_) => Ok(doc_id),
        other => Err(PipelineError::InvalidTransition(other.to_string())),
      };
    }

    let token = CancellationToken::new();
    self.cancellations.insert(doc_id.clone(), token.clone());

    let pipeline = self.clone();
    let filename = filename.to_string();
    let task_doc_id = doc_id.clone();
    tokio::spawn(async move {
      let doc_id = task_doc_id;
      let _permit = pipeline.limiter.clone().acquire_owned().await.expect("ingestion semaphore never closes");

      // Run the stage chain on its own task so a panic inside a parser or
      // provider surfaces as a JoinError here rather than unwinding this
      // supervisor task silently (spec.md §7: panics never crash the process).
      let worker = {
        let pipeline = pipeline.clone();
        let doc_id = doc_id.clone();
        let filename = filename.clone();
        tokio::spawn(async move { pipeline.run(&doc_id, &filename, bytes, token).await })
      };

      match worker.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(doc_id, error = %err, "document processing failed"),
        Err(join_err) => {
          warn!(doc_id, error = %join_err, "document processing task panicked");
          let _ = pipeline.status.mark_failed(&doc_id, format!("internal: worker panicked: {join_err}"));
        }
      }
      pipeline.cancellations.remove(&doc_id);
    });

    Ok(doc_id)
  }

  /// Request cancellation of an in-flight document; a no-op if the document
  /// is not currently processing.
  pub fn cancel(&self, doc_id: &str) -> bool {
    if let Some(token) = self.cancellations.get(doc_id) {
      token.cancel();
      true
    } else {
      false
    }
  }

  #[tracing::instrument(level = "trace", skip(self, bytes, token), fields(bytes = bytes.len()))]
  async fn run(&self, doc_id: &str, filename: &str, bytes: Vec<u8>, token: CancellationToken) -> Result<(), PipelineError> {
    info!(doc_id, filename, "starting document processing");

    if let Err(err) = self.run_stages(doc_id, filename, bytes, &token).await {
      let message = if token.is_cancelled() { "cancelled".to_string() } else { err.to_string() };
      // A failure or cancellation after embed_visual's upsert must not leave
      // that stage's rows behind (spec.md §4.7 stages 2-4, §8 cancellation
      // boundary: no entries in either collection).
      let _ = self.store.delete(doc_id).await;
      let _ = self.status.mark_failed(doc_id, message);
      return Err(err);
    }
    Ok(())
  }

  async fn run_stages(&self, doc_id: &str, filename: &str, bytes: Vec<u8>, token: &CancellationToken) -> Result<(), PipelineError> {
    self
      .status
      .update(doc_id, DocState::Parsing, 0.05, UpdateFields { stage: Some("parsing".into()), ..Default::default() })
      .map_err(|e| PipelineError::InvalidTransition(e.to_string()))?;

    let extension = extension_of(filename);
    let parser = self.parsers.get(&extension).ok_or_else(|| {
      PipelineError::Parse(format!("no parser registered for extension '{extension}' (external collaborator)"))
    })?;
    let parsed = parse_with_timeout(parser, bytes, self.config.clone()).await?;
    bail_if_cancelled(token)?;

    let visual_state = if parsed.pages.is_empty() { None } else { Some(()) };
    if visual_state.is_some() {
      with_stage_timeout("embed", EMBED_TIMEOUT, self.embed_visual(doc_id, &parsed)).await?;
      bail_if_cancelled(token)?;
    }

    with_stage_timeout("embed", EMBED_TIMEOUT, self.embed_text(doc_id, &parsed, visual_state.is_none())).await?;
    bail_if_cancelled(token)?;

    self
      .status
      .update(doc_id, DocState::Storing, 0.95, UpdateFields { stage: Some("storing".into()), ..Default::default() })?;

    let mut completed_meta = serde_json::json!({});
    if let Some(total) = parsed.page_count {
      completed_meta["pages"] = serde_json::json!(total);
    }
    completed_meta["chunks"] = serde_json::json!(parsed.chunks.len());
    self.status.mark_completed(doc_id, completed_meta)?;
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip(self, parsed), fields(pages = parsed.pages.len()))]
  async fn embed_visual(&self, doc_id: &str, parsed: &ParsedDocument) -> Result<(), PipelineError> {
    let filename = self.status.get(doc_id).map(|s| s.filename).unwrap_or_default();
    let total = parsed.pages.len();
    let batch_size = self.config.batch_size_visual.max(1);
    let mut records = Vec::with_capacity(total);

    for (done, batch) in parsed.pages.chunks(batch_size).enumerate() {
      let images: Vec<Vec<u8>> = batch.iter().map(|p| p.image_bytes.clone()).collect();
      let embeddings = retry(|| self.embedding.embed_images(&images)).await?;
      for (page, embedding) in batch.iter().zip(embeddings) {
        records.push(PendingRecord { index: page.page_number, embedding, content_type: None });
      }

      let processed = (done * batch_size + batch.len()).min(total);
      let progress = 0.10 + 0.50 * (processed as f64 / total.max(1) as f64);
      self.status.update(
        doc_id,
        DocState::EmbeddingVisual,
        progress,
        UpdateFields { stage: Some("embedding_visual".into()), page: Some(processed as u32), total_pages: parsed.page_count },
      )?;
    }

    with_stage_timeout("store", STORE_TIMEOUT, retry(|| self.store.upsert(Collection::Visual, doc_id, &filename, &records))).await?;
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip(self, parsed), fields(chunks = parsed.chunks.len()))]
  async fn embed_text(&self, doc_id: &str, parsed: &ParsedDocument, first_stage: bool) -> Result<(), PipelineError> {
    let filename = self.status.get(doc_id).map(|s| s.filename).unwrap_or_default();
    let total = parsed.chunks.len();
    let batch_size = self.config.batch_size_text.max(1);
    let mut records = Vec::with_capacity(total);

    let stage_progress = |processed: usize| 0.60 + 0.30 * (processed as f64 / total.max(1) as f64);

    if total == 0 {
      self.status.update(
        doc_id,
        DocState::EmbeddingText,
        if first_stage { 0.10 } else { 0.60 },
        UpdateFields { stage: Some("embedding_text".into()), ..Default::default() },
      )?;
      return Ok(());
    }

    for (done, batch) in parsed.chunks.chunks(batch_size).enumerate() {
      let texts: Vec<String> = batch.iter().map(|c| c.body.clone()).collect();
      let embeddings = retry(|| self.embedding.embed_text(&texts)).await?;
      for (chunk, embedding) in batch.iter().zip(embeddings) {
        records.push(PendingRecord {
          index: chunk.chunk_index,
          embedding,
          content_type: Some(chunk.content_type.to_string()),
        });
      }

      let processed = (done * batch_size + batch.len()).min(total);
      self.status.update(
        doc_id,
        DocState::EmbeddingText,
        stage_progress(processed),
        UpdateFields { stage: Some("embedding_text".into()), ..Default::default() },
      )?;
    }

    with_stage_timeout("store", STORE_TIMEOUT, retry(|| self.store.upsert(Collection::Text, doc_id, &filename, &records))).await?;
    Ok(())
  }
}

/// Runs a (CPU-bound, synchronous) parser off the async runtime via
/// `spawn_blocking`, bounded by [`PARSE_TIMEOUT`] (spec.md §5: parse 60s).
async fn parse_with_timeout(
  parser: Arc<dyn DocumentParser>,
  bytes: Vec<u8>,
  config: Arc<ProcessingConfig>,
) -> Result<ParsedDocument, PipelineError> {
  let handle = tokio::task::spawn_blocking(move || parser.parse(&bytes, &config));
  match tokio::time::timeout(PARSE_TIMEOUT, handle).await {
    Ok(Ok(result)) => result,
    Ok(Err(join_err)) => Err(PipelineError::Internal(format!("parser task panicked: {join_err}"))),
    Err(_) => Err(PipelineError::StageTimeout("parse")),
  }
}

/// Bounds an already-async stage future, converting an elapsed deadline into
/// [`PipelineError::StageTimeout`] (spec.md §5: embed 300s, store 60s).
async fn with_stage_timeout<F, T>(stage: &'static str, deadline: Duration, fut: F) -> Result<T, PipelineError>
where
  F: std::future::Future<Output = Result<T, PipelineError>>,
{
  match tokio::time::timeout(deadline, fut).await {
    Ok(result) => result,
    Err(_) => Err(PipelineError::StageTimeout(stage)),
  }
}

fn bail_if_cancelled(token: &CancellationToken) -> Result<(), PipelineError> {
  if token.is_cancelled() {
    Err(PipelineError::Cancelled)
  } else {
    Ok(())
  }
}

fn extension_of(filename: &str) -> String {
  std::path::Path::new(filename).extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default()
}

fn fingerprint(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

fn is_retryable(err: &PipelineError) -> bool {
  match err {
    PipelineError::Embedding(EmbeddingError::Timeout) => true,
    PipelineError::Embedding(EmbeddingError::Request(e)) => {
      e.is_timeout() || e.is_connect() || e.status().map(|s| s.as_u16()).is_some_and(|c| matches!(c, 429 | 502 | 503 | 504))
    }
    PipelineError::Store(StoreError::Lance(_)) | PipelineError::Store(StoreError::Io(_)) => true,
    _ => false,
  }
}

async fn retry<F, Fut, T, E>(mut f: F) -> Result<T, PipelineError>
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = Result<T, E>>,
  E: Into<PipelineError>,
{
  let mut attempt = 0;
  let mut backoff = INITIAL_BACKOFF;
  loop {
    match f().await {
      Ok(value) => return Ok(value),
      Err(err) => {
        let err = err.into();
        if attempt < MAX_RETRIES && is_retryable(&err) {
          warn!(attempt, error = %err, "retrying pipeline stage");
          tokio::time::sleep(backoff).await;
          backoff = (backoff * 2).min(MAX_BACKOFF);
          attempt += 1;
          continue;
        }
        return Err(err);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::embedding::{provider_from_config, Embedding, EmbeddingEngine};
  use crate::events::EventBus;
  use std::time::Duration as StdDuration;
  use tempfile::TempDir;

  async fn pipeline() -> (TempDir, Arc<IngestionPipeline>) {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(ProcessingConfig { embed_dim: 8, worker_threads: 2, ..ProcessingConfig::default() });
    let events = Arc::new(EventBus::new(64));
    let store = Arc::new(VectorStore::open(&dir.path().join("lancedb"), config.embed_dim, 0).await.unwrap());
    let provider = provider_from_config(&config);
    let embedding = Arc::new(EmbeddingEngine::new(&config, provider).await);
    (dir, Arc::new(IngestionPipeline::new(config, events, store, embedding)))
  }

  #[tokio::test]
  async fn submitting_a_markdown_file_completes() {
    let (_dir, pipeline) = pipeline().await;
    let doc_id = pipeline.submit("notes.md", b"# Title\n\nsome body text".to_vec(), serde_json::json!({})).unwrap();

    let mut status = pipeline.status_manager().get(&doc_id);
    for _ in 0..50 {
      if status.as_ref().map(|s| s.state.is_terminal()).unwrap_or(false) {
        break;
      }
      tokio::time::sleep(StdDuration::from_millis(20)).await;
      status = pipeline.status_manager().get(&doc_id);
    }

    assert_eq!(status.unwrap().state, DocState::Completed);
  }

  #[tokio::test]
  async fn unsupported_extension_is_rejected_before_submission() {
    let (_dir, pipeline) = pipeline().await;
    let err = pipeline.submit("archive.zip", b"data".to_vec(), serde_json::json!({}));
    assert!(err.is_err());
  }

  #[tokio::test]
  async fn unregistered_parser_extension_fails_the_document() {
    let (_dir, pipeline) = pipeline().await;
    let doc_id = pipeline.submit("report.pdf", b"%PDF-1.4 fake".to_vec(), serde_json::json!({})).unwrap();

    let mut status = pipeline.status_manager().get(&doc_id);
    for _ in 0..50 {
      if status.as_ref().map(|s| s.state.is_terminal()).unwrap_or(false) {
        break;
      }
      tokio::time::sleep(StdDuration::from_millis(20)).await;
      status = pipeline.status_manager().get(&doc_id);
    }

    assert_eq!(status.unwrap().state, DocState::Failed);
  }

  #[tokio::test]
  async fn cancellation_leaves_no_rows_from_an_earlier_stage_upsert() {
    let (_dir, pipeline) = pipeline().await;
    let doc_id = "deadbeef";
    pipeline.status.create(doc_id, "page.png", serde_json::json!({})).unwrap();

    // Simulate rows an earlier embed_visual upsert left behind before this
    // run was cancelled at the next stage boundary.
    let record = PendingRecord { index: 1, embedding: Embedding::new(vec![vec![0.1; 8]]), content_type: None };
    pipeline.store.upsert(Collection::Visual, doc_id, "page.png", &[record]).await.unwrap();
    assert_eq!(pipeline.store.count(Collection::Visual).await.unwrap(), 1);

    let token = CancellationToken::new();
    token.cancel();
    let err = pipeline.run(doc_id, "page.png", b"whatever".to_vec(), token).await.unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));

    assert_eq!(pipeline.store.count(Collection::Visual).await.unwrap(), 0);
    assert_eq!(pipeline.status_manager().get(doc_id).unwrap().state, DocState::Failed);
  }

  #[tokio::test]
  async fn concurrent_duplicate_submit_returns_the_same_doc_id() {
    let (_dir, pipeline) = pipeline().await;
    let bytes = b"# Title\n\nsome body text".to_vec();
    let first = pipeline.submit("notes.md", bytes.clone(), serde_json::json!({})).unwrap();
    let second = pipeline.submit("notes.md", bytes, serde_json::json!({})).unwrap();
    assert_eq!(first, second);
  }

  #[tokio::test]
  async fn stage_timeout_surfaces_as_stage_timeout_error() {
    let slow = async {
      tokio::time::sleep(StdDuration::from_millis(50)).await;
      Ok::<(), PipelineError>(())
    };
    let err = with_stage_timeout("embed", StdDuration::from_millis(5), slow).await.unwrap_err();
    assert!(matches!(err, PipelineError::StageTimeout("embed")));
  }
}
