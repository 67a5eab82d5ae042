//! StatusManager: concurrent-safe `doc_id -> ProcessingStatus` map with
//! listing and TTL cleanup (spec.md §3, §4.3). A single mutex guards the
//! map; every write copies its result out before releasing the lock and
//! only then publishes to the [`crate::events::EventBus`] — no callback
//! ever runs while the lock is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocState {
  Queued,
  Parsing,
  EmbeddingVisual,
  EmbeddingText,
  Storing,
  Completed,
  Failed,
}

impl DocState {
  pub fn is_terminal(self) -> bool {
    matches!(self, DocState::Completed | DocState::Failed)
  }

  /// Whether `self -> next` is a legal transition per spec.md §3.
  pub fn can_transition_to(self, next: DocState) -> bool {
    use DocState::*;
    matches!(
      (self, next),
      (Queued, Parsing)
        | (Parsing, EmbeddingVisual)
        | (Parsing, EmbeddingText)
        | (Parsing, Failed)
        | (EmbeddingVisual, EmbeddingText)
        | (EmbeddingVisual, Failed)
        | (EmbeddingText, Storing)
        | (EmbeddingText, Failed)
        | (Storing, Completed)
        | (Storing, Failed)
    )
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStatus {
  pub doc_id: String,
  pub filename: String,
  pub state: DocState,
  pub progress: f64,
  pub stage: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub page: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub total_pages: Option<u32>,
  pub started_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  pub elapsed_seconds: f64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub estimated_remaining_seconds: Option<f64>,
  #[serde(default)]
  pub metadata: serde_json::Value,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl ProcessingStatus {
  fn new(doc_id: String, filename: String, metadata: serde_json::Value) -> Self {
    let now = Utc::now();
    Self {
      doc_id,
      filename,
      state: DocState::Queued,
      progress: 0.0,
      stage: "queued".to_string(),
      page: None,
      total_pages: None,
      started_at: now,
      updated_at: now,
      completed_at: None,
      elapsed_seconds: 0.0,
      estimated_remaining_seconds: None,
      metadata,
      error: None,
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
  #[error("doc_id already has a non-terminal status: {0}")]
  AlreadyActive(String),
  #[error("unknown doc_id: {0}")]
  UnknownDocId(String),
  #[error("invalid transition from {from:?} to {to:?}")]
  InvalidTransition { from: DocState, to: DocState },
  #[error("progress {0} out of range [0,1]")]
  ProgressOutOfRange(f64),
}

/// Histogram of documents by state, as returned by [`StatusManager::count_by_state`].
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct StateHistogram {
  pub queued: usize,
  pub parsing: usize,
  pub embedding_visual: usize,
  pub embedding_text: usize,
  pub storing: usize,
  pub completed: usize,
  pub failed: usize,
}

pub struct StatusManager {
  inner: Mutex<HashMap<String, ProcessingStatus>>,
  events: Arc<EventBus>,
}

/// Fields an `update` call may set alongside state/progress.
#[derive(Debug, Default, Clone)]
pub struct UpdateFields {
  pub stage: Option<String>,
  pub page: Option<u32>,
  pub total_pages: Option<u32>,
}

impl StatusManager {
  pub fn new(events: Arc<EventBus>) -> Self {
    Self { inner: Mutex::new(HashMap::new()), events }
  }

  pub fn events(&self) -> Arc<EventBus> {
    self.events.clone()
  }

  pub fn create(&self, doc_id: &str, filename: &str, metadata: serde_json::Value) -> Result<ProcessingStatus, StatusError> {
    let mut guard = self.inner.lock().expect("status map poisoned");
    if let Some(existing) = guard.get(doc_id)
      && !existing.state.is_terminal()
    {
      return Err(StatusError::AlreadyActive(doc_id.to_string()));
    }
    let status = ProcessingStatus::new(doc_id.to_string(), filename.to_string(), metadata);
    guard.insert(doc_id.to_string(), status.clone());
    drop(guard);
    self.events.publish(crate::events::StatusEvent::from_status(&status));
    Ok(status)
  }

  pub fn get(&self, doc_id: &str) -> Option<ProcessingStatus> {
    self.inner.lock().expect("status map poisoned").get(doc_id).cloned()
  }

  pub fn update(
    &self,
    doc_id: &str,
    state: DocState,
    progress: f64,
    fields: UpdateFields,
  ) -> Result<ProcessingStatus, StatusError> {
    if !(0.0..=1.0).contains(&progress) {
      return Err(StatusError::ProgressOutOfRange(progress));
    }

    let status = {
      let mut guard = self.inner.lock().expect("status map poisoned");
      let current = guard.get(doc_id).ok_or_else(|| StatusError::UnknownDocId(doc_id.to_string()))?;
      if !current.state.can_transition_to(state) {
        return Err(StatusError::InvalidTransition { from: current.state, to: state });
      }
      let mut updated = current.clone();
      updated.state = state;
      updated.progress = progress.max(updated.progress);
      if let Some(stage) = fields.stage {
        updated.stage = stage;
      }
      if fields.page.is_some() {
        updated.page = fields.page;
      }
      if fields.total_pages.is_some() {
        updated.total_pages = fields.total_pages;
      }
      let now = Utc::now();
      updated.elapsed_seconds = (now - updated.started_at).num_milliseconds() as f64 / 1000.0;
      updated.updated_at = now;
      guard.insert(doc_id.to_string(), updated.clone());
      updated
    };
    self.events.publish(crate::events::StatusEvent::from_status(&status));
    Ok(status)
  }

  pub fn mark_completed(&self, doc_id: &str, metadata: serde_json::Value) -> Result<ProcessingStatus, StatusError> {
    let mut guard = self.inner.lock().expect("status map poisoned");
    let current = guard.get(doc_id).ok_or_else(|| StatusError::UnknownDocId(doc_id.to_string()))?;
    if !current.state.can_transition_to(DocState::Completed) {
      return Err(StatusError::InvalidTransition { from: current.state, to: DocState::Completed });
    }
    let mut updated = current.clone();
    let now = Utc::now();
    updated.state = DocState::Completed;
    updated.progress = 1.0;
    updated.stage = "completed".to_string();
    updated.completed_at = Some(now);
    updated.updated_at = now;
    updated.elapsed_seconds = (now - updated.started_at).num_milliseconds() as f64 / 1000.0;
    for (k, v) in metadata.as_object().cloned().unwrap_or_default() {
      updated.metadata[k] = v;
    }
    guard.insert(doc_id.to_string(), updated.clone());
    drop(guard);
    self.events.publish(crate::events::StatusEvent::from_status(&updated));
    Ok(updated)
  }

  pub fn mark_failed(&self, doc_id: &str, error: impl Into<String>) -> Result<ProcessingStatus, StatusError> {
    let mut guard = self.inner.lock().expect("status map poisoned");
    let current = guard.get(doc_id).ok_or_else(|| StatusError::UnknownDocId(doc_id.to_string()))?;
    if current.state.is_terminal() {
      return Err(StatusError::InvalidTransition { from: current.state, to: DocState::Failed });
    }
    let mut updated = current.clone();
    let now = Utc::now();
    updated.state = DocState::Failed;
    updated.stage = "failed".to_string();
    updated.error = Some(error.into());
    updated.updated_at = now;
    updated.elapsed_seconds = (now - updated.started_at).num_milliseconds() as f64 / 1000.0;
    guard.insert(doc_id.to_string(), updated.clone());
    drop(guard);
    self.events.publish(crate::events::StatusEvent::from_status(&updated));
    Ok(updated)
  }

  pub fn list_active(&self) -> Vec<ProcessingStatus> {
    let guard = self.inner.lock().expect("status map poisoned");
    let mut active: Vec<_> = guard.values().filter(|s| !s.state.is_terminal()).cloned().collect();
    active.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    active
  }

  pub fn list_all(&self, limit: usize) -> Vec<ProcessingStatus> {
    let guard = self.inner.lock().expect("status map poisoned");
    let mut all: Vec<_> = guard.values().cloned().collect();
    all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    all.truncate(limit);
    all
  }

  pub fn count_by_state(&self) -> StateHistogram {
    let guard = self.inner.lock().expect("status map poisoned");
    let mut histogram = StateHistogram::default();
    for status in guard.values() {
      match status.state {
        DocState::Queued => histogram.queued += 1,
        DocState::Parsing => histogram.parsing += 1,
        DocState::EmbeddingVisual => histogram.embedding_visual += 1,
        DocState::EmbeddingText => histogram.embedding_text += 1,
        DocState::Storing => histogram.storing += 1,
        DocState::Completed => histogram.completed += 1,
        DocState::Failed => histogram.failed += 1,
      }
    }
    histogram
  }

  /// Remove terminal entries older than `older_than`; returns the count removed.
  pub fn cleanup(&self, older_than: Duration) -> usize {
    let now = Utc::now();
    let mut guard = self.inner.lock().expect("status map poisoned");
    let before = guard.len();
    guard.retain(|_, status| {
      if !status.state.is_terminal() {
        return true;
      }
      let reference = status.completed_at.unwrap_or(status.updated_at);
      let age = now.signed_duration_since(reference);
      age.num_seconds() < older_than.as_secs() as i64
    });
    before - guard.len()
  }

  /// Spawn a background loop that calls [`StatusManager::cleanup`] every
  /// `interval`, removing terminal entries older than `ttl` (spec.md §4.3:
  /// "runs on a timer, default every 15 min, and on demand").
  pub fn spawn_cleanup_loop(self: Arc<Self>, interval: Duration, ttl: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
      let mut tick = tokio::time::interval(interval);
      tick.tick().await;
      loop {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => {
            info!("status cleanup loop shutting down");
            break;
          }
          _ = tick.tick() => {
            let removed = self.cleanup(ttl);
            if removed > 0 {
              debug!(removed, "status cleanup removed terminal entries past ttl");
            }
          }
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn manager() -> StatusManager {
    StatusManager::new(Arc::new(EventBus::new(16)))
  }

  #[test]
  fn histogram_counts_each_state_bucket() {
    let mgr = manager();
    mgr.create("a", "one.pdf", serde_json::json!({})).unwrap();
    mgr.create("b", "two.pdf", serde_json::json!({})).unwrap();
    mgr.update("b", DocState::Parsing, 0.05, UpdateFields::default()).unwrap();
    mgr.create("c", "three.pdf", serde_json::json!({})).unwrap();
    mgr.mark_failed("c", "boom").unwrap();

    let histogram = mgr.count_by_state();
    assert_eq!(histogram, StateHistogram { queued: 1, parsing: 1, failed: 1, ..Default::default() });
  }

  #[test]
  fn create_then_get_roundtrips() {
    let mgr = manager();
    mgr.create("abc", "file.pdf", serde_json::json!({})).unwrap();
    let status = mgr.get("abc").unwrap();
    assert_eq!(status.state, DocState::Queued);
    assert_eq!(status.progress, 0.0);
  }

  #[test]
  fn duplicate_create_while_active_fails() {
    let mgr = manager();
    mgr.create("abc", "file.pdf", serde_json::json!({})).unwrap();
    let err = mgr.create("abc", "file.pdf", serde_json::json!({})).unwrap_err();
    assert!(matches!(err, StatusError::AlreadyActive(_)));
  }

  #[test]
  fn valid_transition_sequence_succeeds() {
    let mgr = manager();
    mgr.create("abc", "file.pdf", serde_json::json!({})).unwrap();
    mgr.update("abc", DocState::Parsing, 0.05, UpdateFields::default()).unwrap();
    mgr.update("abc", DocState::EmbeddingVisual, 0.2, UpdateFields::default()).unwrap();
    mgr.update("abc", DocState::EmbeddingText, 0.7, UpdateFields::default()).unwrap();
    mgr.update("abc", DocState::Storing, 0.95, UpdateFields::default()).unwrap();
    let status = mgr.mark_completed("abc", serde_json::json!({"pages": 3})).unwrap();
    assert_eq!(status.state, DocState::Completed);
    assert_eq!(status.progress, 1.0);
  }

  #[test]
  fn invalid_transition_rejected() {
    let mgr = manager();
    mgr.create("abc", "file.pdf", serde_json::json!({})).unwrap();
    let err = mgr.update("abc", DocState::Storing, 0.5, UpdateFields::default()).unwrap_err();
    assert!(matches!(err, StatusError::InvalidTransition { .. }));
  }

  #[test]
  fn progress_out_of_range_rejected() {
    let mgr = manager();
    mgr.create("abc", "file.pdf", serde_json::json!({})).unwrap();
    let err = mgr.update("abc", DocState::Parsing, 1.5, UpdateFields::default()).unwrap_err();
    assert!(matches!(err, StatusError::ProgressOutOfRange(_)));
  }

  #[test]
  fn progress_is_monotonic_non_decreasing() {
    let mgr = manager();
    mgr.create("abc", "file.pdf", serde_json::json!({})).unwrap();
    mgr.update("abc", DocState::Parsing, 0.1, UpdateFields::default()).unwrap();
    // A lower-progress update for the same state should not regress progress.
    let status = mgr.update("abc", DocState::Parsing, 0.05, UpdateFields::default());
    // Parsing -> Parsing is not a legal transition per the state machine,
    // so this must fail rather than silently regress.
    assert!(status.is_err());
  }

  #[test]
  fn cleanup_removes_only_old_terminal_entries() {
    let mgr = manager();
    mgr.create("abc", "file.pdf", serde_json::json!({})).unwrap();
    mgr.mark_failed("abc", "boom").unwrap();
    let removed = mgr.cleanup(Duration::from_secs(0));
    assert_eq!(removed, 1);
    assert!(mgr.get("abc").is_none());
  }

  #[test]
  fn cleanup_preserves_active_entries() {
    let mgr = manager();
    mgr.create("abc", "file.pdf", serde_json::json!({})).unwrap();
    let removed = mgr.cleanup(Duration::from_secs(0));
    assert_eq!(removed, 0);
    assert!(mgr.get("abc").is_some());
  }

  #[tokio::test]
  async fn cleanup_loop_sweeps_terminal_entries_on_tick() {
    let mgr = Arc::new(manager());
    mgr.create("abc", "file.pdf", serde_json::json!({})).unwrap();
    mgr.mark_failed("abc", "boom").unwrap();

    let cancel = CancellationToken::new();
    let handle = mgr.clone().spawn_cleanup_loop(Duration::from_millis(10), Duration::from_secs(0), cancel.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert!(mgr.get("abc").is_none());
  }
}
