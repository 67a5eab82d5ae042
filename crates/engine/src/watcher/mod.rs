//! Filesystem-watch ingestion trigger (SPEC_FULL.md §6): new files dropped
//! into `UPLOAD_DIR` are submitted to the [`IngestionPipeline`] once they've
//! settled for a quiet period. Grounded on the teacher's
//! `actor::watcher::WatcherTask` for the sync-callback-to-async-channel
//! bridge and the debounce-by-interval-tick loop, simplified: a document
//! here is identified by content hash rather than path, so there is no
//! rename/delete coalescing or incremental content cache to maintain —
//! every settled create/modify event is just a fresh `submit`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProcessingConfig;
use crate::pipeline::IngestionPipeline;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
  #[error("failed to create upload directory: {0}")]
  Io(#[from] std::io::Error),
  #[error("failed to initialize filesystem watcher: {0}")]
  Init(#[source] notify::Error),
  #[error("failed to watch path: {0}")]
  Watch(#[source] notify::Error),
}

/// A file path seen settling, waiting out the quiet period before ingestion.
struct PendingFile {
  last_event: Instant,
}

/// Watches [`ProcessingConfig::upload_dir`] and submits settled files to the
/// pipeline. Holds the `notify` watcher alive for the task's lifetime.
pub struct DirectoryWatcher {
  root: PathBuf,
  quiet_period: Duration,
  pipeline: Arc<IngestionPipeline>,
  cancel: CancellationToken,
  _watcher: RecommendedWatcher,
  event_rx: mpsc::Receiver<Result<Event, notify::Error>>,
}

impl DirectoryWatcher {
  pub fn new(config: &ProcessingConfig, pipeline: Arc<IngestionPipeline>, cancel: CancellationToken) -> Result<Self, WatcherError> {
    let root = config.upload_dir.clone();
    info!(root = %root.display(), "initializing upload directory watcher");

    std::fs::create_dir_all(&root)?;

    let (event_tx, event_rx) = mpsc::channel::<Result<Event, notify::Error>>(256);

    let mut watcher = RecommendedWatcher::new(
      move |res| {
        let _ = event_tx.blocking_send(res);
      },
      Config::default(),
    )
    .map_err(WatcherError::Init)?;

    watcher.watch(&root, RecursiveMode::NonRecursive).map_err(WatcherError::Watch)?;

    Ok(Self {
      root,
      quiet_period: config.watch_quiet_period,
      pipeline,
      cancel,
      _watcher: watcher,
      event_rx,
    })
  }

  pub fn spawn(config: &ProcessingConfig, pipeline: Arc<IngestionPipeline>, cancel: CancellationToken) -> Result<tokio::task::JoinHandle<()>, WatcherError> {
    let watcher = Self::new(config, pipeline, cancel)?;
    Ok(tokio::spawn(watcher.run()))
  }

  pub async fn run(mut self) {
    info!(root = %self.root.display(), "upload watcher started");

    let mut pending: HashMap<PathBuf, PendingFile> = HashMap::new();
    let mut tick = tokio::time::interval(self.quiet_period);

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!("upload watcher shutting down (cancelled)");
          break;
        }

        event = self.event_rx.recv() => {
          match event {
            Some(Ok(event)) => self.note_event(&mut pending, event),
            Some(Err(e)) => warn!(error = %e, "upload watcher error"),
            None => {
              info!("upload watcher shutting down (channel closed)");
              break;
            }
          }
        }

        _ = tick.tick() => {
          self.flush_settled(&mut pending).await;
        }
      }
    }
  }

  fn note_event(&self, pending: &mut HashMap<PathBuf, PendingFile>, event: Event) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
      return;
    }

    for path in event.paths {
      if path.is_dir() {
        continue;
      }
      pending.insert(path, PendingFile { last_event: Instant::now() });
    }
  }

  async fn flush_settled(&self, pending: &mut HashMap<PathBuf, PendingFile>) {
    let now = Instant::now();
    let settled: Vec<PathBuf> = pending
      .iter()
      .filter(|(_, file)| now.duration_since(file.last_event) >= self.quiet_period)
      .map(|(path, _)| path.clone())
      .collect();

    for path in settled {
      pending.remove(&path);
      self.ingest(path).await;
    }
  }

  async fn ingest(&self, path: PathBuf) {
    let bytes = match tokio::fs::read(&path).await {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(path = %path.display(), error = %e, "failed to read settled file, skipping");
        return;
      }
    };

    let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("upload").to_string();

    match self.pipeline.submit(&filename, bytes, json!({ "source_path": path.display().to_string() })) {
      Ok(doc_id) => debug!(path = %path.display(), doc_id, "watched file submitted for ingestion"),
      Err(e) => warn!(path = %path.display(), error = %e, "watched file rejected"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pending_file_settles_after_quiet_period() {
    let file = PendingFile { last_event: Instant::now() - Duration::from_secs(5) };
    assert!(Instant::now().duration_since(file.last_event) >= Duration::from_secs(2));
  }
}
