//! SearchEngine: ANN recall then MaxSim rerank over [`VectorStore`],
//! optionally fused across the visual/text collections (spec.md §4.8).
//! Query-embedding caching and the two-stage timeout/partial-result
//! behavior are grounded on the teacher's `moka`-cached lookup pattern
//! and its use of `tokio::time::timeout` to bound remote calls.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ProcessingConfig;
use crate::embedding::{maxsim, Embedding, EmbeddingEngine};
use crate::error::EngineError;
use crate::store::{AnnHit, Collection, RecordMeta, VectorStore};

const STAGE1_TIMEOUT: Duration = Duration::from_secs(5);
const STAGE2_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
  #[default]
  Hybrid,
  VisualOnly,
  TextOnly,
}

/// What the caller wants back, beyond the bare query text (spec.md §4.8).
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
  pub doc_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
  pub query: String,
  pub k_final: usize,
  pub mode: SearchMode,
  pub filters: SearchFilters,
}

impl Default for SearchRequest {
  fn default() -> Self {
    Self { query: String::new(), k_final: 10, mode: SearchMode::Hybrid, filters: SearchFilters::default() }
  }
}

/// One ranked hit, the collapsed per-doc-per-location record (spec.md §4.8
/// Fusion). `kind` distinguishes a visual hit (page) from a text hit
/// (chunk) once `doc_id` has been deduplicated across collections.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
  pub doc_id: String,
  pub kind: &'static str,
  pub index: u32,
  pub repr_score: f32,
  pub maxsim_score: f32,
  pub meta: RecordMetaView,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordMetaView {
  pub filename: String,
  pub page_number: Option<u32>,
  pub chunk_index: Option<u32>,
  pub content_type: Option<String>,
  pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<RecordMeta> for RecordMetaView {
  fn from(meta: RecordMeta) -> Self {
    Self {
      filename: meta.filename,
      page_number: meta.page_number,
      chunk_index: meta.chunk_index,
      content_type: meta.content_type,
      created_at: meta.created_at,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
  pub results: Vec<SearchHit>,
  pub partial: bool,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
  query: String,
  provider: String,
  dim: usize,
}

pub struct SearchEngine {
  store: Arc<VectorStore>,
  embedding: Arc<EmbeddingEngine>,
  query_cache: Cache<CacheKey, Arc<Embedding>>,
}

impl SearchEngine {
  pub fn new(config: &ProcessingConfig, store: Arc<VectorStore>, embedding: Arc<EmbeddingEngine>) -> Self {
    Self {
      store,
      embedding,
      query_cache: Cache::builder().max_capacity(config.query_cache_capacity as u64).build(),
    }
  }

  pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, EngineError> {
    let query_embedding = self.embed_query_cached(&request.query).await?;

    let mut partial = false;
    let want_visual = !matches!(request.mode, SearchMode::TextOnly);
    let want_text = !matches!(request.mode, SearchMode::VisualOnly);
    let k_ann = (4 * request.k_final).max(50);

    let visual_hits = if want_visual {
      self.recall(Collection::Visual, &query_embedding, k_ann, &request.filters, &mut partial).await
    } else {
      Vec::new()
    };
    let text_hits = if want_text {
      self.recall(Collection::Text, &query_embedding, k_ann, &request.filters, &mut partial).await
    } else {
      Vec::new()
    };

    let visual_scored = self.rerank(Collection::Visual, &query_embedding, visual_hits, &mut partial).await;
    let text_scored = self.rerank(Collection::Text, &query_embedding, text_hits, &mut partial).await;

    let fused = fuse(visual_scored, text_scored, request.mode);
    let mut results = fused;
    results.truncate(request.k_final);

    Ok(SearchResponse { results, partial })
  }

  async fn embed_query_cached(&self, query: &str) -> Result<Arc<Embedding>, EngineError> {
    let key = CacheKey { query: query.to_string(), provider: "docsearch-engine".to_string(), dim: self.embedding.dimensions() };
    if let Some(cached) = self.query_cache.get(&key) {
      return Ok(cached);
    }
    let embedding = Arc::new(self.embedding.embed_query(query).await?);
    self.query_cache.insert(key, embedding.clone());
    Ok(embedding)
  }

  async fn recall(
    &self,
    collection: Collection,
    query: &Embedding,
    k_ann: usize,
    filters: &SearchFilters,
    partial: &mut bool,
  ) -> Vec<AnnHit> {
    let repr = query.representative(0).to_vec();
    let filter = filters.doc_ids.as_ref().map(|ids| {
      let list = ids.iter().map(|id| format!("'{}'", id.replace('\'', "''"))).collect::<Vec<_>>().join(", ");
      format!("doc_id IN ({list})")
    });

    match tokio::time::timeout(STAGE1_TIMEOUT, self.store.ann_search(collection, &repr, k_ann, filter.as_deref())).await {
      Ok(Ok(hits)) => hits,
      Ok(Err(err)) => {
        warn!(collection = collection.as_str(), error = %err, "ann recall failed");
        *partial = true;
        Vec::new()
      }
      Err(_) => {
        warn!(collection = collection.as_str(), "ann recall timed out");
        *partial = true;
        Vec::new()
      }
    }
  }

  async fn rerank(&self, collection: Collection, query: &Embedding, hits: Vec<AnnHit>, partial: &mut bool) -> Vec<ScoredHit> {
    if hits.is_empty() {
      return Vec::new();
    }
    let ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
    let top_repr = hits.iter().map(|h| h.repr_score).fold(f32::MIN, f32::max).max(f32::EPSILON);

    let full = match tokio::time::timeout(STAGE2_TIMEOUT, self.store.get_full_batch(collection, &ids)).await {
      Ok(Ok(map)) => map,
      Ok(Err(err)) => {
        warn!(collection = collection.as_str(), error = %err, "maxsim batch fetch failed");
        *partial = true;
        return Vec::new();
      }
      Err(_) => {
        warn!(collection = collection.as_str(), "maxsim rerank timed out");
        *partial = true;
        return Vec::new();
      }
    };

    hits
      .into_iter()
      .filter_map(|hit| {
        let (full_embedding, meta) = full.get(&hit.id)?;
        let maxsim_score = maxsim(query, full_embedding);
        Some(ScoredHit {
          collection,
          repr_score: hit.repr_score / top_repr,
          maxsim_score,
          meta: meta.clone(),
        })
      })
      .collect()
  }
}

struct ScoredHit {
  collection: Collection,
  repr_score: f32,
  maxsim_score: f32,
  meta: RecordMeta,
}

/// Fuse visual and text scores per `doc_id`, collapsing to the best
/// location in each collection, then ranking and truncating (spec.md §4.8
/// Fusion).
fn fuse(visual: Vec<ScoredHit>, text: Vec<ScoredHit>, mode: SearchMode) -> Vec<SearchHit> {
  let best_visual = best_per_doc(visual);
  let best_text = best_per_doc(text);

  let mut doc_ids: Vec<String> = best_visual.keys().chain(best_text.keys()).cloned().collect();
  doc_ids.sort();
  doc_ids.dedup();

  let mut fused: Vec<SearchHit> = doc_ids
    .into_iter()
    .filter_map(|doc_id| {
      let v = best_visual.get(&doc_id);
      let t = best_text.get(&doc_id);
      let (score, pick_visual) = match (v, t, mode) {
        (Some(v), Some(t), SearchMode::Hybrid) => (0.55 * v.maxsim_score + 0.45 * t.maxsim_score, v.maxsim_score >= t.maxsim_score),
        (Some(v), _, _) => (v.maxsim_score, true),
        (None, Some(t), _) => (t.maxsim_score, false),
        (None, None, _) => return None,
      };
      let chosen = if pick_visual { v? } else { t? };
      Some(SearchHit {
        doc_id,
        kind: if pick_visual { "page" } else { "chunk" },
        index: if pick_visual { chosen.meta.page_number.unwrap_or(0) } else { chosen.meta.chunk_index.unwrap_or(0) },
        repr_score: chosen.repr_score,
        maxsim_score: score,
        meta: chosen.meta.clone().into(),
      })
    })
    .collect();

  fused.sort_by(|a, b| {
    b.maxsim_score
      .partial_cmp(&a.maxsim_score)
      .unwrap_or(std::cmp::Ordering::Equal)
      .then_with(|| b.meta.created_at.cmp(&a.meta.created_at))
      .then_with(|| a.doc_id.cmp(&b.doc_id))
  });

  fused
}

fn best_per_doc(hits: Vec<ScoredHit>) -> std::collections::HashMap<String, ScoredHit> {
  let mut best: std::collections::HashMap<String, ScoredHit> = std::collections::HashMap::new();
  for hit in hits {
    best
      .entry(hit.meta.doc_id.clone())
      .and_modify(|existing| {
        if hit.maxsim_score > existing.maxsim_score {
          *existing = ScoredHit { collection: hit.collection, repr_score: hit.repr_score, maxsim_score: hit.maxsim_score, meta: hit.meta.clone() };
        }
      })
      .or_insert(hit);
  }
  best
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::embedding::provider_from_config;
  use crate::store::PendingRecord;
  use tempfile::TempDir;

  async fn engine() -> (TempDir, SearchEngine) {
    let dir = TempDir::new().unwrap();
    let config = ProcessingConfig { embed_dim: 8, ..ProcessingConfig::default() };
    let store = Arc::new(VectorStore::open(&dir.path().join("lancedb"), config.embed_dim, 0).await.unwrap());
    let embedding = Arc::new(EmbeddingEngine::new(&config, provider_from_config(&config)).await);
    (dir, SearchEngine::new(&config, store, embedding))
  }

  fn embedding_for(seed: f32) -> Embedding {
    Embedding::new(vec![(0..8).map(|d| seed + d as f32 * 0.01).collect()])
  }

  #[tokio::test]
  async fn search_returns_empty_results_on_empty_store() {
    let (_dir, engine) = engine().await;
    let response = engine.search(&SearchRequest { query: "hello".into(), ..Default::default() }).await.unwrap();
    assert!(response.results.is_empty());
    assert!(!response.partial);
  }

  #[tokio::test]
  async fn text_only_mode_ignores_visual_collection() {
    let (_dir, engine) = engine().await;
    engine
      .store
      .upsert(Collection::Visual, "doc1", "a.png", &[PendingRecord { index: 0, embedding: embedding_for(1.0), content_type: None }])
      .await
      .unwrap();

    let response = engine
      .search(&SearchRequest { query: "hello".into(), mode: SearchMode::TextOnly, ..Default::default() })
      .await
      .unwrap();
    assert!(response.results.is_empty());
  }

  #[tokio::test]
  async fn query_embedding_cache_returns_same_vector_twice() {
    let (_dir, engine) = engine().await;
    let first = engine.embed_query_cached("same query").await.unwrap();
    let second = engine.embed_query_cached("same query").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
  }
}
