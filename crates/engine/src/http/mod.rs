//! HTTP surface: axum router wired over [`IngestionPipeline`] and
//! [`SearchEngine`] (SPEC_FULL.md §6). Not part of the lineage's own
//! transport — its daemon speaks a custom IPC protocol — so this module is
//! grounded instead on the retrieved `nans28-eywa` server's route/handler
//! shape (`State<Arc<AppState>>` extractor, `(StatusCode, Json(...))`
//! handler returns, `CorsLayer` composition).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::config::ProcessingConfig;
use crate::error::EngineError;
use crate::events::all;
use crate::pipeline::IngestionPipeline;
use crate::search::{SearchFilters, SearchMode, SearchRequest, SearchResponse};
use crate::status::StatusManager;
use crate::store::{Collection, VectorStore};

pub struct AppState {
  pub pipeline: Arc<IngestionPipeline>,
  pub status: Arc<StatusManager>,
  pub search: Arc<crate::search::SearchEngine>,
  pub store: Arc<VectorStore>,
}

/// Build the router, applying CORS from [`ProcessingConfig::cors_allowed_origins`].
/// An empty allow-list means no cross-origin requests are permitted — a
/// wildcard is never the default (SPEC_FULL.md §6).
pub fn router(state: Arc<AppState>, config: &ProcessingConfig) -> Router {
  let cors = build_cors(config);

  Router::new()
    .route("/process", post(process))
    .route("/status/{doc_id}", get(get_status))
    .route("/status/queue", get(get_queue))
    .route("/status/health", get(get_health))
    .route("/status/stream", get(stream_status))
    .route("/search", post(search))
    .layer(cors)
    .with_state(state)
}

fn build_cors(config: &ProcessingConfig) -> CorsLayer {
  let origins: Vec<HeaderValue> = config.cors_allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
  let mut layer = CorsLayer::new().allow_methods([Method::GET, Method::POST]);
  layer = if origins.is_empty() { layer } else { layer.allow_origin(origins) };
  layer
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
  file_path: String,
  filename: Option<String>,
}

async fn process(State(state): State<Arc<AppState>>, Json(req): Json<ProcessRequest>) -> Result<impl IntoResponse, EngineError> {
  let bytes = tokio::fs::read(&req.file_path).await.map_err(|e| EngineError::InvalidRequest(format!("cannot read {}: {e}", req.file_path)))?;
  let filename = req.filename.unwrap_or_else(|| req.file_path.clone());
  let doc_id = state.pipeline.submit(&filename, bytes, json!({"source_path": req.file_path}))?;
  let status = state.status.get(&doc_id);
  Ok(Json(json!({ "doc_id": doc_id, "status": status })))
}

async fn get_status(State(state): State<Arc<AppState>>, Path(doc_id): Path<String>) -> Result<impl IntoResponse, EngineError> {
  state.status.get(&doc_id).map(Json).ok_or_else(|| EngineError::DocumentNotFound(doc_id))
}

#[derive(Debug, Deserialize)]
struct QueueQuery {
  status: Option<String>,
  limit: Option<usize>,
}

async fn get_queue(State(state): State<Arc<AppState>>, Query(query): Query<QueueQuery>) -> impl IntoResponse {
  let limit = query.limit.unwrap_or(100);
  let all_statuses = state.status.list_all(limit);
  let queue: Vec<_> = match query.status.as_deref() {
    Some(filter) => all_statuses.into_iter().filter(|s| format!("{:?}", s.state).to_lowercase() == filter.to_lowercase()).collect(),
    None => all_statuses,
  };
  let histogram = state.status.count_by_state();

  Json(json!({
    "queue": queue,
    "total": histogram.queued + histogram.parsing + histogram.embedding_visual + histogram.embedding_text + histogram.storing + histogram.completed + histogram.failed,
    "active": histogram.queued + histogram.parsing + histogram.embedding_visual + histogram.embedding_text + histogram.storing,
    "completed": histogram.completed,
    "failed": histogram.failed,
  }))
}

async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  let visual = state.store.count(Collection::Visual).await.unwrap_or(0);
  let text = state.store.count(Collection::Text).await.unwrap_or(0);
  Json(json!({ "ok": true, "collections": { "visual": visual, "text": text } }))
}

async fn stream_status(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let mut subscription = state.status.events().subscribe(all());
  let stream = async_stream::stream! {
    while let Some(event) = subscription.rx.recv().await {
      let event = Event::default().json_data(&event).unwrap_or_else(|_| Event::default().data("{}"));
      yield Ok::<_, Infallible>(event);
    }
  };
  Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::new())
}

#[derive(Debug, Deserialize)]
struct SearchBody {
  query: String,
  #[serde(default = "default_k")]
  k: usize,
  #[serde(default)]
  mode: SearchMode,
  #[serde(default)]
  filters: SearchFiltersBody,
}

fn default_k() -> usize {
  10
}

#[derive(Debug, Default, Deserialize)]
struct SearchFiltersBody {
  doc_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct SearchResponseBody {
  results: Vec<crate::search::SearchHit>,
  partial: bool,
}

impl From<SearchResponse> for SearchResponseBody {
  fn from(r: SearchResponse) -> Self {
    Self { results: r.results, partial: r.partial }
  }
}

async fn search(State(state): State<Arc<AppState>>, Json(body): Json<SearchBody>) -> Result<impl IntoResponse, EngineError> {
  let request = SearchRequest {
    query: body.query,
    k_final: body.k,
    mode: body.mode,
    filters: SearchFilters { doc_ids: body.filters.doc_ids },
  };
  let response = state.search.search(&request).await?;
  Ok(Json(SearchResponseBody::from(response)))
}
