//! `docsearchd` - self-hosted multimodal document search daemon and CLI.

mod logging;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docsearch_engine::embedding::{provider_from_config, EmbeddingEngine};
use docsearch_engine::http::{self, AppState};
use docsearch_engine::pipeline::IngestionPipeline;
use docsearch_engine::search::SearchEngine;
use docsearch_engine::store::VectorStore;
use docsearch_engine::watcher::DirectoryWatcher;
use docsearch_engine::{EventBus, ProcessingConfig};
use logging::{init_cli_logging, init_serve_logging};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "docsearchd")]
#[command(about = "Self-hosted multimodal document search")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Start the HTTP server, ingestion pool, and upload-directory watcher
  Serve,
  /// Ingest a single file through a local pipeline instance and print its final status
  Ingest {
    /// Path to the file to ingest
    path: String,
  },
  /// Query a running daemon's status endpoint
  Status {
    /// Document id, or omit for the queue summary
    doc_id: Option<String>,
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    daemon_url: String,
  },
  /// Query a running daemon's search endpoint
  Search {
    /// Search query text
    query: String,
    #[arg(short, long, default_value = "10")]
    k: usize,
    #[arg(long, value_enum, default_value = "hybrid")]
    mode: ModeArg,
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    daemon_url: String,
  },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ModeArg {
  Hybrid,
  VisualOnly,
  TextOnly,
}

impl ModeArg {
  fn as_wire(self) -> &'static str {
    match self {
      ModeArg::Hybrid => "hybrid",
      ModeArg::VisualOnly => "visual_only",
      ModeArg::TextOnly => "text_only",
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  match cli.command {
    Commands::Serve => {
      let config = ProcessingConfig::from_env();
      let _guard = init_serve_logging(&config);
      cmd_serve(config).await
    }
    Commands::Ingest { path } => {
      init_cli_logging();
      cmd_ingest(&path).await
    }
    Commands::Status { doc_id, daemon_url } => {
      init_cli_logging();
      cmd_status(&daemon_url, doc_id.as_deref()).await
    }
    Commands::Search { query, k, mode, daemon_url } => {
      init_cli_logging();
      cmd_search(&daemon_url, &query, k, mode.as_wire()).await
    }
  }
}

/// Build the pipeline/search/store stack shared by `serve` and `ingest`.
///
/// The vision-language provider is swappable at the trait boundary
/// ([`docsearch_engine::embedding::VisionLanguageProvider`]); this binary
/// wires the deterministic local provider so the daemon is runnable without
/// external inference infrastructure.
async fn build_engine(config: &Arc<ProcessingConfig>) -> Result<(Arc<IngestionPipeline>, Arc<SearchEngine>, Arc<VectorStore>)> {
  let events = Arc::new(EventBus::new(256));
  let embedding = Arc::new(EmbeddingEngine::new(config, provider_from_config(config)).await);
  let db_path = config.data_dir.join("lancedb");
  let store = Arc::new(VectorStore::open(&db_path, config.embed_dim, config.representative_token_index).await.context("opening vector store")?);
  let pipeline = Arc::new(IngestionPipeline::new(config.clone(), events, store.clone(), embedding.clone()));
  let search = Arc::new(SearchEngine::new(config, store.clone(), embedding));
  Ok((pipeline, search, store))
}

async fn cmd_serve(config: ProcessingConfig) -> Result<()> {
  let config = Arc::new(config);
  let (pipeline, search, store) = build_engine(&config).await?;
  let status = pipeline.status_manager();

  let cancel = CancellationToken::new();
  let watcher = DirectoryWatcher::spawn(&config, pipeline.clone(), cancel.clone()).context("starting upload directory watcher")?;
  let cleanup = status.clone().spawn_cleanup_loop(config.status_cleanup_interval, config.status_ttl, cancel.clone());

  let state = Arc::new(AppState { pipeline, status, search, store });
  let app = http::router(state, &config);

  let addr: SocketAddr = config.http_bind_addr.parse().context("parsing HTTP_BIND_ADDR")?;
  let listener = tokio::net::TcpListener::bind(addr).await.context("binding HTTP listener")?;
  tracing::info!(%addr, upload_dir = %config.upload_dir.display(), "docsearchd listening");

  let shutdown = async {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received shutdown signal");
    cancel.cancel();
  };

  axum::serve(listener, app).with_graceful_shutdown(shutdown).await.context("HTTP server error")?;
  watcher.abort();
  cleanup.abort();
  Ok(())
}

async fn cmd_ingest(path: &str) -> Result<()> {
  let config = Arc::new(ProcessingConfig::from_env());
  let (pipeline, _search, _store) = build_engine(&config).await?;
  let status = pipeline.status_manager();

  let bytes = tokio::fs::read(path).await.with_context(|| format!("reading {path}"))?;
  let filename = std::path::Path::new(path).file_name().and_then(|n| n.to_str()).unwrap_or(path).to_string();
  let doc_id = pipeline.submit(&filename, bytes, serde_json::json!({ "source_path": path }))?;

  loop {
    let Some(current) = status.get(&doc_id) else {
      bail!("status for {doc_id} disappeared while ingesting");
    };
    if current.state.is_terminal() {
      println!("{}", serde_json::to_string_pretty(&current)?);
      if matches!(current.state, docsearch_engine::status::DocState::Failed) {
        bail!("ingestion failed");
      }
      return Ok(());
    }
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
  }
}

async fn cmd_status(daemon_url: &str, doc_id: Option<&str>) -> Result<()> {
  let client = reqwest::Client::new();
  let url = match doc_id {
    Some(id) => format!("{daemon_url}/status/{id}"),
    None => format!("{daemon_url}/status/queue"),
  };
  let response = client.get(&url).send().await.with_context(|| format!("requesting {url}"))?;
  let status = response.status();
  let body: serde_json::Value = response.json().await.context("decoding daemon response")?;
  println!("{}", serde_json::to_string_pretty(&body)?);
  if !status.is_success() {
    bail!("daemon returned {status}");
  }
  Ok(())
}

async fn cmd_search(daemon_url: &str, query: &str, k: usize, mode: &str) -> Result<()> {
  let client = reqwest::Client::new();
  let body = serde_json::json!({ "query": query, "k": k, "mode": mode });
  let response = client
    .post(format!("{daemon_url}/search"))
    .json(&body)
    .send()
    .await
    .with_context(|| format!("requesting {daemon_url}/search"))?;
  let status = response.status();
  let body: serde_json::Value = response.json().await.context("decoding daemon response")?;
  println!("{}", serde_json::to_string_pretty(&body)?);
  if !status.is_success() {
    bail!("daemon returned {status}");
  }
  Ok(())
}
