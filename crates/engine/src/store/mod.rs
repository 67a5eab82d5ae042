//! VectorStore: two logical collections (`visual`, `text`) over LanceDB,
//! an HNSW-class single-vector ANN index (spec.md §4.6). Each record keeps
//! a representative vector for ANN recall alongside a compressed full
//! token sequence (`seq_blob`) for MaxSim reranking, so a late-interaction
//! embedding round-trips through an index that natively only understands
//! single vectors — grounded on the teacher's `db::document::documents`
//! table wrapper, generalized from a single embedding column to the
//! repr/seq_blob pair this spec needs.

mod codec;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arrow_array::{Array, BinaryArray, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, connect};
use tracing::debug;

use crate::embedding::Embedding;
use crate::error::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
  Visual,
  Text,
}

impl Collection {
  pub fn as_str(self) -> &'static str {
    match self {
      Collection::Visual => "visual",
      Collection::Text => "text",
    }
  }

  pub fn kind_tag(self) -> &'static str {
    match self {
      Collection::Visual => "p",
      Collection::Text => "c",
    }
  }
}

/// `{doc_id, filename, page_number?, chunk_index?, content_type?, created_at}` (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct RecordMeta {
  pub doc_id: String,
  pub filename: String,
  pub page_number: Option<u32>,
  pub chunk_index: Option<u32>,
  pub content_type: Option<String>,
  pub created_at: DateTime<Utc>,
}

/// A page or chunk embedding pending upsert.
pub struct PendingRecord {
  pub index: u32,
  pub embedding: Embedding,
  pub content_type: Option<String>,
}

/// A candidate returned by [`VectorStore::ann_search`].
#[derive(Debug, Clone)]
pub struct AnnHit {
  pub id: String,
  pub repr_score: f32,
  pub meta: RecordMeta,
}

fn collection_schema(dim: usize) -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new(
      "repr",
      DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim as i32),
      false,
    ),
    Field::new("seq_blob", DataType::Binary, false),
    Field::new("seq_t", DataType::UInt32, false),
    Field::new("seq_d", DataType::UInt32, false),
    Field::new("doc_id", DataType::Utf8, false),
    Field::new("filename", DataType::Utf8, false),
    Field::new("page_number", DataType::UInt32, true),
    Field::new("chunk_index", DataType::UInt32, true),
    Field::new("content_type", DataType::Utf8, true),
    Field::new("created_at", DataType::Int64, false),
  ]))
}

pub struct VectorStore {
  connection: Connection,
  dim: usize,
  repr_index: usize,
}

impl VectorStore {
  /// Open (creating if absent) the `visual` and `text` tables at `db_path`.
  pub async fn open(db_path: &Path, dim: usize, repr_index: usize) -> Result<Self> {
    if let Some(parent) = db_path.parent() {
      tokio::fs::create_dir_all(parent).await.map_err(StoreError::Io)?;
    }
    let connection = connect(db_path.to_string_lossy().as_ref()).execute().await?;
    let store = Self { connection, dim, repr_index };
    store.ensure_tables().await?;
    Ok(store)
  }

  async fn ensure_tables(&self) -> Result<()> {
    let existing = self.connection.table_names().execute().await?;
    for collection in [Collection::Visual, Collection::Text] {
      if !existing.contains(&collection.as_str().to_string()) {
        debug!(collection = collection.as_str(), "creating vector store table");
        self
          .connection
          .create_empty_table(collection.as_str(), collection_schema(self.dim))
          .execute()
          .await?;
      }
    }
    Ok(())
  }

  async fn table(&self, collection: Collection) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(collection.as_str()).execute().await?)
  }

  /// Upsert `records` for `doc_id` into `collection`; each `(doc_id, index)`
  /// replaces any prior entry (spec.md §4.6 upsert_visual/upsert_text).
  pub async fn upsert(&self, collection: Collection, doc_id: &str, filename: &str, records: &[PendingRecord]) -> Result<()> {
    if records.is_empty() {
      return Ok(());
    }
    let table = self.table(collection).await?;
    let now = Utc::now();
    let batch = records_to_batch(collection, doc_id, filename, records, now, self.dim, self.repr_index)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], collection_schema(self.dim));

    let mut merge_insert = table.merge_insert(&["id"]);
    merge_insert.when_matched_update_all(None).when_not_matched_insert_all();
    merge_insert.execute(Box::new(batches)).await?;
    Ok(())
  }

  /// ANN search by representative vector, cosine-ordered (spec.md §4.6).
  pub async fn ann_search(&self, collection: Collection, repr_query: &[f32], k: usize, filter: Option<&str>) -> Result<Vec<AnnHit>> {
    let table = self.table(collection).await?;
    let mut query = table.vector_search(repr_query.to_vec())?.distance_type(DistanceType::Cosine).limit(k);
    if let Some(f) = filter {
      query = query.only_if(f);
    }

    let batches: Vec<RecordBatch> = query.execute().await?.try_collect().await?;
    let mut hits = Vec::new();
    for batch in &batches {
      for row in 0..batch.num_rows() {
        let id = get_string(batch, "id", row)?;
        let meta = meta_from_batch(batch, row)?;
        let distance = batch
          .column_by_name("_distance")
          .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
          .map(|a| a.value(row))
          .unwrap_or(1.0);
        hits.push(AnnHit { id, repr_score: 1.0 - distance, meta });
      }
    }
    Ok(hits)
  }

  /// Decode the full token sequence and metadata for one record.
  pub async fn get_full(&self, collection: Collection, id: &str) -> Result<(Embedding, RecordMeta)> {
    let table = self.table(collection).await?;
    let batches: Vec<RecordBatch> = table
      .query()
      .only_if(format!("id = '{}'", escape(id)))
      .execute()
      .await?
      .try_collect()
      .await?;

    for batch in &batches {
      if batch.num_rows() > 0 {
        return row_to_full(batch, 0);
      }
    }
    Err(StoreError::NotFound(id.to_string()))
  }

  /// Batch decode, one round trip (spec.md §4.6 get_full_batch).
  pub async fn get_full_batch(&self, collection: Collection, ids: &[String]) -> Result<HashMap<String, (Embedding, RecordMeta)>> {
    if ids.is_empty() {
      return Ok(HashMap::new());
    }
    let table = self.table(collection).await?;
    let list = ids.iter().map(|id| format!("'{}'", escape(id))).collect::<Vec<_>>().join(", ");
    let batches: Vec<RecordBatch> = table.query().only_if(format!("id IN ({list})")).execute().await?.try_collect().await?;

    let mut out = HashMap::with_capacity(ids.len());
    for batch in &batches {
      for row in 0..batch.num_rows() {
        let id = get_string(batch, "id", row)?;
        let (embedding, meta) = row_to_full(batch, row)?;
        out.insert(id, (embedding, meta));
      }
    }
    Ok(out)
  }

  /// Remove every entry whose `doc_id` matches, in both collections (spec.md §4.6 delete).
  pub async fn delete(&self, doc_id: &str) -> Result<()> {
    let filter = format!("doc_id = '{}'", escape(doc_id));
    for collection in [Collection::Visual, Collection::Text] {
      let table = self.table(collection).await?;
      table.delete(&filter).await?;
    }
    Ok(())
  }

  pub fn dimensions(&self) -> usize {
    self.dim
  }

  /// Row count for one collection, used by the health endpoint.
  pub async fn count(&self, collection: Collection) -> Result<usize> {
    let table = self.table(collection).await?;
    Ok(table.count_rows(None).await?)
  }
}

fn escape(value: &str) -> String {
  value.replace('\'', "''")
}

fn get_string(batch: &RecordBatch, name: &str, row: usize) -> Result<String> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .map(|a| a.value(row).to_string())
    .ok_or_else(|| StoreError::InvalidInput(format!("missing column {name}")))
}

fn get_optional_string(batch: &RecordBatch, name: &str, row: usize) -> Option<String> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .filter(|a| !a.is_null(row))
    .map(|a| a.value(row).to_string())
}

fn get_u32(batch: &RecordBatch, name: &str, row: usize) -> Result<u32> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| StoreError::InvalidInput(format!("missing column {name}")))
}

fn get_optional_u32(batch: &RecordBatch, name: &str, row: usize) -> Option<u32> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .filter(|a| !a.is_null(row))
    .map(|a| a.value(row))
}

fn meta_from_batch(batch: &RecordBatch, row: usize) -> Result<RecordMeta> {
  let created_at_millis = batch
    .column_by_name("created_at")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| StoreError::InvalidInput("missing column created_at".into()))?;
  let created_at = Utc.timestamp_millis_opt(created_at_millis).single().ok_or_else(|| StoreError::InvalidInput("invalid created_at".into()))?;

  Ok(RecordMeta {
    doc_id: get_string(batch, "doc_id", row)?,
    filename: get_string(batch, "filename", row)?,
    page_number: get_optional_u32(batch, "page_number", row),
    chunk_index: get_optional_u32(batch, "chunk_index", row),
    content_type: get_optional_string(batch, "content_type", row),
    created_at,
  })
}

fn row_to_full(batch: &RecordBatch, row: usize) -> Result<(Embedding, RecordMeta)> {
  let blob = batch
    .column_by_name("seq_blob")
    .and_then(|c| c.as_any().downcast_ref::<BinaryArray>())
    .map(|a| a.value(row).to_vec())
    .ok_or_else(|| StoreError::InvalidInput("missing column seq_blob".into()))?;
  let t = get_u32(batch, "seq_t", row)?;
  let d = get_u32(batch, "seq_d", row)?;
  let embedding = codec::decode(&blob, t, d)?;
  let meta = meta_from_batch(batch, row)?;
  Ok((embedding, meta))
}

#[allow(clippy::too_many_arguments)]
fn records_to_batch(
  collection: Collection,
  doc_id: &str,
  filename: &str,
  records: &[PendingRecord],
  now: DateTime<Utc>,
  dim: usize,
  repr_index: usize,
) -> Result<RecordBatch> {
  let mut ids = Vec::with_capacity(records.len());
  let mut repr_flat = Vec::with_capacity(records.len() * dim);
  let mut blobs = Vec::with_capacity(records.len());
  let mut seq_ts = Vec::with_capacity(records.len());
  let mut seq_ds = Vec::with_capacity(records.len());
  let mut page_numbers = Vec::with_capacity(records.len());
  let mut chunk_indices = Vec::with_capacity(records.len());
  let mut content_types = Vec::with_capacity(records.len());

  for record in records {
    ids.push(format!("{doc_id}:{}:{}", collection.kind_tag(), record.index));

    let mut repr = record.embedding.representative(repr_index).to_vec();
    repr.resize(dim, 0.0);
    repr_flat.extend(repr);

    let (blob, t, d) = codec::encode(&record.embedding)?;
    blobs.push(blob);
    seq_ts.push(t);
    seq_ds.push(d);

    match collection {
      Collection::Visual => {
        page_numbers.push(Some(record.index));
        chunk_indices.push(None);
      }
      Collection::Text => {
        page_numbers.push(None);
        chunk_indices.push(Some(record.index));
      }
    }
    content_types.push(record.content_type.clone());
  }

  let n = records.len();
  let repr_values = Float32Array::from(repr_flat);
  let repr_field = Arc::new(Field::new("item", DataType::Float32, true));
  let repr_array = FixedSizeListArray::try_new(repr_field, dim as i32, Arc::new(repr_values), None)?;

  let batch = RecordBatch::try_new(
    collection_schema(dim),
    vec![
      Arc::new(StringArray::from(ids)),
      Arc::new(repr_array),
      Arc::new(BinaryArray::from_iter_values(blobs.iter().map(|b| b.as_slice()))),
      Arc::new(UInt32Array::from(seq_ts)),
      Arc::new(UInt32Array::from(seq_ds)),
      Arc::new(StringArray::from(vec![doc_id.to_string(); n])),
      Arc::new(StringArray::from(vec![filename.to_string(); n])),
      Arc::new(UInt32Array::from(page_numbers)),
      Arc::new(UInt32Array::from(chunk_indices)),
      Arc::new(StringArray::from(content_types)),
      Arc::new(Int64Array::from(vec![now.timestamp_millis(); n])),
    ],
  )?;

  Ok(batch)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn embedding(tokens: usize, dim: usize, seed: f32) -> Embedding {
    Embedding::new((0..tokens).map(|t| (0..dim).map(|d| seed + t as f32 + d as f32 * 0.01).collect()).collect())
  }

  async fn store() -> (TempDir, VectorStore) {
    let dir = TempDir::new().unwrap();
    let store = VectorStore::open(&dir.path().join("lancedb"), 8, 0).await.unwrap();
    (dir, store)
  }

  #[tokio::test]
  async fn upsert_then_get_full_round_trips() {
    let (_dir, store) = store().await;
    let records = vec![PendingRecord { index: 0, embedding: embedding(3, 8, 1.0), content_type: None }];
    store.upsert(Collection::Visual, "doc1", "a.pdf", &records).await.unwrap();

    let (embedding_out, meta) = store.get_full(Collection::Visual, "doc1:p:0").await.unwrap();
    assert_eq!(embedding_out.tokens(), 3);
    assert_eq!(meta.doc_id, "doc1");
    assert_eq!(meta.page_number, Some(0));
  }

  #[tokio::test]
  async fn upsert_replaces_existing_entry_for_same_index() {
    let (_dir, store) = store().await;
    let first = vec![PendingRecord { index: 0, embedding: embedding(2, 8, 1.0), content_type: None }];
    store.upsert(Collection::Visual, "doc1", "a.pdf", &first).await.unwrap();

    let second = vec![PendingRecord { index: 0, embedding: embedding(5, 8, 9.0), content_type: None }];
    store.upsert(Collection::Visual, "doc1", "a.pdf", &second).await.unwrap();

    let (embedding_out, _) = store.get_full(Collection::Visual, "doc1:p:0").await.unwrap();
    assert_eq!(embedding_out.tokens(), 5);
  }

  #[tokio::test]
  async fn delete_removes_entries_in_both_collections() {
    let (_dir, store) = store().await;
    let visual = vec![PendingRecord { index: 0, embedding: embedding(1, 8, 1.0), content_type: None }];
    let text = vec![PendingRecord { index: 0, embedding: embedding(1, 8, 2.0), content_type: Some("paragraph".into()) }];
    store.upsert(Collection::Visual, "doc1", "a.pdf", &visual).await.unwrap();
    store.upsert(Collection::Text, "doc1", "a.pdf", &text).await.unwrap();

    store.delete("doc1").await.unwrap();

    assert!(store.get_full(Collection::Visual, "doc1:p:0").await.is_err());
    assert!(store.get_full(Collection::Text, "doc1:c:0").await.is_err());
  }

  #[tokio::test]
  async fn ann_search_finds_nearest_by_repr() {
    let (_dir, store) = store().await;
    let records = vec![
      PendingRecord { index: 0, embedding: embedding(2, 8, 1.0), content_type: None },
      PendingRecord { index: 1, embedding: embedding(2, 8, 50.0), content_type: None },
    ];
    store.upsert(Collection::Visual, "doc1", "a.pdf", &records).await.unwrap();

    let query = embedding(1, 8, 1.0).representative(0).to_vec();
    let hits = store.ann_search(Collection::Visual, &query, 1, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "doc1:p:0");
  }

  #[tokio::test]
  async fn get_full_batch_returns_all_requested_ids() {
    let (_dir, store) = store().await;
    let records = vec![
      PendingRecord { index: 0, embedding: embedding(1, 8, 1.0), content_type: None },
      PendingRecord { index: 1, embedding: embedding(1, 8, 2.0), content_type: None },
    ];
    store.upsert(Collection::Visual, "doc1", "a.pdf", &records).await.unwrap();

    let ids = vec!["doc1:p:0".to_string(), "doc1:p:1".to_string()];
    let batch = store.get_full_batch(Collection::Visual, &ids).await.unwrap();
    assert_eq!(batch.len(), 2);
  }
}
