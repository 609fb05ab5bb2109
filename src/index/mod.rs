#[cfg(test)]
mod tests;

use arrow::array::{
    Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use lancedb::{
    Connection, DistanceType,
    index::Index,
    query::{ExecutableQuery, QueryBase},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::document::ParsedDocument;
use crate::{RagError, Result};

/// Columns that get a scalar index for filtered queries.
const FILTER_COLUMNS: [&str; 3] = ["document_id", "document_name", "subject_id"];

/// One chunk row as stored in the vector collection: the chunk itself plus
/// the ownership metadata every query filters on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Position of the chunk within its document, 0-based
    pub sequence_index: u32,
    pub document_id: String,
    pub document_name: String,
    pub text: String,
    pub section_title: Option<String>,
    pub page_number: Option<u32>,
    pub token_count: u32,
    /// Patient the document belongs to; every search is scoped to one subject
    pub subject_id: String,
    pub owner_organization: String,
    pub created_by: String,
    /// RFC 3339 timestamp of when the row was written
    pub created_at: String,
}

/// A chunk returned from similarity search, with its similarity score
/// (1.0 - cosine distance; higher is better).
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub record: ChunkRecord,
    pub score: f32,
}

/// Vector store over chunk embeddings, backed by LanceDB.
///
/// Every read path requires a subject filter; cross-patient leakage is a
/// correctness bug, not a tuning concern.
pub struct VectorIndex {
    connection: Connection,
    table_name: String,
    vector_dimension: usize,
}

impl VectorIndex {
    /// Open (or create) the collection under the configured data directory.
    #[inline]
    pub async fn new(config: &Config) -> Result<Self> {
        let db_path = config.vector_database_path();
        debug!("Initializing vector index at path: {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RagError::Index(format!("Failed to create vector database directory: {}", e))
            })?;
        }

        let uri = format!("file://{}", db_path.display());
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| RagError::Index(format!("Failed to connect to LanceDB: {}", e)))?;

        let index = Self {
            connection,
            table_name: config.vector.collection.clone(),
            vector_dimension: config.embedding.dimension as usize,
        };

        index.ensure_collection().await?;

        info!(
            "Vector index ready: collection={}, dimension={}",
            index.table_name, index.vector_dimension
        );
        Ok(index)
    }

    /// Create the collection if missing, then make sure the filter columns
    /// are indexed. Idempotent.
    async fn ensure_collection(&self) -> Result<()> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| RagError::Index(format!("Failed to list tables: {}", e)))?;

        if !table_names.contains(&self.table_name) {
            info!("Creating collection: {}", self.table_name);
            self.connection
                .create_empty_table(&self.table_name, self.schema())
                .execute()
                .await
                .map_err(|e| RagError::Index(format!("Failed to create collection: {}", e)))?;
        }

        self.ensure_scalar_indexes().await
    }

    /// Scalar BTree indexes on the ownership columns keep filtered search
    /// from scanning the whole collection.
    async fn ensure_scalar_indexes(&self) -> Result<()> {
        let table = self.open_table().await?;

        let row_count = table
            .count_rows(None)
            .await
            .map_err(|e| RagError::Index(format!("Failed to count rows: {}", e)))?;
        if row_count == 0 {
            // LanceDB cannot build an index over zero rows.
            debug!("Collection is empty, deferring scalar index creation");
            return Ok(());
        }

        for column in FILTER_COLUMNS {
            if let Err(e) = table.create_index(&[column], Index::Auto).execute().await {
                let message = e.to_string();
                if message.to_lowercase().contains("already exist") {
                    debug!("Scalar index on {} already exists", column);
                } else {
                    warn!("Failed to create scalar index on {}: {}", column, message);
                }
            }
        }

        Ok(())
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    self.vector_dimension as i32,
                ),
                false,
            ),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("document_name", DataType::Utf8, false),
            Field::new("subject_id", DataType::Utf8, false),
            Field::new("owner_organization", DataType::Utf8, false),
            Field::new("created_by", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("section_title", DataType::Utf8, true),
            Field::new("page_number", DataType::UInt32, true),
            Field::new("sequence_index", DataType::UInt32, false),
            Field::new("token_count", DataType::UInt32, false),
            Field::new("created_at", DataType::Utf8, false),
        ]))
    }

    async fn open_table(&self) -> Result<lancedb::Table> {
        self.connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::Index(format!("Failed to open collection: {}", e)))
    }

    /// Replace all stored chunks for a document with a fresh set.
    ///
    /// Records and embeddings must be parallel slices. Existing rows for the
    /// same `document_id` are deleted first, so re-ingesting a document never
    /// duplicates it.
    #[inline]
    pub async fn index_document(
        &self,
        doc: &ParsedDocument,
        records: &[ChunkRecord],
        embeddings: &[Vec<f32>],
    ) -> Result<()> {
        if records.len() != embeddings.len() {
            return Err(RagError::Index(format!(
                "Chunk/embedding count mismatch: {} vs {}",
                records.len(),
                embeddings.len()
            )));
        }

        for (i, embedding) in embeddings.iter().enumerate() {
            if embedding.len() != self.vector_dimension {
                return Err(RagError::Index(format!(
                    "Embedding {} has dimension {}, expected {}",
                    i,
                    embedding.len(),
                    self.vector_dimension
                )));
            }
        }

        self.ensure_collection().await?;

        let document_id = records
            .first()
            .map_or(doc.id.as_str(), |r| r.document_id.as_str());
        let table = self.open_table().await?;

        // Delete-then-insert keyed on document_id keeps re-indexing idempotent.
        let predicate = format!("document_id = '{}'", escape_literal(document_id));
        table
            .delete(&predicate)
            .await
            .map_err(|e| RagError::Index(format!("Failed to delete existing chunks: {}", e)))?;

        if records.is_empty() {
            debug!("No chunks to index for document: {}", document_id);
            return Ok(());
        }

        let batch = self.create_record_batch(records, embeddings)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| RagError::Index(format!("Failed to insert chunks: {}", e)))?;

        // First insert into a fresh collection unlocks index creation.
        self.ensure_scalar_indexes().await?;

        info!(
            "Indexed {} chunks for document: {}",
            records.len(),
            document_id
        );
        Ok(())
    }

    fn create_record_batch(
        &self,
        records: &[ChunkRecord],
        embeddings: &[Vec<f32>],
    ) -> Result<RecordBatch> {
        let len = records.len();

        let mut ids = Vec::with_capacity(len);
        let mut document_ids = Vec::with_capacity(len);
        let mut document_names = Vec::with_capacity(len);
        let mut subject_ids = Vec::with_capacity(len);
        let mut owner_organizations = Vec::with_capacity(len);
        let mut created_bys = Vec::with_capacity(len);
        let mut texts = Vec::with_capacity(len);
        let mut section_titles = Vec::with_capacity(len);
        let mut page_numbers = Vec::with_capacity(len);
        let mut sequence_indices = Vec::with_capacity(len);
        let mut token_counts = Vec::with_capacity(len);
        let mut created_ats = Vec::with_capacity(len);

        for record in records {
            // Row ids are regenerated on every write; identity lives in
            // (document_id, sequence_index).
            ids.push(Uuid::new_v4().to_string());
            document_ids.push(record.document_id.as_str());
            document_names.push(record.document_name.as_str());
            subject_ids.push(record.subject_id.as_str());
            owner_organizations.push(record.owner_organization.as_str());
            created_bys.push(record.created_by.as_str());
            texts.push(record.text.as_str());
            section_titles.push(record.section_title.as_deref());
            page_numbers.push(record.page_number);
            sequence_indices.push(record.sequence_index);
            token_counts.push(record.token_count);
            created_ats.push(record.created_at.as_str());
        }

        let mut flat_values = Vec::with_capacity(len * self.vector_dimension);
        for embedding in embeddings {
            flat_values.extend_from_slice(embedding);
        }
        let values_array = Float32Array::from(flat_values);
        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            field,
            self.vector_dimension as i32,
            Arc::new(values_array),
            None,
        )
        .map_err(|e| RagError::Index(format!("Failed to create vector array: {}", e)))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(vector_array),
            Arc::new(StringArray::from(document_ids)),
            Arc::new(StringArray::from(document_names)),
            Arc::new(StringArray::from(subject_ids)),
            Arc::new(StringArray::from(owner_organizations)),
            Arc::new(StringArray::from(created_bys)),
            Arc::new(StringArray::from(texts)),
            Arc::new(StringArray::from(section_titles)),
            Arc::new(UInt32Array::from(page_numbers)),
            Arc::new(UInt32Array::from(sequence_indices)),
            Arc::new(UInt32Array::from(token_counts)),
            Arc::new(StringArray::from(created_ats)),
        ];

        RecordBatch::try_new(self.schema(), arrays)
            .map_err(|e| RagError::Index(format!("Failed to create record batch: {}", e)))
    }

    /// Similarity search scoped to a single subject.
    ///
    /// The subject filter is mandatory; `document_id` optionally narrows to
    /// one document. Results come back ordered by descending similarity. An
    /// empty result set is not an error.
    #[inline]
    pub async fn search(
        &self,
        query_vector: &[f32],
        subject_id: &str,
        limit: usize,
        document_id: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        if query_vector.len() != self.vector_dimension {
            return Err(RagError::Index(format!(
                "Query vector has dimension {}, expected {}",
                query_vector.len(),
                self.vector_dimension
            )));
        }

        debug!(
            "Searching collection for subject {} (limit: {})",
            subject_id, limit
        );

        self.ensure_collection().await?;

        let mut filter = format!("subject_id = '{}'", escape_literal(subject_id));
        if let Some(doc_id) = document_id {
            filter.push_str(&format!(
                " AND document_id = '{}'",
                escape_literal(doc_id)
            ));
        }

        let table = self.open_table().await?;
        let results = table
            .vector_search(query_vector)
            .map_err(|e| RagError::Index(format!("Failed to create vector search: {}", e)))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .only_if(filter)
            .limit(limit)
            .execute()
            .await
            .map_err(|e| RagError::Index(format!("Failed to execute search: {}", e)))?;

        self.collect_scored_chunks(results).await
    }

    /// Up to `limit` stored chunks of one document, in sequence order.
    #[inline]
    pub async fn chunks_for_document(
        &self,
        document_id: &str,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>> {
        let table = self.open_table().await?;
        let filter = format!("document_id = '{}'", escape_literal(document_id));

        let results = table
            .query()
            .only_if(filter)
            .limit(limit)
            .execute()
            .await
            .map_err(|e| RagError::Index(format!("Failed to query document chunks: {}", e)))?;

        let mut chunks: Vec<ChunkRecord> = self
            .collect_scored_chunks(results)
            .await?
            .into_iter()
            .map(|scored| scored.record)
            .collect();
        chunks.sort_by_key(|c| c.sequence_index);

        Ok(chunks)
    }

    /// Whether any stored chunk references the given document name.
    #[inline]
    pub async fn document_exists(&self, document_name: &str) -> Result<bool> {
        let table = self.open_table().await?;
        let filter = format!("document_name = '{}'", escape_literal(document_name));

        let count = table
            .count_rows(Some(filter))
            .await
            .map_err(|e| RagError::Index(format!("Failed to count document chunks: {}", e)))?;

        Ok(count > 0)
    }

    /// Total number of chunk rows in the collection.
    #[inline]
    pub async fn count_chunks(&self) -> Result<u64> {
        let table = self.open_table().await?;
        let count = table
            .count_rows(None)
            .await
            .map_err(|e| RagError::Index(format!("Failed to count rows: {}", e)))?;

        Ok(count as u64)
    }

    async fn collect_scored_chunks(
        &self,
        mut results: lancedb::arrow::SendableRecordBatchStream,
    ) -> Result<Vec<ScoredChunk>> {
        let mut chunks = Vec::new();

        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| RagError::Index(format!("Failed to read result stream: {}", e)))?
        {
            chunks.extend(parse_chunk_batch(&batch)?);
        }

        debug!("Collected {} chunks from result stream", chunks.len());
        Ok(chunks)
    }
}

/// Escape a string for inclusion in a single-quoted SQL literal.
fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| RagError::Index(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| RagError::Index(format!("Invalid {} column type", name)))
}

fn u32_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt32Array> {
    batch
        .column_by_name(name)
        .ok_or_else(|| RagError::Index(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<UInt32Array>()
        .ok_or_else(|| RagError::Index(format!("Invalid {} column type", name)))
}

fn parse_chunk_batch(batch: &RecordBatch) -> Result<Vec<ScoredChunk>> {
    let num_rows = batch.num_rows();

    let document_ids = string_column(batch, "document_id")?;
    let document_names = string_column(batch, "document_name")?;
    let subject_ids = string_column(batch, "subject_id")?;
    let owner_organizations = string_column(batch, "owner_organization")?;
    let created_bys = string_column(batch, "created_by")?;
    let texts = string_column(batch, "text")?;
    let section_titles = string_column(batch, "section_title")?;
    let page_numbers = u32_column(batch, "page_number")?;
    let sequence_indices = u32_column(batch, "sequence_index")?;
    let token_counts = u32_column(batch, "token_count")?;
    let created_ats = string_column(batch, "created_at")?;

    // Present only on vector search results, not plain scans.
    let distances = batch
        .column_by_name("_distance")
        .map(|col| col.as_any().downcast_ref::<Float32Array>());

    let mut chunks = Vec::with_capacity(num_rows);
    for row in 0..num_rows {
        let record = ChunkRecord {
            sequence_index: sequence_indices.value(row),
            document_id: document_ids.value(row).to_string(),
            document_name: document_names.value(row).to_string(),
            text: texts.value(row).to_string(),
            section_title: if section_titles.is_null(row) {
                None
            } else {
                Some(section_titles.value(row).to_string())
            },
            page_number: if page_numbers.is_null(row) {
                None
            } else {
                Some(page_numbers.value(row))
            },
            token_count: token_counts.value(row),
            subject_id: subject_ids.value(row).to_string(),
            owner_organization: owner_organizations.value(row).to_string(),
            created_by: created_bys.value(row).to_string(),
            created_at: created_ats.value(row).to_string(),
        };

        let distance = distances
            .flatten()
            .map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });

        chunks.push(ScoredChunk {
            record,
            score: 1.0 - distance,
        });
    }

    Ok(chunks)
}
