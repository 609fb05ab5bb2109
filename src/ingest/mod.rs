
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::chunker::Chunker;
use crate::{RagError, Result};
use crate::embeddings::Embedder;
use crate::index::{ChunkRecord, VectorIndex};
use crate::ocr::DocumentParser;

/// A raw document handed to the ingestion pipeline, with the ownership
/// metadata that gets stamped onto every stored chunk.
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    /// Caller-assigned document identifier; re-uploading under the same id
    /// replaces the previous version
    pub doc_id: String,
    pub document_name: String,
    pub content: Vec<u8>,
    pub subject_id: String,
    pub owner_organization: String,
    pub created_by: String,
}

/// Outcome of a successful ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks_indexed: usize,
    pub tokens_embedded: u64,
}

/// Runs the full pipeline for one document: parse, chunk, embed, index.
///
/// All-or-nothing: a failure at any stage leaves the store untouched for
/// that document.
pub struct Ingestor {
    parser: Arc<dyn DocumentParser>,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
}

impl Ingestor {
    #[inline]
    pub fn new(
        parser: Arc<dyn DocumentParser>,
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
    ) -> Self {
        Self {
            parser,
            chunker,
            embedder,
            index,
        }
    }

    /// Ingest one document end to end.
    #[inline]
    pub async fn ingest(&self, upload: &DocumentUpload) -> Result<IngestReport> {
        info!(
            "Ingesting document {} ({}) for subject {}",
            upload.doc_id, upload.document_name, upload.subject_id
        );

        // The OCR client blocks; keep it off the async workers.
        let parser = Arc::clone(&self.parser);
        let document_name = upload.document_name.clone();
        let content = upload.content.clone();
        let mut doc = tokio::task::spawn_blocking(move || parser.parse(&document_name, &content))
            .await
            .map_err(|e| RagError::Parsing(format!("Parsing task failed: {}", e)))??;
        doc.id = upload.doc_id.clone();

        let chunks = self.chunker.chunk_document(&doc)?;
        if chunks.is_empty() {
            info!("Document {} produced no chunks", upload.doc_id);
            return Ok(IngestReport {
                document_id: upload.doc_id.clone(),
                chunks_indexed: 0,
                tokens_embedded: 0,
            });
        }

        let created_at = Utc::now().to_rfc3339();
        let records: Vec<ChunkRecord> = chunks
            .iter()
            .map(|chunk| ChunkRecord {
                sequence_index: chunk.sequence_index,
                document_id: upload.doc_id.clone(),
                document_name: chunk.document_name.clone(),
                text: chunk.text.clone(),
                section_title: chunk.section_title.clone(),
                page_number: chunk.page_number,
                token_count: chunk.token_count,
                subject_id: upload.subject_id.clone(),
                owner_organization: upload.owner_organization.clone(),
                created_by: upload.created_by.clone(),
                created_at: created_at.clone(),
            })
            .collect();

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedder = Arc::clone(&self.embedder);
        let embeddings = tokio::task::spawn_blocking(move || embedder.embed_many(&texts))
            .await
            .map_err(|e| RagError::Embedding(format!("Embedding task failed: {}", e)))??;

        self.index.index_document(&doc, &records, &embeddings).await?;

        let tokens_embedded = chunks.iter().map(|c| u64::from(c.token_count)).sum();
        let report = IngestReport {
            document_id: upload.doc_id.clone(),
            chunks_indexed: records.len(),
            tokens_embedded,
        };

        info!(
            "Ingested document {}: {} chunks, {} tokens",
            report.document_id, report.chunks_indexed, report.tokens_embedded
        );

        Ok(report)
    }

    /// Run ingestion as a detached background task.
    ///
    /// Errors are logged, never propagated; callers that need the outcome
    /// should use [`Ingestor::ingest`] and await it.
    #[inline]
    pub fn spawn(self: Arc<Self>, upload: DocumentUpload) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let doc_id = upload.doc_id.clone();
            match self.ingest(&upload).await {
                Ok(report) => {
                    info!(
                        "Background ingestion finished for {}: {} chunks",
                        report.document_id, report.chunks_indexed
                    );
                }
                Err(e) => {
                    error!("Background ingestion failed for {}: {}", doc_id, e);
                }
            }
        })
    }
}
