
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::embeddings::Embedder;
use crate::{RagError, Result};
use crate::generation::{ChatMessage, CompletionModel};
use crate::index::{ScoredChunk, VectorIndex};

/// Number of chunks retrieved per question.
pub const RETRIEVAL_LIMIT: usize = 10;

/// Canned answer returned when no chunk matches the question's scope.
pub const NO_CONTEXT_ANSWER: &str = "I couldn't find relevant information in the documents.";

const SYSTEM_PROMPT: &str = "You are a medical assistant answering questions about a patient's \
clinical documents. Answer using ONLY the information in the provided context. If the context \
does not contain the answer, say so plainly instead of guessing.";

/// A question scoped to one subject's documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    /// Patient whose documents may be consulted
    pub subject_id: String,
    /// Optional narrowing to a single document
    #[serde(default)]
    pub document_id: Option<String>,
    /// Prior conversation turns, oldest first
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

/// A generated answer together with the chunks it was grounded on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagAnswer {
    pub answer: String,
    /// Retrieved chunks in descending similarity order; empty when nothing
    /// matched and the canned answer was returned
    pub sources: Vec<ChunkSource>,
}

/// Provenance of one retrieved chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSource {
    /// Opaque identifier of the chunk within its document
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub text: String,
    pub similarity_score: f32,
    pub page_number: Option<u32>,
    pub section_title: Option<String>,
}

/// Orchestrates embed -> search -> generate for a single question.
pub struct RetrievalEngine {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn CompletionModel>,
}

impl RetrievalEngine {
    #[inline]
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn CompletionModel>,
    ) -> Self {
        Self {
            index,
            embedder,
            model,
        }
    }

    /// Answer a question against the subject's indexed documents.
    ///
    /// When retrieval returns nothing, the generation collaborator is never
    /// called and [`NO_CONTEXT_ANSWER`] comes back with no sources.
    #[inline]
    pub async fn answer(&self, request: &QueryRequest) -> Result<RagAnswer> {
        info!("Answering question for subject: {}", request.subject_id);

        // The embedding client blocks; keep it off the async workers.
        let embedder = Arc::clone(&self.embedder);
        let question = request.question.clone();
        let query_vector = tokio::task::spawn_blocking(move || embedder.embed(&question))
            .await
            .map_err(|e| RagError::Embedding(format!("Embedding task failed: {}", e)))??;
        let chunks = self
            .index
            .search(
                &query_vector,
                &request.subject_id,
                RETRIEVAL_LIMIT,
                request.document_id.as_deref(),
            )
            .await?;

        if chunks.is_empty() {
            debug!(
                "No chunks matched for subject {}, skipping generation",
                request.subject_id
            );
            return Ok(RagAnswer {
                answer: NO_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
            });
        }

        debug!("Retrieved {} chunks for generation", chunks.len());

        let context = build_context(&chunks);
        let messages = build_messages(&context, request);
        let model = Arc::clone(&self.model);
        let answer = tokio::task::spawn_blocking(move || model.complete(&messages))
            .await
            .map_err(|e| RagError::Generation(format!("Generation task failed: {}", e)))??;

        let sources = chunks
            .into_iter()
            .map(|scored| ChunkSource {
                chunk_id: scored.record.sequence_index.to_string(),
                document_id: scored.record.document_id,
                document_name: scored.record.document_name,
                text: scored.record.text,
                similarity_score: scored.score,
                page_number: scored.record.page_number,
                section_title: scored.record.section_title,
            })
            .collect();

        Ok(RagAnswer {
            answer,
            sources,
        })
    }
}

/// Render retrieved chunks into the context block handed to the model.
pub(crate) fn build_context(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .map(|scored| {
            let mut part = format!(
                "[Document: {}]\n{}",
                scored.record.document_id, scored.record.text
            );

            let mut provenance = Vec::new();
            if let Some(page) = scored.record.page_number {
                provenance.push(format!("Page {}", page));
            }
            if let Some(title) = &scored.record.section_title {
                provenance.push(format!("Section: {}", title));
            }
            if !provenance.is_empty() {
                part.push_str(&format!("\n({})", provenance.join(", ")));
            }

            part
        })
        .join("\n---\n")
}

/// Assemble the full message list: system prompt, context, prior turns,
/// then the question.
pub(crate) fn build_messages(context: &str, request: &QueryRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(request.history.len() + 3);
    messages.push(ChatMessage::system(SYSTEM_PROMPT));
    messages.push(ChatMessage::user(format!(
        "Context from the patient's documents:\n\n{}",
        context
    )));
    messages.extend(request.history.iter().cloned());
    messages.push(ChatMessage::user(request.question.clone()));
    messages
}
