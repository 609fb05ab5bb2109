
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tiktoken_rs::{CoreBPE, cl100k_base};
use tracing::{debug, info};

use crate::document::ParsedDocument;
use crate::{RagError, Result};

/// Separators tried from coarsest to finest when splitting a section.
/// The empty separator splits into individual characters as a last resort.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Configuration for document chunking, in tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum tokens per chunk
    pub chunk_size: usize,
    /// Tokens of trailing context carried over into the next chunk
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

/// A text chunk cut from a parsed document, ready for embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of this chunk within the document, 0-based with no gaps
    pub sequence_index: u32,
    pub document_id: String,
    pub document_name: String,
    /// The chunk text; never empty
    pub text: String,
    /// Title of the enclosing section, if the chunk falls under a header
    pub section_title: Option<String>,
    /// 1-based page where the chunk starts, if page boundaries are known
    pub page_number: Option<u32>,
    /// Encoded length of `text` under the chunker's tokenizer
    pub token_count: u32,
}

/// Splits parsed documents into token-bounded chunks that respect section
/// and page boundaries.
///
/// Sections are chunked independently so no chunk straddles a header, unless
/// a single unsplittable run of text exceeds the budget on its own.
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    tokenizer: CoreBPE,
}

impl Chunker {
    /// Create a chunker with the given token budget and overlap.
    #[inline]
    pub fn new(config: &ChunkingConfig) -> Result<Self> {
        let tokenizer = cl100k_base()
            .map_err(|e| RagError::Chunking(format!("Failed to load tokenizer: {}", e)))?;

        debug!(
            "Initialized chunker: chunk_size={}, overlap={}",
            config.chunk_size, config.chunk_overlap
        );

        Ok(Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            tokenizer,
        })
    }

    /// Encoded token length of a text under the chunker's tokenizer.
    #[inline]
    pub fn token_count(&self, text: &str) -> usize {
        self.tokenizer.encode_ordinary(text).len()
    }

    /// Split a parsed document into ordered chunks.
    ///
    /// All-or-nothing: any internal failure discards the whole document.
    /// An empty document yields an empty chunk list.
    #[inline]
    pub fn chunk_document(&self, doc: &ParsedDocument) -> Result<Vec<Chunk>> {
        info!("Chunking document: {}", doc.document_name);

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut cursor = 0usize;
        let mut previous_text: Option<String> = None;

        for span in doc.section_spans() {
            for piece in self.split_text(span.text) {
                // The splitter does not expose absolute offsets, so the start
                // of each piece is re-derived from the textual overlap with
                // its predecessor.
                let overlap = previous_text
                    .as_deref()
                    .map_or(0, |prev| overlap_length(prev, &piece));
                let start = cursor.saturating_sub(overlap);
                let page_number = doc.page_at_offset(start);

                let token_count = self.token_count(&piece) as u32;
                chunks.push(Chunk {
                    sequence_index: chunks.len() as u32,
                    document_id: doc.id.clone(),
                    document_name: doc.document_name.clone(),
                    text: piece.clone(),
                    section_title: span.title.map(str::to_string),
                    page_number,
                    token_count,
                });

                cursor = start + piece.len();
                previous_text = Some(piece);
            }
        }

        let total_tokens: u32 = chunks.iter().map(|c| c.token_count).sum();
        debug!(
            "Created {} chunks from {} ({} tokens total)",
            chunks.len(),
            doc.document_name,
            total_tokens
        );

        Ok(chunks)
    }

    /// Split raw text into pieces at most `chunk_size` tokens long, with up
    /// to `chunk_overlap` tokens shared between consecutive pieces.
    pub(crate) fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &SEPARATORS)
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        // Pick the coarsest separator that actually occurs in the text.
        let mut separator = *separators.last().unwrap_or(&"");
        let mut remaining: &[&str] = &[];
        for (i, candidate) in separators.iter().enumerate() {
            if candidate.is_empty() || text.contains(candidate) {
                separator = candidate;
                remaining = &separators[i + 1..];
                break;
            }
        }

        let splits: Vec<String> = if separator.is_empty() {
            text.chars().map(String::from).collect()
        } else {
            text.split(separator).map(str::to_string).collect()
        };

        let mut pieces = Vec::new();
        let mut mergeable: Vec<String> = Vec::new();

        for split in splits {
            if self.token_count(&split) < self.chunk_size {
                mergeable.push(split);
                continue;
            }

            if !mergeable.is_empty() {
                pieces.extend(self.merge_splits(&mergeable, separator));
                mergeable.clear();
            }

            if remaining.is_empty() {
                // A single unsplittable unit larger than the budget is
                // emitted whole rather than dropped.
                pieces.push(split);
            } else {
                pieces.extend(self.split_recursive(&split, remaining));
            }
        }

        if !mergeable.is_empty() {
            pieces.extend(self.merge_splits(&mergeable, separator));
        }

        pieces
    }

    /// Re-merge adjacent splits up to the token budget, carrying up to
    /// `chunk_overlap` tokens of trailing context into the next piece.
    fn merge_splits(&self, splits: &[String], separator: &str) -> Vec<String> {
        let separator_len = self.token_count(separator);

        let mut pieces = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for split in splits {
            let len = self.token_count(split);
            let join_cost = if current.is_empty() { 0 } else { separator_len };

            if total + len + join_cost > self.chunk_size && !current.is_empty() {
                if let Some(piece) = join_splits(current.iter().copied(), separator) {
                    pieces.push(piece);
                }

                // Shrink the window until it fits inside the overlap budget
                // and leaves room for the incoming split.
                loop {
                    let join_cost = if current.is_empty() { 0 } else { separator_len };
                    let keep_popping = total > self.chunk_overlap
                        || (total + len + join_cost > self.chunk_size && total > 0);
                    if !keep_popping {
                        break;
                    }
                    let Some(front) = current.pop_front() else {
                        break;
                    };
                    let front_sep = if current.is_empty() { 0 } else { separator_len };
                    total = total.saturating_sub(self.token_count(front) + front_sep);
                }
            }

            current.push_back(split.as_str());
            total += len + if current.len() > 1 { separator_len } else { 0 };
        }

        if let Some(piece) = join_splits(current.iter().copied(), separator) {
            pieces.push(piece);
        }

        pieces
    }
}

fn join_splits<'a>(parts: impl Iterator<Item = &'a str>, separator: &str) -> Option<String> {
    let joined = parts.collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Length in bytes of the longest suffix of `previous` that is also a prefix
/// of `current`, checking candidates longest-first.
pub(crate) fn overlap_length(previous: &str, current: &str) -> usize {
    if previous.is_empty() || current.is_empty() {
        return 0;
    }

    let max_possible = previous.len().min(current.len());
    for size in (1..=max_possible).rev() {
        if !previous.is_char_boundary(previous.len() - size) || !current.is_char_boundary(size) {
            continue;
        }
        if previous.as_bytes()[previous.len() - size..] == current.as_bytes()[..size] {
            return size;
        }
    }

    0
}
