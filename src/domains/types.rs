//! Core data types and error definitions for domain operations.

use std::pin::Pin;

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::EmbeddingClientError;
use crate::extraction::ExtractionError;
use crate::generation::GenerationError;
use crate::index::RetrievedNode;

/// Errors emitted by domain lifecycle, ingestion, and query operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Domain slug failed validation.
    #[error(
        "Invalid domain name '{0}': use 1-64 lowercase letters, digits, or hyphens, starting and ending with a letter or digit"
    )]
    InvalidName(String),
    /// A domain with this name already exists.
    #[error("Domain '{0}' already exists")]
    AlreadyExists(String),
    /// Referenced domain does not exist.
    #[error("Domain '{0}' not found")]
    NotFound(String),
    /// No chunk of the named document is indexed in the domain.
    #[error("Document '{filename}' not found in domain '{domain}'")]
    DocumentNotFound {
        /// Domain that was searched.
        domain: String,
        /// Requested filename.
        filename: String,
    },
    /// A multi-domain query named no domains.
    #[error("At least one domain is required")]
    EmptyDomainList,
    /// Upload filename is unsafe to store.
    #[error("Invalid filename '{0}'")]
    InvalidFilename(String),
    /// Text or OCR extraction failed for one document.
    #[error("Extraction failed for '{filename}': {source}")]
    Extraction {
        /// Document that failed.
        filename: String,
        /// Underlying extraction error.
        #[source]
        source: ExtractionError,
    },
    /// Retrieval against one domain failed.
    #[error("Retrieval from domain '{domain}' failed: {source}")]
    Retrieval {
        /// Domain that failed.
        domain: String,
        /// Underlying embedding error.
        #[source]
        source: EmbeddingClientError,
    },
    /// The answer-generation capability failed.
    #[error("Answer generation failed: {0}")]
    Generation(#[from] GenerationError),
    /// The embedding capability failed during ingestion.
    #[error("Failed to generate embeddings: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// Reading or writing persisted state failed.
    #[error("Storage error while {context}: {source}")]
    Storage {
        /// What was being done.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Persisted metadata or index could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A blocking worker task failed to complete.
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl DomainError {
    /// Adapter for `map_err` that wraps an I/O error with what was being attempted.
    pub fn storage(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Storage { context, source }
    }
}

/// Persisted metadata of a domain (`meta.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    /// Domain slug.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Creation time, RFC 3339 UTC.
    pub created_at: String,
    /// Number of indexed page-level chunks (not files).
    pub doc_count: usize,
}

/// A document as listed for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    /// Identifier of the document; equal to its filename.
    pub doc_id: String,
    /// Source filename.
    pub filename: String,
    /// Number of indexed chunks for the file.
    pub num_chunks: usize,
}

/// Uploaded document bytes awaiting ingestion.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Filename, unique within the domain.
    pub filename: String,
    /// Raw file contents.
    pub bytes: Vec<u8>,
}

/// Ingestion detail for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentReport {
    /// Source filename.
    pub filename: String,
    /// Pages seen by the text-layer pass.
    pub total_pages: usize,
    /// Chunks written to the index for this document.
    pub chunks_written: usize,
    /// Written chunks whose page was not indexed before.
    pub chunks_inserted: usize,
    /// Written chunks that replaced a page with different text.
    pub chunks_updated: usize,
    /// Chunks whose vectors were recomputed (new or changed text).
    pub chunks_embedded: usize,
    /// Whether the OCR pass replaced text-layer extraction.
    pub ocr_used: bool,
    /// Extraction error that made the document contribute nothing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_error: Option<String>,
}

/// Summary of an ingestion call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Chunks written across every input document.
    pub chunks_written: usize,
    /// Per-document detail, in input order.
    pub documents: Vec<DocumentReport>,
}

/// Source attribution attached to answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceChunk {
    /// Composite chunk identity.
    pub doc_id: String,
    /// Filename, prefixed with `domain/` on multi-domain answers.
    pub filename: String,
    /// One-based page label.
    pub page_label: Option<String>,
    /// Relevance score rounded to four decimals.
    pub score: Option<f32>,
    /// Chunk text.
    pub text: String,
}

impl From<&RetrievedNode> for SourceChunk {
    fn from(node: &RetrievedNode) -> Self {
        Self {
            doc_id: node.chunk.id.key(),
            filename: node.display_filename(),
            page_label: Some(node.chunk.page_label.clone()),
            score: Some((node.score * 10_000.0).round() / 10_000.0),
            text: node.chunk.text.clone(),
        }
    }
}

/// Answer to a single-domain question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryAnswer {
    /// Synthesized answer text.
    pub answer: String,
    /// Retrieved sources, in ranking order.
    pub sources: Vec<SourceChunk>,
    /// Queried domain.
    pub domain: String,
    /// Original question.
    pub question: String,
}

/// Answer to a multi-domain question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiQueryAnswer {
    /// Synthesized answer text.
    pub answer: String,
    /// Retrieved sources in merge order, filenames prefixed with their domain.
    pub sources: Vec<SourceChunk>,
    /// Queried domains, in request order.
    pub domains: Vec<String>,
    /// Original question.
    pub question: String,
}

/// Event emitted by a streaming query.
///
/// Order: any number of `Token`, one `Sources`, at most one `Error`, then `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    /// Text increment of the answer.
    Token(String),
    /// Ranked, attributed sources behind the answer.
    Sources(Vec<SourceChunk>),
    /// Generation failed; no further tokens follow.
    Error(String),
    /// Terminal marker; always last.
    Done,
}

/// Stream of query events.
pub type QueryEventStream = Pin<Box<dyn Stream<Item = QueryEvent> + Send>>;
