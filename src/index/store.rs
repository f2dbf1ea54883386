//! In-memory retrieval index for one domain and its persisted form.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::write_atomic;

const INDEX_FILE: &str = "chunks.json";
const INDEX_VERSION: u32 = 1;

/// Stable identity of a page-level chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    /// Owning domain.
    pub domain: String,
    /// Source filename, unique within the domain.
    pub filename: String,
    /// Zero-based page position.
    pub page_index: usize,
}

impl ChunkId {
    /// Build the identity for a page of `filename` in `domain`.
    pub fn new(domain: impl Into<String>, filename: impl Into<String>, page_index: usize) -> Self {
        Self {
            domain: domain.into(),
            filename: filename.into(),
            page_index,
        }
    }

    /// Composite key used for upserts and persisted ordering.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::p{}", self.domain, self.filename, self.page_index)
    }
}

/// One page of extracted text, the atomic unit of indexing and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identity.
    pub id: ChunkId,
    /// Extracted page text.
    pub text: String,
    /// One-based page label shown to users.
    pub page_label: String,
}

impl Chunk {
    /// Build the chunk for page `page_index` of `filename`.
    pub fn new(domain: &str, filename: &str, page_index: usize, text: String) -> Self {
        Self {
            id: ChunkId::new(domain, filename, page_index),
            text,
            page_label: (page_index + 1).to_string(),
        }
    }

    /// Source filename.
    pub fn filename(&self) -> &str {
        &self.id.filename
    }

    /// Owning domain.
    pub fn domain(&self) -> &str {
        &self.id.domain
    }

    /// SHA-256 of the chunk text, hex encoded.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedChunk {
    chunk: Chunk,
    content_hash: String,
    embedding: Vec<f32>,
}

/// How an upsert changed the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No chunk with this identity existed.
    Inserted,
    /// A chunk with this identity existed and its content changed.
    Updated,
    /// A chunk with this identity and identical content existed.
    Unchanged,
}

/// Retrieval structure over a domain's chunks.
#[derive(Debug, Clone)]
pub struct DomainIndex {
    embedding_model: String,
    chunks: BTreeMap<String, IndexedChunk>,
}

#[derive(Serialize)]
struct PersistedIndexRef<'a> {
    version: u32,
    embedding_model: &'a str,
    chunks: Vec<&'a IndexedChunk>,
}

#[derive(Deserialize)]
struct PersistedIndex {
    version: u32,
    embedding_model: String,
    chunks: Vec<IndexedChunk>,
}

impl DomainIndex {
    /// Empty index whose vectors come from `embedding_model`.
    pub fn new(embedding_model: impl Into<String>) -> Self {
        Self {
            embedding_model: embedding_model.into(),
            chunks: BTreeMap::new(),
        }
    }

    /// Model that produced the stored vectors.
    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the index holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Identities of every indexed chunk, in key order.
    pub fn chunk_ids(&self) -> impl Iterator<Item = &ChunkId> {
        self.chunks.values().map(|entry| &entry.chunk.id)
    }

    /// Chunks paired with their vectors.
    pub fn entries(&self) -> impl Iterator<Item = (&Chunk, &[f32])> {
        self.chunks
            .values()
            .map(|entry| (&entry.chunk, entry.embedding.as_slice()))
    }

    /// Stored vector for `id` when its content hash still matches `content_hash`.
    pub fn reusable_embedding(&self, id: &ChunkId, content_hash: &str) -> Option<&[f32]> {
        self.chunks
            .get(&id.key())
            .filter(|entry| entry.content_hash == content_hash)
            .map(|entry| entry.embedding.as_slice())
    }

    /// Insert or replace the chunk with the same identity.
    pub fn upsert(&mut self, chunk: Chunk, embedding: Vec<f32>) -> UpsertOutcome {
        let content_hash = chunk.content_hash();
        let key = chunk.id.key();
        let outcome = match self.chunks.get(&key) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.content_hash == content_hash => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };
        self.chunks.insert(
            key,
            IndexedChunk {
                chunk,
                content_hash,
                embedding,
            },
        );
        outcome
    }

    /// Remove every chunk whose filename matches exactly, returning how many were removed.
    pub fn remove_file(&mut self, filename: &str) -> usize {
        let before = self.chunks.len();
        self.chunks
            .retain(|_, entry| entry.chunk.filename() != filename);
        before - self.chunks.len()
    }

    /// Per-filename chunk counts, ordered by filename.
    pub fn documents(&self) -> BTreeMap<String, usize> {
        let mut documents = BTreeMap::new();
        for entry in self.chunks.values() {
            *documents
                .entry(entry.chunk.filename().to_string())
                .or_insert(0) += 1;
        }
        documents
    }

    /// Serialize the index for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&PersistedIndexRef {
            version: INDEX_VERSION,
            embedding_model: &self.embedding_model,
            chunks: self.chunks.values().collect(),
        })
    }

    /// Rebuild an index from its persisted bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let persisted: PersistedIndex = serde_json::from_slice(bytes)?;
        if persisted.version != INDEX_VERSION {
            tracing::warn!(
                version = persisted.version,
                expected = INDEX_VERSION,
                "Loading index written by a different format version"
            );
        }
        let chunks = persisted
            .chunks
            .into_iter()
            .map(|entry| (entry.chunk.id.key(), entry))
            .collect();
        Ok(Self {
            embedding_model: persisted.embedding_model,
            chunks,
        })
    }

    /// Path of the serialized index inside `index_dir`.
    pub fn file_path(index_dir: &Path) -> std::path::PathBuf {
        index_dir.join(INDEX_FILE)
    }

    /// Write already-serialized index bytes into `index_dir`.
    pub fn persist_bytes(index_dir: &Path, bytes: &[u8]) -> std::io::Result<()> {
        write_atomic(&Self::file_path(index_dir), bytes)
    }

    /// Whether a persisted index exists in `index_dir`.
    pub fn is_persisted(index_dir: &Path) -> bool {
        Self::file_path(index_dir).is_file()
    }
}
