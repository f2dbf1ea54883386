//! Per-domain retrieval indices: storage format, similarity ranking, and the resident cache.

pub mod cache;
pub mod search;
pub mod store;

pub use cache::{DomainLock, IndexCache, IndexReadGuard, IndexWriteGuard};
pub use search::{CosineSearch, RetrievedNode, SimilaritySearch};
pub use store::{Chunk, ChunkId, DomainIndex, UpsertOutcome};
