//! Similarity ranking over a [`DomainIndex`].

use std::cmp::Ordering;

use super::store::{Chunk, DomainIndex};

/// A chunk paired with its relevance to one query.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedNode {
    /// The matched chunk.
    pub chunk: Chunk,
    /// Non-negative relevance score, comparable only within one retrieval call.
    pub score: f32,
    /// Domain that produced the node, set only on the multi-domain path.
    pub source_domain: Option<String>,
}

impl RetrievedNode {
    /// Attach the attribution tag used when merging results across domains.
    ///
    /// Only the in-memory result is tagged; the indexed chunk is untouched.
    pub fn tagged(mut self, domain: &str) -> Self {
        self.source_domain = Some(domain.to_string());
        self
    }

    /// Filename as shown to callers, prefixed with the source domain when tagged.
    pub fn display_filename(&self) -> String {
        match &self.source_domain {
            Some(domain) => format!("{domain}/{}", self.chunk.filename()),
            None => self.chunk.filename().to_string(),
        }
    }
}

/// Capability ranking a domain's chunks against a query vector.
pub trait SimilaritySearch: Send + Sync {
    /// Return at most `k` nodes ordered by descending score.
    fn search(&self, index: &DomainIndex, query: &[f32], k: usize) -> Vec<RetrievedNode>;
}

/// Exhaustive cosine-similarity ranking.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineSearch;

impl SimilaritySearch for CosineSearch {
    fn search(&self, index: &DomainIndex, query: &[f32], k: usize) -> Vec<RetrievedNode> {
        if k == 0 || index.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(f32, &Chunk)> = index
            .entries()
            .map(|(chunk, embedding)| (cosine_similarity(query, embedding).max(0.0), chunk))
            .collect();

        // Ties fall back to identity order so rankings are reproducible.
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(score, chunk)| RetrievedNode {
                chunk: chunk.clone(),
                score,
                source_domain: None,
            })
            .collect()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
