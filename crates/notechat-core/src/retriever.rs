//! Question -> ranked context chunks
//!
//! Queries are embedded as typed, without the normalization applied to
//! corpus text. Each search hit is joined to the chunk store by position.

use std::collections::HashSet;
use std::sync::Arc;

use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::storage::Storage;
use crate::store::Chunk;

/// A retrieved chunk with its index position and distance to the query
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub position: usize,
    pub distance: f32,
    pub chunk: Chunk,
}

pub struct Retriever {
    embedder: Box<dyn Embedder>,
    storage: Arc<dyn Storage>,
    top_k: usize,
}

impl Retriever {
    pub fn new(embedder: Box<dyn Embedder>, storage: Arc<dyn Storage>, top_k: usize) -> Self {
        Self {
            embedder,
            storage,
            top_k,
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Up to `k` chunks for `question`, nearest first
    pub fn retrieve(&mut self, question: &str, k: usize) -> Result<Vec<Chunk>> {
        Ok(self
            .search(question, k)?
            .into_iter()
            .map(|hit| hit.chunk)
            .collect())
    }

    /// [`Retriever::retrieve`] with the configured `top_k`
    pub fn retrieve_default(&mut self, question: &str) -> Result<Vec<Chunk>> {
        self.retrieve(question, self.top_k)
    }

    /// Ranked hits with positions and distances.
    ///
    /// Chunks with identical text are reported once, at their best rank.
    /// Fails with `NoIndexAvailable` when no generation has been persisted or
    /// the persisted one is empty.
    pub fn search(&mut self, question: &str, k: usize) -> Result<Vec<RetrievedChunk>> {
        let generation = self
            .storage
            .load()?
            .filter(|g| !g.is_empty())
            .ok_or(RagError::NoIndexAvailable)?;
        let (index, store) = (generation.index(), generation.store());

        if self.embedder.dimension() != index.dim() {
            return Err(RagError::DimensionMismatch {
                expected: index.dim(),
                actual: self.embedder.dimension(),
            });
        }

        let query = self.embedder.embed_query(question)?;

        // Duplicates can push distinct chunks out of the first k hits, so
        // widen the search until k distinct chunks are found or the index
        // is exhausted
        let mut fetch = k;
        loop {
            let neighbors = index.search(&query, fetch).map_err(|e| match e {
                RagError::IndexEmpty => RagError::NoIndexAvailable,
                other => other,
            })?;

            let mut seen = HashSet::new();
            let mut hits = Vec::with_capacity(k);
            for neighbor in &neighbors {
                let chunk = store.get(neighbor.position).ok_or_else(|| {
                    RagError::PersistenceCorrupt(format!(
                        "Index position {} has no chunk record",
                        neighbor.position
                    ))
                })?;
                if !seen.insert(chunk.text.as_str()) {
                    continue;
                }
                hits.push(RetrievedChunk {
                    position: neighbor.position,
                    distance: neighbor.distance,
                    chunk: chunk.clone(),
                });
                if hits.len() == k {
                    break;
                }
            }

            if hits.len() == k || fetch >= index.len() {
                tracing::debug!(
                    "Retrieved {} chunks for query ({} candidates)",
                    hits.len(),
                    neighbors.len()
                );
                return Ok(hits);
            }
            fetch = (fetch * 2).min(index.len());
        }
    }
}
