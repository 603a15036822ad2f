//! Flat vector index with exact nearest-neighbor search
//!
//! Stores L2-normalized vectors in one contiguous row-major buffer and ranks
//! by squared Euclidean distance (same order as cosine similarity for unit
//! vectors). Search returns row positions; the chunk store resolves them.
//!
//! Persisted with bincode as a versioned little-endian record, so an index
//! written on one machine loads on any other.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{RagError, Result};

/// "NCVI"
const INDEX_MAGIC: u32 = 0x4E43_5649;

/// Index file version for compatibility checking
const INDEX_FILE_VERSION: u32 = 1;

/// A search hit: row position and its squared distance to the query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    magic: u32,
    version: u32,
    dim: u32,
    count: u64,
    metadata_digest: u64,
    data: Vec<f32>,
}

/// Exact (linear scan) vector index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorIndex {
    dim: usize,
    data: Vec<f32>,
    /// Digest of the chunk store this index was built alongside
    metadata_digest: u64,
}

impl VectorIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index over `vectors`
    pub fn from_vectors(vectors: &[Vec<f32>]) -> Result<Self> {
        let mut index = Self::new();
        index.build(vectors)?;
        Ok(index)
    }

    /// Replace the contents with a flat index over `vectors`.
    ///
    /// All vectors must share one length. An empty set produces an empty index.
    pub fn build(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        let dim = vectors.first().map_or(0, Vec::len);
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(RagError::DimensionMismatch {
                expected: dim,
                actual: bad.len(),
            });
        }
        if !vectors.is_empty() && dim == 0 {
            return Err(RagError::DimensionMismatch {
                expected: 1,
                actual: 0,
            });
        }

        let mut data = Vec::with_capacity(vectors.len() * dim);
        for vector in vectors {
            data.extend_from_slice(vector);
        }

        self.dim = dim;
        self.data = data;
        self.metadata_digest = 0;
        Ok(())
    }

    /// Number of stored vectors
    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimension (0 for an empty index)
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Stored vector at `position`
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        if position >= self.len() {
            return None;
        }
        let start = position * self.dim;
        Some(&self.data[start..start + self.dim])
    }

    /// All stored vectors in position order
    pub fn vectors(&self) -> Vec<Vec<f32>> {
        if self.dim == 0 {
            return Vec::new();
        }
        self.data.chunks(self.dim).map(<[f32]>::to_vec).collect()
    }

    pub fn metadata_digest(&self) -> u64 {
        self.metadata_digest
    }

    pub fn set_metadata_digest(&mut self, digest: u64) {
        self.metadata_digest = digest;
    }

    /// Positions of the `k` nearest vectors, nearest first.
    ///
    /// Returns every vector when fewer than `k` are stored. Ties keep the
    /// lower position first so results are stable across runs.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if self.is_empty() {
            return Err(RagError::IndexEmpty);
        }
        if query.len() != self.dim {
            return Err(RagError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }

        let mut scored: Vec<Neighbor> = self
            .data
            .chunks(self.dim)
            .enumerate()
            .map(|(position, row)| Neighbor {
                position,
                distance: squared_l2(query, row),
            })
            .collect();

        let k = k.min(scored.len());
        if k == 0 {
            return Ok(Vec::new());
        }
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, compare_neighbors);
            scored.truncate(k);
        }
        scored.sort_by(compare_neighbors);

        Ok(scored)
    }

    /// Write the index to `path`, flushed to disk before returning
    pub fn persist(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        tracing::debug!(
            "Persisted vector index to {:?} ({} vectors, dim {})",
            path,
            self.len(),
            self.dim
        );
        Ok(())
    }

    /// Read an index written by [`VectorIndex::persist`]
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::read_from(BufReader::new(file))
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        let state = IndexFile {
            magic: INDEX_MAGIC,
            version: INDEX_FILE_VERSION,
            dim: self.dim as u32,
            count: self.len() as u64,
            metadata_digest: self.metadata_digest,
            data: self.data.clone(),
        };
        bincode::serialize_into(writer, &state)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        let state: IndexFile = bincode::deserialize_from(reader)
            .map_err(|e| RagError::PersistenceCorrupt(format!("Unreadable vector index: {e}")))?;

        if state.magic != INDEX_MAGIC {
            return Err(RagError::PersistenceCorrupt(
                "Not a notechat vector index".into(),
            ));
        }
        if state.version != INDEX_FILE_VERSION {
            return Err(RagError::PersistenceCorrupt(format!(
                "Index file version mismatch: expected {}, got {}",
                INDEX_FILE_VERSION, state.version
            )));
        }

        let dim = state.dim as usize;
        let expected_len = dim as u64 * state.count;
        if state.data.len() as u64 != expected_len || (dim == 0 && state.count != 0) {
            return Err(RagError::PersistenceCorrupt(format!(
                "Index header declares {} vectors of dim {} but holds {} values",
                state.count,
                dim,
                state.data.len()
            )));
        }

        Ok(Self {
            dim,
            data: state.data,
            metadata_digest: state.metadata_digest,
        })
    }
}

/// Total order on neighbors: NaN distances last, ties by position
fn compare_neighbors(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .is_nan()
        .cmp(&b.distance.is_nan())
        .then(a.distance.total_cmp(&b.distance))
        .then(a.position.cmp(&b.position))
}

/// Squared Euclidean distance
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
