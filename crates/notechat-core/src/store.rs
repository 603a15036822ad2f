//! Chunk store: ordered chunk records aligned with vector index rows
//!
//! Position `i` in the store describes the same chunk as row `i` of the
//! vector index. The position is the only join key; nothing else links a
//! vector back to its text.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use uuid::Uuid;
use xxhash_rust::xxh3::Xxh3;

use crate::error::{RagError, Result};

/// The atomic retrieval unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub source_file: String,
    pub page: String,
    pub content_type: String,
    pub text: String,
}

impl Chunk {
    /// New chunk with a freshly generated identifier
    pub fn new(
        source_file: impl Into<String>,
        page: impl Into<String>,
        content_type: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            chunk_id: Uuid::new_v4().to_string(),
            source_file: source_file.into(),
            page: page.into(),
            content_type: content_type.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    pub fn push(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    pub fn extend(&mut self, chunks: impl IntoIterator<Item = Chunk>) {
        self.chunks.extend(chunks);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk at ordinal `position`
    pub fn get(&self, position: usize) -> Option<&Chunk> {
        self.chunks.get(position)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }

    /// Distinct source files in first-seen order
    pub fn source_files(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.chunks
            .iter()
            .map(|c| c.source_file.as_str())
            .filter(|f| seen.insert(*f))
            .collect()
    }

    /// Order-sensitive digest of the chunk ids.
    ///
    /// Stored in the vector index so a load can prove both artifacts come
    /// from the same generation.
    pub fn digest(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for chunk in &self.chunks {
            hasher.update(chunk.chunk_id.as_bytes());
            hasher.update(b"\n");
        }
        hasher.digest()
    }

    /// Write the store as a JSON array of chunk records
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.chunks)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let chunks: Vec<Chunk> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| RagError::PersistenceCorrupt(format!("Unreadable metadata: {e}")))?;
        Ok(Self { chunks })
    }

    /// Human-readable dump: `[<chunk_id> | page <page>]` followed by the text
    pub fn write_text_dump(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        for chunk in &self.chunks {
            writeln!(writer, "[{} | page {}]", chunk.chunk_id, chunk.page)?;
            writeln!(writer, "{}", chunk.text)?;
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}
