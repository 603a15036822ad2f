//! Fixed-size sliding-window chunking
//!
//! Normalized document text is cut into windows of `size` characters whose
//! starts advance by `size - overlap`. Offsets are character offsets, so the
//! windows are well-defined for any UTF-8 input, not only normalized ASCII.

use crate::error::{RagError, Result};

/// One window of a chunked document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextWindow {
    /// Zero-based position of this window in the sequence
    pub index: usize,
    /// Character offset of the first character
    pub start: usize,
    /// Character offset one past the last character
    pub end: usize,
    pub text: String,
}

/// Window parameters, validated so that the stride is always positive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    size: usize,
    overlap: usize,
}

impl ChunkParams {
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(RagError::InvalidConfig("chunk size must be positive".into()));
        }
        if overlap >= size {
            return Err(RagError::InvalidConfig(format!(
                "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn stride(&self) -> usize {
        self.size - self.overlap
    }
}

/// Start offsets for a text of `len` characters: `0, stride, 2*stride, ...`
/// while the offset is below `len`.
pub fn window_starts(len: usize, params: ChunkParams) -> impl Iterator<Item = usize> {
    (0..len).step_by(params.stride())
}

/// Split `text` into overlapping windows.
///
/// Empty input yields no windows; input shorter than the window size yields
/// exactly one window holding the whole input.
pub fn chunk_text(text: &str, params: ChunkParams) -> Vec<TextWindow> {
    // Byte offset of every char boundary, plus the end of the string
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = boundaries.len() - 1;

    window_starts(char_len, params)
        .enumerate()
        .map(|(index, start)| {
            let end = (start + params.size()).min(char_len);
            TextWindow {
                index,
                start,
                end,
                text: text[boundaries[start]..boundaries[end]].to_string(),
            }
        })
        .collect()
}
