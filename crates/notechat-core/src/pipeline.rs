//! Ingestion pipeline
//!
//! Drives one document through
//! `Idle -> Extracting -> Normalizing -> Chunking -> Embedding -> Indexing -> Persisted`.
//! A document that yields no text stops at [`IngestState::Empty`], a
//! successful no-op that leaves the current generation untouched. Any error
//! ends in [`IngestState::Failed`].
//!
//! Chunks are embedded, indexed and stored in one order, so index row `i`
//! and chunk store entry `i` always describe the same chunk.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chunker::{chunk_text, ChunkParams};
use crate::config::{IngestMode, RagConfig};
use crate::document::{extract_items, parser_for_path, DocNode};
use crate::embedder::{embed_all, Embedder};
use crate::error::{RagError, Result};
use crate::index::VectorIndex;
use crate::normalize::normalize_text;
use crate::storage::{Generation, Storage};
use crate::store::{Chunk, ChunkStore};

/// Pipeline state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IngestState {
    #[default]
    Idle,
    Extracting,
    Normalizing,
    Chunking,
    Embedding,
    Indexing,
    Persisted,
    /// No text extracted; nothing was written
    Empty,
    Failed(String),
}

impl IngestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Persisted | Self::Empty | Self::Failed(_))
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Extracting => write!(f, "extracting"),
            Self::Normalizing => write!(f, "normalizing"),
            Self::Chunking => write!(f, "chunking"),
            Self::Embedding => write!(f, "embedding"),
            Self::Indexing => write!(f, "indexing"),
            Self::Persisted => write!(f, "persisted"),
            Self::Empty => write!(f, "empty"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new generation was committed
    Persisted,
    /// The document produced no text; zero items processed
    Empty,
}

/// Wall time spent in each stage
#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimings {
    pub extract: Duration,
    pub normalize: Duration,
    pub chunk: Duration,
    pub embed: Duration,
    pub index: Duration,
}

impl StageTimings {
    pub fn total(&self) -> Duration {
        self.extract + self.normalize + self.chunk + self.embed + self.index
    }
}

/// Result of one ingestion run
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub outcome: IngestOutcome,
    pub source_file: String,
    /// Chunks produced from this document
    pub chunks: usize,
    /// Chunks in the committed generation (equals `chunks` in replace mode)
    pub generation_size: usize,
    pub mode: IngestMode,
    pub timings: StageTimings,
}

impl IngestReport {
    fn empty(source_file: &str, mode: IngestMode, timings: StageTimings) -> Self {
        Self {
            outcome: IngestOutcome::Empty,
            source_file: source_file.to_string(),
            chunks: 0,
            generation_size: 0,
            mode,
            timings,
        }
    }
}

/// Turns documents into persisted index generations
pub struct Ingestor {
    params: ChunkParams,
    mode: IngestMode,
    batch_size: usize,
    embedder: Box<dyn Embedder>,
    storage: Arc<dyn Storage>,
    state: IngestState,
}

impl Ingestor {
    pub fn new(
        config: &RagConfig,
        embedder: Box<dyn Embedder>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            params: ChunkParams::new(config.chunk_size, config.chunk_overlap)?,
            mode: config.ingest_mode,
            batch_size: config.embed_batch_size,
            embedder,
            storage,
            state: IngestState::Idle,
        })
    }

    /// Override the configured ingest mode
    pub fn with_mode(mut self, mode: IngestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn set_mode(&mut self, mode: IngestMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> IngestMode {
        self.mode
    }

    /// State reached by the most recent run
    pub fn state(&self) -> &IngestState {
        &self.state
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Parse and ingest a file.
    ///
    /// A file the parser cannot read counts as an empty extraction.
    pub fn ingest_file(&mut self, path: &Path) -> Result<IngestReport> {
        let parser = match parser_for_path(path) {
            Ok(parser) => parser,
            Err(e) => {
                self.transition(IngestState::Failed(e.to_string()));
                return Err(e);
            }
        };
        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        self.transition(IngestState::Extracting);
        let started = Instant::now();
        let root = match parser.parse(path) {
            Ok(root) => root,
            Err(e) => {
                tracing::warn!(
                    "{} parser could not extract {:?}: {}",
                    parser.name(),
                    path,
                    e
                );
                let timings = StageTimings {
                    extract: started.elapsed(),
                    ..Default::default()
                };
                self.transition(IngestState::Empty);
                return Ok(IngestReport::empty(&source_file, self.mode, timings));
            }
        };

        let mut report = self.ingest_document(&root, &source_file)?;
        report.timings.extract += started.elapsed().saturating_sub(report.timings.total());
        Ok(report)
    }

    /// Ingest an already parsed document tree
    pub fn ingest_document(&mut self, root: &DocNode, source_file: &str) -> Result<IngestReport> {
        match self.run(root, source_file) {
            Ok(report) => Ok(report),
            Err(e) => {
                self.transition(IngestState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn run(&mut self, root: &DocNode, source_file: &str) -> Result<IngestReport> {
        let mut timings = StageTimings::default();

        self.transition(IngestState::Extracting);
        let started = Instant::now();
        let items = extract_items(root);
        timings.extract = started.elapsed();
        if items.is_empty() {
            tracing::info!("No text extracted from {}", source_file);
            self.transition(IngestState::Empty);
            return Ok(IngestReport::empty(source_file, self.mode, timings));
        }

        self.transition(IngestState::Normalizing);
        let started = Instant::now();
        let normalized: Vec<_> = items
            .iter()
            .map(|item| (item, normalize_text(&item.content)))
            .filter(|(_, text)| !text.is_empty())
            .collect();
        timings.normalize = started.elapsed();
        if normalized.is_empty() {
            tracing::info!("{} has no text left after normalization", source_file);
            self.transition(IngestState::Empty);
            return Ok(IngestReport::empty(source_file, self.mode, timings));
        }

        self.transition(IngestState::Chunking);
        let started = Instant::now();
        let mut chunks = Vec::new();
        for (item, text) in &normalized {
            for window in chunk_text(text, self.params) {
                chunks.push(Chunk::new(
                    source_file,
                    item.page.as_str(),
                    item.content_type.as_str(),
                    window.text,
                ));
            }
        }
        timings.chunk = started.elapsed();
        tracing::debug!("{} split into {} chunks", source_file, chunks.len());

        self.transition(IngestState::Embedding);
        let started = Instant::now();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let vectors = embed_all(self.embedder.as_mut(), &texts, self.batch_size)?;
        timings.embed = started.elapsed();

        self.transition(IngestState::Indexing);
        let started = Instant::now();
        let chunk_count = chunks.len();
        let generation = self.commit(chunks, vectors)?;
        timings.index = started.elapsed();

        self.transition(IngestState::Persisted);
        tracing::info!(
            "Ingested {}: {} chunks, generation holds {} ({:?})",
            source_file,
            chunk_count,
            generation.len(),
            timings.total()
        );

        Ok(IngestReport {
            outcome: IngestOutcome::Persisted,
            source_file: source_file.to_string(),
            chunks: chunk_count,
            generation_size: generation.len(),
            mode: self.mode,
            timings,
        })
    }

    /// Persist the new chunks: replace the generation, or extend the current
    /// one while holding the storage target exclusively
    fn commit(&self, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<Generation> {
        match self.mode {
            IngestMode::Replace => {
                let generation = Generation::new(
                    VectorIndex::from_vectors(&vectors)?,
                    ChunkStore::from_chunks(chunks),
                )?;
                self.storage.save(&generation)?;
                Ok(generation)
            }
            IngestMode::Append => {
                let dim = self.embedder.dimension();
                self.storage.update(Box::new(move |current| {
                    let (mut all_vectors, mut store) = match current {
                        Some(current) if !current.is_empty() => {
                            let (index, store) = current.into_parts();
                            if index.dim() != dim {
                                return Err(RagError::DimensionMismatch {
                                    expected: index.dim(),
                                    actual: dim,
                                });
                            }
                            (index.vectors(), store)
                        }
                        _ => (Vec::new(), ChunkStore::new()),
                    };
                    all_vectors.extend(vectors);
                    store.extend(chunks);
                    Generation::new(VectorIndex::from_vectors(&all_vectors)?, store)
                }))
            }
        }
    }

    fn transition(&mut self, next: IngestState) {
        tracing::debug!("Ingest state {} -> {}", self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashingEmbedder;
    use crate::storage::MemoryStorage;

    fn ingestor(storage: Arc<dyn Storage>, mode: IngestMode) -> Ingestor {
        let config = RagConfig {
            ingest_mode: mode,
            ..Default::default()
        };
        Ingestor::new(&config, Box::new(HashingEmbedder::new(64).unwrap()), storage).unwrap()
    }

    #[test]
    fn test_six_hundred_chars_make_two_chunks() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut ingestor = ingestor(storage.clone(), IngestMode::Replace);
        let text = "abcdefghij".repeat(60);
        let report = ingestor
            .ingest_document(&DocNode::text(text.clone()), "alpha.txt")
            .unwrap();

        assert_eq!(report.outcome, IngestOutcome::Persisted);
        assert_eq!(report.chunks, 2);
        assert_eq!(ingestor.state(), &IngestState::Persisted);

        let generation = storage.load().unwrap().unwrap();
        let second = &generation.store().get(1).unwrap().text;
        assert_eq!(second, &text[400..]);
    }

    #[test]
    fn test_empty_document_is_noop_success() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut ingestor = ingestor(storage.clone(), IngestMode::Replace);

        let report = ingestor
            .ingest_document(&DocNode::container(vec![DocNode::Other]), "blank.pdf")
            .unwrap();
        assert_eq!(report.outcome, IngestOutcome::Empty);
        assert_eq!(report.chunks, 0);
        assert_eq!(ingestor.state(), &IngestState::Empty);
        assert!(!storage.exists());
    }

    #[test]
    fn test_text_removed_by_normalization_is_empty() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut ingestor = ingestor(storage.clone(), IngestMode::Replace);
        let report = ingestor
            .ingest_document(&DocNode::text("\u{2022} \u{00a0}\u{2014}"), "symbols.txt")
            .unwrap();
        assert_eq!(report.outcome, IngestOutcome::Empty);
        assert!(!storage.exists());
    }

    #[test]
    fn test_empty_document_keeps_previous_generation() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut ingestor = ingestor(storage.clone(), IngestMode::Replace);
        ingestor
            .ingest_document(&DocNode::text("kept content"), "a.txt")
            .unwrap();
        ingestor.ingest_document(&DocNode::Other, "b.txt").unwrap();

        let generation = storage.load().unwrap().unwrap();
        assert_eq!(generation.store().get(0).unwrap().text, "kept content");
    }

    #[test]
    fn test_chunks_are_normalized_and_tagged() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut ingestor = ingestor(storage.clone(), IngestMode::Replace);
        ingestor
            .ingest_document(&DocNode::text("  Hello\n\tWORLD  "), "greeting.txt")
            .unwrap();

        let generation = storage.load().unwrap().unwrap();
        let chunk = generation.store().get(0).unwrap();
        assert_eq!(chunk.text, "hello world");
        assert_eq!(chunk.source_file, "greeting.txt");
        assert_eq!(chunk.page, "all");
        assert_eq!(chunk.content_type, "text");
    }

    #[test]
    fn test_replace_mode_discards_previous_generation() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut ingestor = ingestor(storage.clone(), IngestMode::Replace);
        ingestor.ingest_document(&DocNode::text("first"), "a.txt").unwrap();
        let report = ingestor.ingest_document(&DocNode::text("second"), "b.txt").unwrap();

        assert_eq!(report.generation_size, 1);
        let generation = storage.load().unwrap().unwrap();
        assert_eq!(generation.store().source_files(), vec!["b.txt"]);
    }

    #[test]
    fn test_append_mode_preserves_alignment() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut ingestor = ingestor(storage.clone(), IngestMode::Append);
        ingestor.ingest_document(&DocNode::text("first doc"), "a.txt").unwrap();
        let report = ingestor
            .ingest_document(&DocNode::text("second doc"), "b.txt")
            .unwrap();
        assert_eq!(report.chunks, 1);
        assert_eq!(report.generation_size, 2);

        let generation = storage.load().unwrap().unwrap();
        assert_eq!(generation.index().len(), generation.store().len());

        let mut embedder = HashingEmbedder::new(64).unwrap();
        for (i, chunk) in generation.store().chunks().iter().enumerate() {
            let expected = embedder.embed_query(&chunk.text).unwrap();
            assert_eq!(generation.index().vector(i).unwrap(), expected.as_slice());
        }
    }

    #[test]
    fn test_append_rejects_dimension_change() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        ingestor(storage.clone(), IngestMode::Append)
            .ingest_document(&DocNode::text("first"), "a.txt")
            .unwrap();

        let config = RagConfig {
            ingest_mode: IngestMode::Append,
            ..Default::default()
        };
        let mut other = Ingestor::new(
            &config,
            Box::new(HashingEmbedder::new(32).unwrap()),
            storage.clone(),
        )
        .unwrap();
        let err = other
            .ingest_document(&DocNode::text("second"), "b.txt")
            .unwrap_err();
        assert!(matches!(
            err,
            RagError::DimensionMismatch {
                expected: 64,
                actual: 32
            }
        ));
        assert!(matches!(other.state(), IngestState::Failed(_)));
        assert_eq!(storage.load().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_chunk_ids_never_reused() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut ingestor = ingestor(storage.clone(), IngestMode::Replace);
        ingestor.ingest_document(&DocNode::text("same"), "a.txt").unwrap();
        let first = storage.load().unwrap().unwrap().store().get(0).unwrap().chunk_id.clone();
        ingestor.ingest_document(&DocNode::text("same"), "a.txt").unwrap();
        let second = storage.load().unwrap().unwrap().store().get(0).unwrap().chunk_id.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn test_ingest_file_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "Meeting notes\n\nShip the release on Friday").unwrap();

        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut ingestor = ingestor(storage.clone(), IngestMode::Replace);
        let report = ingestor.ingest_file(&path).unwrap();

        assert_eq!(report.outcome, IngestOutcome::Persisted);
        assert_eq!(report.source_file, "notes.txt");
        let generation = storage.load().unwrap().unwrap();
        assert_eq!(
            generation.store().get(0).unwrap().text,
            "meeting notes ship the release on friday"
        );
    }

    #[test]
    fn test_unreadable_file_counts_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut ingestor = ingestor(storage.clone(), IngestMode::Replace);
        let report = ingestor.ingest_file(&path).unwrap();
        assert_eq!(report.outcome, IngestOutcome::Empty);
        assert_eq!(ingestor.state(), &IngestState::Empty);
    }

    #[test]
    fn test_unsupported_file_records_failed_state() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut ingestor = ingestor(storage, IngestMode::Replace);
        ingestor
            .ingest_document(&DocNode::text("earlier run"), "a.txt")
            .unwrap();
        assert_eq!(ingestor.state(), &IngestState::Persisted);

        assert!(ingestor.ingest_file(Path::new("slides.unsupported")).is_err());
        assert!(matches!(ingestor.state(), IngestState::Failed(_)));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(IngestState::Embedding.to_string(), "embedding");
        assert_eq!(
            IngestState::Failed("disk full".into()).to_string(),
            "failed: disk full"
        );
        assert!(IngestState::Empty.is_terminal());
        assert!(!IngestState::Chunking.is_terminal());
    }
}
