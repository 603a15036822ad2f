//! notechat-core: retrieval pipeline for document question answering
//!
//! This crate provides:
//! - Text normalization and fixed-window chunking
//! - Sentence embeddings (MiniLM via Candle, or an offline hashing embedder)
//! - A flat vector index and an order-aligned chunk store
//! - Paired, crash-safe persistence of index generations
//! - Ingestion, retrieval, prompt assembly and completion-model access

pub mod chat;
pub mod chunker;
pub mod completion;
pub mod config;
pub mod document;
pub mod embedder;
pub mod error;
pub mod index;
pub mod jobs;
pub mod normalize;
pub mod pipeline;
pub mod prompt;
pub mod retriever;
pub mod storage;
pub mod store;

pub use chat::{AnswerSource, ChatRequest, ChatResponse, ChatService, ErrorCode, ErrorPayload};
pub use chunker::{chunk_text, ChunkParams, TextWindow};
pub use completion::{complete_with_retry, CompletionModel, OllamaClient, RetryPolicy};
pub use config::{load_config, IngestMode, RagConfig};
pub use document::{extract_items, parser_for_path, DocNode, DocumentParser, ExtractedItem};
pub use embedder::{load_embedder, Embedder, HashingEmbedder, MiniLmEmbedder};
pub use error::{RagError, Result};
pub use index::{Neighbor, VectorIndex};
pub use jobs::{IngestCompletion, IngestSource, IngestWorker};
pub use normalize::normalize_text;
pub use pipeline::{IngestOutcome, IngestReport, IngestState, Ingestor};
pub use prompt::{build_prompt, general_prompt};
pub use retriever::{RetrievedChunk, Retriever};
pub use storage::{FileStorage, Generation, MemoryStorage, Storage, UpdateFn};
pub use store::{Chunk, ChunkStore};
