//! Question answering over the ingested documents
//!
//! [`ChatService`] ties the retriever, the prompt templates and a completion
//! model together. Retrieval failures that only mean "nothing ingested yet"
//! are kept distinct from upstream model failures all the way to
//! [`ErrorPayload`].

use serde::{Deserialize, Serialize};

use crate::completion::{complete_with_retry, CompletionModel, RetryPolicy};
use crate::error::{RagError, Result};
use crate::prompt::build_prompt;
use crate::retriever::Retriever;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Answer from the ingested documents instead of general knowledge
    #[serde(default)]
    pub use_documents: bool,
}

impl ChatRequest {
    pub fn documents(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            use_documents: true,
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            use_documents: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerSource {
    Documents,
    General,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub source: AnswerSource,
    pub chunks_used: usize,
}

/// Error kind reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoIndex,
    UpstreamFailure,
    IndexCorrupt,
    Internal,
}

/// Client-facing error body: `{ code, error, details }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub error: String,
    pub details: String,
}

impl From<&RagError> for ErrorPayload {
    fn from(err: &RagError) -> Self {
        let (code, error) = match err {
            RagError::NoIndexAvailable | RagError::IndexEmpty => (
                ErrorCode::NoIndex,
                "No document has been ingested yet. Ingest a document first.",
            ),
            RagError::UpstreamModelFailure(_) => (
                ErrorCode::UpstreamFailure,
                "The completion model could not produce an answer.",
            ),
            RagError::PersistenceCorrupt(_) | RagError::DimensionMismatch { .. } => (
                ErrorCode::IndexCorrupt,
                "The stored index is unusable. Re-ingest your documents.",
            ),
            _ => (ErrorCode::Internal, "Error processing the question."),
        };
        Self {
            code,
            error: error.to_string(),
            details: err.to_string(),
        }
    }
}

pub struct ChatService {
    completion: Box<dyn CompletionModel>,
    retriever: Option<Retriever>,
    retry: RetryPolicy,
    top_k: usize,
    fallback_ungrounded: bool,
}

impl ChatService {
    /// Service that answers from general knowledge only until a retriever is attached
    pub fn new(completion: Box<dyn CompletionModel>) -> Self {
        Self {
            completion,
            retriever: None,
            retry: RetryPolicy::default(),
            top_k: crate::config::DEFAULT_TOP_K,
            fallback_ungrounded: false,
        }
    }

    pub fn with_retriever(mut self, retriever: Retriever) -> Self {
        self.top_k = retriever.top_k();
        self.retriever = Some(retriever);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Answer ungrounded instead of failing when nothing has been ingested
    pub fn with_fallback_ungrounded(mut self, enabled: bool) -> Self {
        self.fallback_ungrounded = enabled;
        self
    }

    pub fn ask(&mut self, request: &ChatRequest) -> Result<ChatResponse> {
        if !request.use_documents {
            tracing::info!("Answering from general knowledge");
            let answer = complete_with_retry(self.completion.as_ref(), &request.message, &self.retry)?;
            return Ok(ChatResponse {
                answer,
                source: AnswerSource::General,
                chunks_used: 0,
            });
        }

        let retrieved = match self.retriever.as_mut() {
            Some(retriever) => retriever.retrieve(&request.message, self.top_k),
            None => Err(RagError::NoIndexAvailable),
        };

        let chunks = match retrieved {
            Ok(chunks) => chunks,
            Err(e) if e.is_no_data() && self.fallback_ungrounded => {
                tracing::warn!("No index available; answering without document context");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        for (i, chunk) in chunks.iter().enumerate() {
            tracing::debug!(
                "Chunk {}: {}",
                i + 1,
                chunk.text.chars().take(100).collect::<String>()
            );
        }

        let prompt = build_prompt(&chunks, &request.message);
        let answer = complete_with_retry(self.completion.as_ref(), &prompt, &self.retry)?;
        let source = if chunks.is_empty() {
            AnswerSource::General
        } else {
            AnswerSource::Documents
        };

        tracing::info!("Answered with {} context chunks", chunks.len());
        Ok(ChatResponse {
            answer,
            source,
            chunks_used: chunks.len(),
        })
    }
}
