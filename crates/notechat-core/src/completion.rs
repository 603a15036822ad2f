//! Completion model boundary
//!
//! A completion model takes one prompt and returns one response string.
//! [`OllamaClient`] talks to an Ollama-compatible `/api/generate` endpoint.
//! Failures surface as `UpstreamModelFailure`, which callers retry with
//! [`complete_with_retry`].

use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

use crate::config::CompletionConfig;
use crate::error::{RagError, Result};

/// Turns a prompt into a response
pub trait CompletionModel: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String>;

    /// Model name for logging
    fn name(&self) -> &str;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Non-streaming client for an Ollama `/api/generate` endpoint
pub struct OllamaClient {
    url: String,
    model: String,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(config: &CompletionConfig) -> Self {
        Self::new(&config.url, &config.model).with_timeout(Duration::from_secs(config.timeout_secs))
    }
}

impl CompletionModel for OllamaClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        tracing::debug!("Sending {} char prompt to {}", prompt.len(), self.url);
        let response = ureq::post(&self.url)
            .timeout(self.timeout)
            .send_json(&request)
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => RagError::UpstreamModelFailure(format!(
                    "{} returned HTTP {}",
                    self.url, code
                )),
                other => RagError::UpstreamModelFailure(format!(
                    "Failed to reach {}: {}",
                    self.url, other
                )),
            })?;

        let body: GenerateResponse = response.into_json().map_err(|e| {
            RagError::UpstreamModelFailure(format!("Malformed completion response: {e}"))
        })?;
        Ok(body.response)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &CompletionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.retry_backoff_ms),
            ..Default::default()
        }
    }

    /// No retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Call `model`, retrying retryable failures per `policy`
pub fn complete_with_retry(
    model: &dyn CompletionModel,
    prompt: &str,
    policy: &RetryPolicy,
) -> Result<String> {
    let mut attempt = 0;
    loop {
        match model.complete(prompt) {
            Ok(answer) => return Ok(answer),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    model.name(),
                    attempt + 1,
                    policy.max_retries + 1,
                    e,
                    delay
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
