//! Configuration for ingestion, retrieval and answering.
//!
//! Loaded from TOML; every field has a default so a missing or partial file
//! is valid.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{RagError, Result};

/// Environment variable overriding the embedding model
pub const EMBED_MODEL_ENV: &str = "NOTECHAT_EMBED_MODEL";

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "NOTECHAT_DATA_DIR";

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;
pub const DEFAULT_EMBED_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 64;
pub const DEFAULT_DATA_DIR: &str = "data/extracted_data";

const INDEX_FILE: &str = "vectors.idx";
const METADATA_FILE: &str = "metadata.json";
const CHUNKS_TEXT_FILE: &str = "chunks.txt";

/// Whether an ingestion replaces the current generation or extends it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    #[default]
    Replace,
    Append,
}

impl std::str::FromStr for IngestMode {
    type Err = RagError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "append" => Ok(Self::Append),
            other => Err(RagError::InvalidConfig(format!(
                "Unknown ingest mode: {other}. Expected replace or append"
            ))),
        }
    }
}

/// Completion model endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434/api/generate".to_string(),
            model: "mistral".to_string(),
            timeout_secs: 120,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_model_id: String,
    pub top_k: usize,
    pub index_path: PathBuf,
    pub metadata_path: PathBuf,
    /// Human-readable dump of the current generation, rewritten on every ingest
    pub chunks_text_path: Option<PathBuf>,
    pub ingest_mode: IngestMode,
    pub embed_batch_size: usize,
    pub completion: CompletionConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self::with_data_dir(Path::new(DEFAULT_DATA_DIR))
    }
}

impl RagConfig {
    /// Default configuration with all artifacts placed under `dir`
    pub fn with_data_dir(dir: &Path) -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            embedding_model_id: DEFAULT_EMBED_MODEL.to_string(),
            top_k: DEFAULT_TOP_K,
            index_path: dir.join(INDEX_FILE),
            metadata_path: dir.join(METADATA_FILE),
            chunks_text_path: Some(dir.join(CHUNKS_TEXT_FILE)),
            ingest_mode: IngestMode::default(),
            embed_batch_size: DEFAULT_EMBED_BATCH_SIZE,
            completion: CompletionConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::InvalidConfig("chunk_size must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k == 0 {
            return Err(RagError::InvalidConfig("top_k must be positive".into()));
        }
        if self.embed_batch_size == 0 {
            return Err(RagError::InvalidConfig(
                "embed_batch_size must be positive".into(),
            ));
        }
        if self.index_path == self.metadata_path {
            return Err(RagError::InvalidConfig(
                "index_path and metadata_path must differ".into(),
            ));
        }
        Ok(())
    }

    /// Apply `NOTECHAT_*` environment overrides.
    ///
    /// `NOTECHAT_DATA_DIR` relocates all three artifacts.
    pub fn apply_env(&mut self) {
        if let Ok(model) = env::var(EMBED_MODEL_ENV) {
            if !model.trim().is_empty() {
                self.embedding_model_id = model.trim().to_string();
            }
        }
        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                let dir = PathBuf::from(dir.trim());
                self.index_path = dir.join(INDEX_FILE);
                self.metadata_path = dir.join(METADATA_FILE);
                self.chunks_text_path = Some(dir.join(CHUNKS_TEXT_FILE));
            }
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "notechat").ok_or_else(|| {
        RagError::InvalidConfig("Could not determine config directory".into())
    })?;
    Ok(dirs.config_dir().join("config.toml"))
}

pub fn load_config(path: &Path) -> Result<RagConfig> {
    if !path.exists() {
        return Ok(RagConfig::default());
    }

    let contents = std::fs::read_to_string(path)?;
    let config: RagConfig = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RagConfig::default();
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.chunk_overlap, 100);
        assert_eq!(config.top_k, 5);
        assert_eq!(config.ingest_mode, IngestMode::Replace);
        assert!(config.index_path.ends_with("vectors.idx"));
        assert!(config.metadata_path.ends_with("metadata.json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_overlap_not_below_size() {
        let config = RagConfig {
            chunk_size: 100,
            chunk_overlap: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RagError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_top_k() {
        let config = RagConfig {
            top_k: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: RagConfig = toml::from_str(
            r#"
chunk_size = 256
chunk_overlap = 32
ingest_mode = "append"

[completion]
model = "llama3"
"#,
        )
        .unwrap();
        assert_eq!(config.chunk_size, 256);
        assert_eq!(config.chunk_overlap, 32);
        assert_eq!(config.ingest_mode, IngestMode::Append);
        assert_eq!(config.completion.model, "llama3");
        assert_eq!(config.completion.max_retries, 3);
        assert_eq!(config.top_k, DEFAULT_TOP_K);
    }

    #[test]
    fn test_load_config_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, RagConfig::default());
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "chunk_size = 10\nchunk_overlap = 20\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_ingest_mode_parse() {
        assert_eq!("Append".parse::<IngestMode>().unwrap(), IngestMode::Append);
        assert_eq!(" replace ".parse::<IngestMode>().unwrap(), IngestMode::Replace);
        assert!("merge".parse::<IngestMode>().is_err());
    }

    #[test]
    fn test_with_data_dir_places_artifacts() {
        let config = RagConfig::with_data_dir(Path::new("/tmp/nc"));
        assert_eq!(config.index_path, Path::new("/tmp/nc/vectors.idx"));
        assert_eq!(config.metadata_path, Path::new("/tmp/nc/metadata.json"));
        assert_eq!(
            config.chunks_text_path.as_deref(),
            Some(Path::new("/tmp/nc/chunks.txt"))
        );
    }
}
