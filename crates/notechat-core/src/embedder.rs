//! Sentence embedding generation
//!
//! Maps batches of strings to fixed-dimension, L2-normalized vectors.
//!
//! Two implementations share the [`Embedder`] trait:
//! - [`MiniLmEmbedder`]: BERT sentence encoder (default
//!   `sentence-transformers/all-MiniLM-L6-v2`, 384 dim, mean pooling) run
//!   with Candle
//! - [`HashingEmbedder`]: deterministic feature-hashing embedder with no
//!   model download, used offline and in tests
//!
//! # Batch invariance
//!
//! Batching must never change output values. `MiniLmEmbedder` groups a batch
//! by token count and runs each group without padding, so every sequence is
//! encoded exactly as it would be on its own.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use hf_hub::api::sync::ApiBuilder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{RagError, Result};

/// Output dimension of all-MiniLM-L6-v2
pub const MINILM_DIM: usize = 384;

/// Maximum sequence length in tokens (sentence-transformers setting for MiniLM)
const MAX_SEQ_LEN: usize = 256;

/// Maps text to unit-norm vectors
pub trait Embedder: Send {
    /// Embed a batch of strings, one vector per input in input order
    fn embed_batch(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query string as typed
    fn embed_query(&mut self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .pop()
            .ok_or_else(|| RagError::Inference("Embedder returned no vector".into()))
    }

    /// Output dimension
    fn dimension(&self) -> usize;

    /// Model identifier recorded in logs and status output
    fn model_id(&self) -> &str;
}

/// Embed `texts` in batches of `batch_size`, checking count and dimension.
///
/// The batch size is a tuning knob only; results are identical for any value.
pub fn embed_all(
    embedder: &mut dyn Embedder,
    texts: &[&str],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let dim = embedder.dimension();
    let mut out = Vec::with_capacity(texts.len());

    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embedder.embed_batch(batch)?;
        if vectors.len() != batch.len() {
            return Err(RagError::Inference(format!(
                "Embedder returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }
        for vector in vectors {
            if vector.len() != dim {
                return Err(RagError::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                });
            }
            out.push(vector);
        }
        tracing::debug!("Embedded {}/{} chunks", out.len(), texts.len());
    }

    Ok(out)
}

/// Create the compute device for the current build
pub fn make_device() -> Device {
    #[cfg(feature = "metal")]
    {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    }
    #[cfg(not(feature = "metal"))]
    {
        Device::Cpu
    }
}

/// Load the embedder named by `model_id`.
///
/// `hashing` or `hashing:<dim>` selects the offline [`HashingEmbedder`];
/// anything else is treated as a HuggingFace model ID or local directory.
pub fn load_embedder(model_id: &str) -> Result<Box<dyn Embedder>> {
    if let Some(rest) = model_id.strip_prefix(HashingEmbedder::MODEL_ID) {
        let dim = match rest.strip_prefix(':') {
            Some(dim) => dim.parse().map_err(|_| {
                RagError::InvalidConfig(format!("Invalid hashing embedder dimension: {dim}"))
            })?,
            None if rest.is_empty() => MINILM_DIM,
            None => {
                return Err(RagError::InvalidConfig(format!(
                    "Unknown embedding model: {model_id}"
                )))
            }
        };
        return Ok(Box::new(HashingEmbedder::new(dim)?));
    }

    let device = make_device();
    Ok(Box::new(MiniLmEmbedder::from_pretrained(model_id, &device)?))
}

/// BERT sentence encoder with mean pooling
pub struct MiniLmEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
    dim: usize,
}

impl MiniLmEmbedder {
    /// Load from a local directory or a HuggingFace model ID
    pub fn from_pretrained(model_id: &str, device: &Device) -> Result<Self> {
        let path = Path::new(model_id);
        if path.is_dir() {
            tracing::info!("Loading model from local path: {}", model_id);
            let files = ModelFiles::in_dir(path);
            for file in [&files.config, &files.tokenizer, &files.weights] {
                if !file.exists() {
                    return Err(RagError::ModelUnavailable(format!(
                        "{} not found. Expected files: config.json, tokenizer.json, model.safetensors",
                        file.display()
                    )));
                }
            }
            return Self::from_files(model_id, &files, device);
        }

        let files = match Self::try_hf_hub(model_id) {
            Ok(files) => files,
            Err(e) => {
                tracing::debug!("hf-hub download failed: {}, trying manual download", e);
                Self::try_manual_download(model_id)?
            }
        };
        Self::from_files(model_id, &files, device)
    }

    fn try_hf_hub(model_id: &str) -> Result<ModelFiles> {
        let api = ApiBuilder::new()
            .with_progress(false)
            .build()
            .map_err(|e| RagError::ModelUnavailable(format!("HuggingFace API: {e}")))?;
        let repo = api.model(model_id.to_string());

        tracing::info!("Fetching model files from {}", model_id);
        let get = |name: &str| {
            repo.get(name)
                .map_err(|e| RagError::ModelUnavailable(format!("Failed to get {name}: {e}")))
        };
        Ok(ModelFiles {
            config: get("config.json")?,
            tokenizer: get("tokenizer.json")?,
            weights: get("model.safetensors")?,
        })
    }

    fn try_manual_download(model_id: &str) -> Result<ModelFiles> {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("notechat")
            .join("models")
            .join(model_id.replace('/', "_"));
        std::fs::create_dir_all(&cache_dir)?;

        let base_url = format!("https://huggingface.co/{model_id}/resolve/main");
        let files = ModelFiles::in_dir(&cache_dir);

        for local_path in [&files.config, &files.tokenizer, &files.weights] {
            if local_path.exists() {
                tracing::debug!("Using cached {}", local_path.display());
                continue;
            }
            let name = local_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let url = format!("{base_url}/{name}");
            tracing::info!("Downloading {}...", name);

            let response = ureq::get(&url)
                .call()
                .map_err(|e| RagError::ModelUnavailable(format!("Failed to download {name}: {e}")))?;

            // Download next to the target and rename so an interrupted
            // download never leaves a truncated file in the cache
            let partial = local_path.with_extension("partial");
            let mut out = std::fs::File::create(&partial)?;
            std::io::copy(&mut response.into_reader(), &mut out)?;
            std::fs::rename(&partial, local_path)?;
            tracing::info!("Downloaded {}", name);
        }

        Ok(files)
    }

    fn from_files(model_id: &str, files: &ModelFiles, device: &Device) -> Result<Self> {
        let unavailable = |what: &str, e: &dyn std::fmt::Display| {
            RagError::ModelUnavailable(format!("Failed to load {what}: {e}"))
        };

        let config_str = std::fs::read_to_string(&files.config)
            .map_err(|e| unavailable("config", &e))?;
        let config: BertConfig =
            serde_json::from_str(&config_str).map_err(|e| unavailable("BERT config", &e))?;

        let mut tokenizer =
            Tokenizer::from_file(&files.tokenizer).map_err(|e| unavailable("tokenizer", &e))?;
        // Padding would leak into mean pooling; truncation is done by hand
        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(None)
            .map_err(|e| unavailable("tokenizer", &e))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.weights], DType::F32, device)
                .map_err(|e| unavailable("weights", &e))?
        };
        let model = BertModel::load(vb.clone(), &config)
            .or_else(|_| BertModel::load(vb.pp("bert"), &config))
            .map_err(|e| unavailable("BERT model", &e))?;

        tracing::info!(
            "Loaded embedding model {} (hidden size {})",
            model_id,
            config.hidden_size
        );

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
            model_id: model_id.to_string(),
            dim: config.hidden_size,
        })
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| RagError::Inference(format!("Tokenization failed: {e}")))?;

        let mut tokens: Vec<u32> = encoding.get_ids().to_vec();

        // Keep the trailing [SEP] when truncating
        if tokens.len() > MAX_SEQ_LEN {
            let sep = tokens[tokens.len() - 1];
            tokens.truncate(MAX_SEQ_LEN - 1);
            tokens.push(sep);
        }

        Ok(tokens)
    }

    /// Encode sequences that all share `seq_len` tokens: `[batch, dim]`
    fn encode_group(&self, flat_tokens: &[u32], batch_size: usize, seq_len: usize) -> Result<Tensor> {
        let input_ids = Tensor::from_slice(flat_tokens, (batch_size, seq_len), &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;

        // hidden_states: [batch, seq_len, hidden]
        let hidden_states = self.model.forward(&input_ids, &token_type_ids, None)?;

        // Mean pooling over tokens; no padding so every position counts
        let pooled = (hidden_states.sum(1)? / seq_len as f64)?;
        l2_normalize(&pooled)
    }
}

impl Embedder for MiniLmEmbedder {
    fn embed_batch(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut groups: HashMap<usize, Vec<(usize, Vec<u32>)>> = HashMap::new();
        for (idx, text) in texts.iter().enumerate() {
            let tokens = self.tokenize(text)?;
            groups.entry(tokens.len()).or_default().push((idx, tokens));
        }

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        for (seq_len, entries) in groups {
            let mut flat_tokens = Vec::with_capacity(entries.len() * seq_len);
            for (_, tokens) in &entries {
                flat_tokens.extend_from_slice(tokens);
            }

            let embeddings = self.encode_group(&flat_tokens, entries.len(), seq_len)?;
            let rows: Vec<Vec<f32>> = embeddings.to_vec2()?;

            for ((orig_idx, _), row) in entries.iter().zip(rows) {
                results[*orig_idx] = Some(row);
            }
        }

        results
            .into_iter()
            .map(|item| item.ok_or_else(|| RagError::Inference("Missing batch embedding result".into())))
            .collect()
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

impl ModelFiles {
    fn in_dir(dir: &Path) -> Self {
        Self {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights: dir.join("model.safetensors"),
        }
    }
}

/// L2 normalize each row of a 2D tensor
fn l2_normalize(tensor: &Tensor) -> Result<Tensor> {
    let norm = tensor
        .sqr()?
        .sum_keepdim(1)?
        .sqrt()?
        .broadcast_add(&Tensor::new(&[1e-12f32], tensor.device())?)?;
    Ok(tensor.broadcast_div(&norm)?)
}

/// Deterministic embedder based on signed feature hashing of word tokens.
///
/// Texts sharing words land near each other, which is enough for offline
/// use and for exercising the pipeline without a model download.
pub struct HashingEmbedder {
    dim: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub const MODEL_ID: &'static str = "hashing";

    pub fn new(dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(RagError::InvalidConfig(
                "Embedding dimension must be positive".into(),
            ));
        }
        Ok(Self {
            dim,
            model_id: format!("{}:{dim}", Self::MODEL_ID),
        })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let hash = xxh3_64(word.to_lowercase().as_bytes());
            let slot = (hash % self.dim as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            // No tokens: fixed unit vector so the output stays normalized
            vector[0] = 1.0;
        } else {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn embed_batch(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
