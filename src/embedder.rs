//! # Embedder
//!
//! Maps free text to a fixed-dimension vector. The index builder embeds every
//! record's `title + "\n\n" + description`; the retriever embeds the raw query
//! string. Both sides must use the same model, or distances are meaningless.
//!
//! [`SentenceEmbeddingsModel`] is the production implementation: a BERT
//! sentence-transformer (`all-MiniLM-L6-v2` by default) run on CPU through
//! Candle, mean pooled over the attention mask and L2 normalized. Weights,
//! tokenizer and config are fetched once through the Hugging Face Hub cache.
//!
//! Implementations must be deterministic for a given text and model version
//! and safe to share across threads; the retriever calls them from
//! `spawn_blocking` workers and the indexer from rayon.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Hugging Face model id used when the config does not name one.
pub const DEFAULT_EMBEDDING_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("model download failed: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("model inference failed: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("invalid model config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("embedding failed: {0}")]
    Other(String),
}

/// Anything that turns text into a vector of a fixed length.
pub trait Embedder: Send + Sync {
    /// Length of every vector returned by [`Embedder::embed`].
    fn dimension(&self) -> usize;

    /// Identifier recorded in index snapshots so mismatched models can be spotted.
    fn model_id(&self) -> &str;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Sentence embeddings model using Candle (pure Rust)
pub struct SentenceEmbeddingsModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
    dimension: usize,
}

impl SentenceEmbeddingsModel {
    /// Load `model_id` from the Hugging Face Hub (or its local cache).
    ///
    /// This blocks on network and disk I/O; call it at startup or from a
    /// blocking task.
    ///
    /// # Errors
    /// Download failures, an unreadable `config.json`, a broken tokenizer, or
    /// weights that do not match the BERT architecture.
    pub fn load(model_id: &str) -> Result<Self, EmbedError> {
        let device = Device::Cpu;
        let revision = "main";

        info!("Loading embedding model {}", model_id);

        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, revision.to_string());
        let api = Api::new()?;
        let api_repo = api.repo(repo);

        let config_filename = api_repo.get("config.json")?;
        let tokenizer_filename = api_repo.get("tokenizer.json")?;
        let weights_filename = api_repo.get("model.safetensors")?;

        let raw_config = std::fs::read_to_string(config_filename)?;
        let dimension = serde_json::from_str::<serde_json::Value>(&raw_config)?
            .get("hidden_size")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| EmbedError::Other("config.json has no hidden_size".into()))?
            as usize;
        let config: Config = serde_json::from_str(&raw_config)?;

        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| EmbedError::Tokenizer(e.to_string()))?;

        // SAFETY: the safetensors file lives in the hub cache and is not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)? };
        let model = BertModel::load(vb, &config)?;

        debug!("Embedding model {} ready ({} dimensions)", model_id, dimension);

        Ok(Self {
            model,
            tokenizer,
            device,
            model_id: model_id.to_string(),
            dimension,
        })
    }

    /// Encode text into an embedding
    pub fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        // Truncation to the model's 512 token window happens in the tokenizer.
        let tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbedError::Tokenizer(e.to_string()))?;

        let token_ids = Tensor::new(tokens.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(tokens.get_type_ids(), &self.device)?.unsqueeze(0)?;

        let output = self.model.forward(&token_ids, &token_type_ids, None)?;

        let embedding = self.mean_pooling(&output, tokens.get_attention_mask())?;
        let embedding = Self::normalize(&embedding)?;

        Ok(embedding.to_vec1::<f32>()?)
    }

    /// Mean pooling over token embeddings, considering attention mask
    fn mean_pooling(&self, embeddings: &Tensor, attention_mask: &[u32]) -> Result<Tensor, EmbedError> {
        // embeddings: [1, seq_len, hidden]; mask reshaped to [1, seq_len, 1] to broadcast
        let mask = Tensor::new(attention_mask, &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        let sum = embeddings.broadcast_mul(&mask)?.sum(1)?;
        let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;

        Ok(sum.broadcast_div(&count)?.squeeze(0)?)
    }

    /// L2 normalize the embedding vector
    fn normalize(tensor: &Tensor) -> Result<Tensor, EmbedError> {
        let norm = tensor.sqr()?.sum_all()?.sqrt()?;
        Ok(tensor.broadcast_div(&norm)?)
    }
}

impl Embedder for SentenceEmbeddingsModel {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.encode(text)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Test double with hand-picked vectors; unknown text is an error.
    pub(crate) struct MapEmbedder {
        vectors: HashMap<String, Vec<f32>>,
        dimension: usize,
    }

    impl MapEmbedder {
        pub(crate) fn new<I, S>(entries: I) -> Self
        where
            I: IntoIterator<Item = (S, Vec<f32>)>,
            S: Into<String>,
        {
            let vectors: HashMap<String, Vec<f32>> =
                entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
            let dimension = vectors.values().next().map(Vec::len).unwrap_or(0);
            Self { vectors, dimension }
        }
    }

    impl Embedder for MapEmbedder {
        fn dimension(&self) -> usize {
            self.dimension
        }

        fn model_id(&self) -> &str {
            "test/map-embedder"
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            self.vectors
                .get(text)
                .cloned()
                .ok_or_else(|| EmbedError::Other(format!("no vector for {text:?}")))
        }
    }

    #[test]
    fn test_map_embedder_is_deterministic() {
        let e = MapEmbedder::new([("a", vec![1.0, 0.0]), ("b", vec![0.0, 1.0])]);
        assert_eq!(e.dimension(), 2);
        assert_eq!(e.embed("a").unwrap(), e.embed("a").unwrap());
        assert!(e.embed("c").is_err());
    }

    #[test]
    #[ignore = "downloads the MiniLM weights from the Hugging Face Hub"]
    fn test_sentence_model_produces_normalized_vectors() -> Result<(), EmbedError> {
        let model = SentenceEmbeddingsModel::load(DEFAULT_EMBEDDING_MODEL)?;
        let v = model.embed("Open-air cinema in the park")?;
        assert_eq!(v.len(), model.dimension());

        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);

        assert_eq!(v, model.embed("Open-air cinema in the park")?);
        Ok(())
    }
}
