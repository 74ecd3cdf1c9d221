//! kbroute-embed
//!
//! Query embedders for the vector tiers. `MiniLmEmbedder` runs a
//! sentence-transformers BERT model (all-MiniLM-L6-v2 layout) with candle;
//! `HashEmbedder` is a deterministic stand-in for tests and offline work.
use anyhow::{Result, anyhow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::Tokenizer;

use kbroute_core::traits::Embedder;

pub mod device;
pub mod pool;
pub mod tokenize;

pub use pool::masked_mean_l2;

const MAX_QUERY_TOKENS: usize = 256;

pub struct MiniLmEmbedder { model: BertModel, tokenizer: Tokenizer, device: Device, id: String, dim: usize }

impl MiniLmEmbedder {
    pub fn load(model_dir: &Path) -> Result<Self> {
        let device = device::select_device();
        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e))?;
        let config_path = model_dir.join("config.json");
        let raw_config = std::fs::read_to_string(&config_path)?;
        let config: BertConfig = serde_json::from_str(&raw_config)?;
        let dim = serde_json::from_str::<serde_json::Value>(&raw_config)?
            .get("hidden_size").and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow!("{} has no hidden_size", config_path.display()))? as usize;
        let vb = load_weights(model_dir, &device)?;
        let model = BertModel::load(vb, &config)?;
        tracing::info!(model_dir = %model_dir.display(), dim, "query embedder loaded");
        Ok(Self { model, tokenizer, device, id: format!("minilm:d{dim}"), dim })
    }
}

fn load_weights(model_dir: &Path, device: &Device) -> Result<VarBuilder<'static>> {
    let safetensors = model_dir.join("model.safetensors");
    if safetensors.exists() {
        // SAFETY: the weights file is not modified while the model is loaded.
        return Ok(unsafe { VarBuilder::from_mmaped_safetensors(&[safetensors], DType::F32, device)? });
    }
    let weights_path = model_dir.join("pytorch_model.bin");
    let weights = candle_core::pickle::read_all(&weights_path)
        .map_err(|e| anyhow!("Failed to read weights from {}: {}", weights_path.display(), e))?;
    let weights_map: std::collections::HashMap<String, candle_core::Tensor> = weights.into_iter().collect();
    Ok(VarBuilder::from_tensors(weights_map, DType::F32, device))
}

impl Embedder for MiniLmEmbedder {
    fn id(&self) -> &str { &self.id }
    fn dim(&self) -> usize { self.dim }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let start = Instant::now();
        let (input_ids, token_type_ids, attention_mask) = tokenize::tokenize_on_device(&self.tokenizer, text, MAX_QUERY_TOKENS, &self.device)?;
        let hidden = self.model.forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let pooled = masked_mean_l2(&hidden, &attention_mask)?;
        let v: Vec<f32> = pooled.to_device(&Device::Cpu)?.squeeze(0)?.to_vec1()?;
        if v.len() != self.dim { return Err(anyhow!("embedding has {} dims, expected {}", v.len(), self.dim)); }
        let elapsed = start.elapsed();
        if elapsed.as_millis() > 100 { tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "slow query embedding"); }
        Ok(v)
    }
}

/// Deterministic bag-of-words embedder based on xxhash.
///
/// Texts sharing words land near each other, which is enough for wiring tests
/// and offline development; it carries no semantics.
pub struct HashEmbedder { dim: usize, id: String }

impl HashEmbedder {
    pub fn new(dim: usize) -> Self { Self { dim: dim.max(1), id: format!("hash:d{}", dim.max(1)) } }
}

impl Embedder for HashEmbedder {
    fn id(&self) -> &str { &self.id }
    fn dim(&self) -> usize { self.dim }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        use std::hash::{Hash, Hasher};
        use twox_hash::XxHash64;
        let mut v = vec![0f32; self.dim];
        for token in text.split_whitespace() {
            let token = token.to_lowercase();
            let mut hasher = XxHash64::with_seed(0);
            token.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h as usize) % self.dim;
            v[idx] += 0.5 + (((h >> 32) as u32) as f32) / (u32::MAX as f32);
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        for x in &mut v { *x /= norm; }
        Ok(v)
    }
}

/// Pick the query embedder.
///
/// `APP_USE_FAKE_EMBEDDINGS=1` or `fake = true` selects the `HashEmbedder`;
/// otherwise the MiniLM model is loaded from the first existing directory of
/// `APP_MODEL_DIR`, `MODEL_DIR`, the configured `model_dir`, `models/all-MiniLM-L6-v2`.
pub fn default_embedder(model_dir: Option<&Path>, dimension: usize, fake: bool) -> Result<Arc<dyn Embedder>> {
    let use_fake = fake || std::env::var("APP_USE_FAKE_EMBEDDINGS").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
    if use_fake { tracing::info!(dimension, "using hash embedder"); return Ok(Arc::new(HashEmbedder::new(dimension))); }
    let dir = resolve_model_dir(model_dir)?;
    Ok(Arc::new(MiniLmEmbedder::load(&dir)?))
}

fn resolve_model_dir(configured: Option<&Path>) -> Result<PathBuf> {
    let candidates = std::env::var("APP_MODEL_DIR").ok().map(PathBuf::from).into_iter()
        .chain(std::env::var("MODEL_DIR").ok().map(PathBuf::from))
        .chain(configured.map(Path::to_path_buf))
        .chain(std::iter::once(PathBuf::from("models/all-MiniLM-L6-v2")));
    for p in candidates { if p.exists() { return Ok(p); } }
    Err(anyhow!("Could not locate MiniLM model directory"))
}
