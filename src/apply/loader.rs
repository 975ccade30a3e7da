//! Base model loader with automatic architecture detection
//!
//! Resolves checkpoint files from a local directory or the HuggingFace Hub,
//! reads the weights into a host tensor map (so adapters can be merged before
//! the network is built) and constructs the matching candle-transformers model.

use crate::device;
use crate::error::{Error, Result};
use crate::infer::generator::CausalLm;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{llama, phi3, qwen2};
use hf_hub::api::tokio::ApiBuilder;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// Phi-3 family, including Phi-4-mini
    Phi3,
    Llama,
    Qwen2,
}

impl Architecture {
    /// Map a `model_type` or `architectures[0]` value to a loader
    pub fn detect(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "phi3" | "phi3forcausallm" => Ok(Architecture::Phi3),
            "llama" | "llamaforcausallm" => Ok(Architecture::Llama),
            "qwen2" | "qwen2forcausallm" => Ok(Architecture::Qwen2),
            other => Err(Error::UnsupportedArchitecture(other.to_string())),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Architecture::Phi3 => "phi3",
            Architecture::Llama => "llama",
            Architecture::Qwen2 => "qwen2",
        };
        f.write_str(name)
    }
}

/// Fields of `config.json` the loader itself inspects
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub eos_token_ids: Vec<u32>,
    pub tie_word_embeddings: bool,
    /// Full JSON, handed to the architecture-specific config type
    pub raw: serde_json::Value,
}

impl ModelConfig {
    pub fn from_json(raw: serde_json::Value) -> Result<Self> {
        let name = raw["model_type"]
            .as_str()
            .or_else(|| raw["architectures"].as_array()?.first()?.as_str())
            .ok_or_else(|| {
                Error::model_loading("config.json names neither model_type nor architectures")
            })?;
        let architecture = Architecture::detect(name)?;

        let eos_token_ids = match &raw["eos_token_id"] {
            serde_json::Value::Number(n) => n.as_u64().map(|id| vec![id as u32]).unwrap_or_default(),
            serde_json::Value::Array(ids) => ids
                .iter()
                .filter_map(|id| id.as_u64().map(|id| id as u32))
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            architecture,
            eos_token_ids,
            tie_word_embeddings: raw["tie_word_embeddings"].as_bool().unwrap_or(false),
            raw,
        })
    }

    /// Build the output head from `lm_head.weight` instead of the embeddings
    pub fn untie_word_embeddings(&mut self) {
        self.tie_word_embeddings = false;
        if let Some(raw) = self.raw.as_object_mut() {
            raw.insert("tie_word_embeddings".to_string(), false.into());
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.raw.clone()).map_err(|e| {
            Error::model_loading(format!("failed to parse {} config: {}", self.architecture, e))
        })
    }
}

/// Checkpoint files for one base model
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct WeightsIndex {
    weight_map: HashMap<String, String>,
}

fn shard_names(index: &WeightsIndex) -> Vec<String> {
    index
        .weight_map
        .values()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Find checkpoint files locally, falling back to the HuggingFace Hub
pub async fn resolve_model_files(base_model: &str) -> Result<ModelFiles> {
    let local = Path::new(base_model);
    if local.join(CONFIG_FILE).exists() {
        return load_local_model_files(local).await;
    }
    if local.is_dir() {
        return Err(Error::ModelNotFound(format!(
            "{} is a directory without {}",
            base_model, CONFIG_FILE
        )));
    }
    load_hf_model_files(base_model).await
}

async fn load_local_model_files(model_dir: &Path) -> Result<ModelFiles> {
    info!("Loading model files from local directory: {}", model_dir.display());

    let tokenizer = model_dir.join(TOKENIZER_FILE);
    if !tokenizer.exists() {
        return Err(Error::ModelNotFound(format!(
            "no {} in {}",
            TOKENIZER_FILE,
            model_dir.display()
        )));
    }

    let index_path = model_dir.join(WEIGHTS_INDEX_FILE);
    let weights = if index_path.exists() {
        let index: WeightsIndex = serde_json::from_str(&fs::read_to_string(&index_path).await?)?;
        shard_names(&index).into_iter().map(|name| model_dir.join(name)).collect()
    } else if model_dir.join(SINGLE_WEIGHTS_FILE).exists() {
        vec![model_dir.join(SINGLE_WEIGHTS_FILE)]
    } else {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(model_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "safetensors") {
                found.push(path);
            }
        }
        found.sort();
        found
    };

    if weights.is_empty() {
        return Err(Error::ModelNotFound(format!(
            "no safetensors weights in {}",
            model_dir.display()
        )));
    }

    let tokenizer_config = Some(model_dir.join(TOKENIZER_CONFIG_FILE)).filter(|p| p.exists());

    Ok(ModelFiles {
        config: model_dir.join(CONFIG_FILE),
        tokenizer,
        tokenizer_config,
        weights,
    })
}

async fn load_hf_model_files(model_id: &str) -> Result<ModelFiles> {
    info!("Fetching model files from HuggingFace Hub: {}", model_id);

    let mut builder = ApiBuilder::new().with_progress(false);
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    let api = builder.build()?;
    let repo = api.model(model_id.to_string());

    let config = repo
        .get(CONFIG_FILE)
        .await
        .map_err(|e| Error::ModelNotFound(format!("{}: {}", model_id, e)))?;
    let tokenizer = repo
        .get(TOKENIZER_FILE)
        .await
        .map_err(|e| Error::ModelNotFound(format!("{} has no {}: {}", model_id, TOKENIZER_FILE, e)))?;
    let tokenizer_config = repo.get(TOKENIZER_CONFIG_FILE).await.ok();

    let weights = match repo.get(WEIGHTS_INDEX_FILE).await {
        Ok(index_path) => {
            let index: WeightsIndex = serde_json::from_str(&fs::read_to_string(&index_path).await?)?;
            let mut shards = Vec::new();
            for name in shard_names(&index) {
                debug!("Fetching weight shard {}", name);
                shards.push(repo.get(&name).await?);
            }
            shards
        }
        Err(_) => vec![repo.get(SINGLE_WEIGHTS_FILE).await.map_err(|e| {
            Error::ModelNotFound(format!("{} has no safetensors weights: {}", model_id, e))
        })?],
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        tokenizer_config,
        weights,
    })
}

/// Read `config.json`
pub async fn load_model_config(files: &ModelFiles) -> Result<ModelConfig> {
    let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&files.config).await?)?;
    let config = ModelConfig::from_json(raw)?;
    info!("Detected model architecture: {}", config.architecture);
    Ok(config)
}

/// Load every weight shard into host memory
pub fn load_weights(files: &ModelFiles) -> Result<HashMap<String, Tensor>> {
    let mut weights = HashMap::new();
    for path in &files.weights {
        debug!("Reading weights from {}", path.display());
        weights.extend(candle_core::safetensors::load(path, &Device::Cpu)?);
    }
    if weights.is_empty() {
        return Err(Error::model_loading("no weight tensors could be loaded"));
    }
    info!("Loaded {} weight tensors", weights.len());
    Ok(weights)
}

/// Reuse the embedding matrix as the output head when the checkpoint ties them
pub fn tie_output_embeddings(weights: &mut HashMap<String, Tensor>, config: &ModelConfig) {
    if !config.tie_word_embeddings || weights.contains_key("lm_head.weight") {
        return;
    }
    if let Some(embed) = weights.get("model.embed_tokens.weight").cloned() {
        debug!("Tying lm_head.weight to model.embed_tokens.weight");
        weights.insert("lm_head.weight".to_string(), embed);
    } else {
        warn!("tie_word_embeddings is set but model.embed_tokens.weight is missing");
    }
}

/// Convert and move every weight to its final dtype and device
pub fn place_weights(
    weights: HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    weights
        .into_iter()
        .map(|(name, tensor)| {
            let tensor = device::place(tensor.to_dtype(dtype)?, device)?;
            Ok((name, tensor))
        })
        .collect()
}

/// A loaded network with its KV cache
pub enum BaseModel {
    Phi3 {
        model: phi3::Model,
        device: Device,
    },
    Llama {
        model: llama::Llama,
        config: llama::Config,
        cache: llama::Cache,
        dtype: DType,
        device: Device,
    },
    Qwen2 {
        model: qwen2::ModelForCausalLM,
        device: Device,
    },
}

impl BaseModel {
    /// Build the network from placed weights
    pub fn build(
        config: &ModelConfig,
        weights: HashMap<String, Tensor>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(weights, dtype, device);

        match config.architecture {
            Architecture::Phi3 => {
                let cfg: phi3::Config = config.parse()?;
                let model = phi3::Model::new(&cfg, vb)?;
                Ok(BaseModel::Phi3 {
                    model,
                    device: device.clone(),
                })
            }
            Architecture::Llama => {
                let cfg: llama::LlamaConfig = config.parse()?;
                let cfg = cfg.into_config(false);
                let model = llama::Llama::load(vb, &cfg)?;
                let cache = llama::Cache::new(true, dtype, &cfg, device)?;
                Ok(BaseModel::Llama {
                    model,
                    config: cfg,
                    cache,
                    dtype,
                    device: device.clone(),
                })
            }
            Architecture::Qwen2 => {
                let cfg: qwen2::Config = config.parse()?;
                let model = qwen2::ModelForCausalLM::new(&cfg, vb)?;
                Ok(BaseModel::Qwen2 {
                    model,
                    device: device.clone(),
                })
            }
        }
    }
}

impl CausalLm for BaseModel {
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor> {
        let logits = match self {
            BaseModel::Phi3 { model, .. } => model.forward(input_ids, seqlen_offset)?,
            BaseModel::Llama { model, cache, .. } => model.forward(input_ids, seqlen_offset, cache)?,
            BaseModel::Qwen2 { model, .. } => model.forward(input_ids, seqlen_offset)?,
        };
        Ok(logits)
    }

    fn reset(&mut self) -> Result<()> {
        match self {
            BaseModel::Phi3 { model, .. } => model.clear_kv_cache(),
            BaseModel::Llama {
                config,
                cache,
                dtype,
                device,
                ..
            } => *cache = llama::Cache::new(true, *dtype, config, device)?,
            BaseModel::Qwen2 { model, .. } => model.clear_kv_cache(),
        }
        Ok(())
    }

    fn device(&self) -> &Device {
        match self {
            BaseModel::Phi3 { device, .. }
            | BaseModel::Llama { device, .. }
            | BaseModel::Qwen2 { device, .. } => device,
        }
    }
}
