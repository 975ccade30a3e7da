//! LoRA adapter application
//!
//! Loads a base causal language model, merges a PEFT LoRA adapter into its
//! weights and places the result on the selected device.

pub mod adapter;
pub mod loader;
pub mod merger;

use crate::device::{self, DeviceKind, DeviceResolver};
use crate::error::{Error, Result};
use crate::infer::tokenizer::{PromptTokenizer, SpecialTokenHints};
use adapter::LoraAdapter;
use candle_core::DType;
use loader::{Architecture, BaseModel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Precision the merged weights are stored in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WeightDType {
    #[default]
    F16,
    Bf16,
    F32,
}

impl WeightDType {
    pub fn to_dtype(self) -> DType {
        match self {
            WeightDType::F16 => DType::F16,
            WeightDType::Bf16 => DType::BF16,
            WeightDType::F32 => DType::F32,
        }
    }
}

/// Model and tokenizer ready for generation
pub struct LoadedModel {
    pub model: BaseModel,
    pub tokenizer: PromptTokenizer,
    pub architecture: Architecture,
    pub device: DeviceKind,
}

type StageCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Loads a base model with a LoRA adapter merged in
pub struct ModelLoader {
    resolver: Box<dyn DeviceResolver>,
    dtype: WeightDType,
    on_stage: Option<StageCallback>,
}

impl ModelLoader {
    pub fn new(resolver: Box<dyn DeviceResolver>, dtype: WeightDType) -> Self {
        Self {
            resolver,
            dtype,
            on_stage: None,
        }
    }

    /// Report each loading stage, e.g. to a progress spinner
    pub fn with_progress(mut self, on_stage: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stage = Some(Box::new(on_stage));
        self
    }

    fn stage(&self, message: &str) {
        info!("{}", message);
        if let Some(on_stage) = &self.on_stage {
            on_stage(message);
        }
    }

    /// Load `base_model` (Hub id or local directory) and merge the adapter at
    /// `adapter_path` into it
    pub async fn load(&self, base_model: &str, adapter_path: &Path) -> Result<LoadedModel> {
        // Checked before any download so a typo fails fast
        let adapter_dir = resolve_adapter_path(adapter_path)?;
        let adapter = LoraAdapter::load(&adapter_dir).await?;
        if let Some(expected) = &adapter.config.base_model_name_or_path {
            if expected != base_model {
                warn!(
                    "Adapter was trained on {}, applying it to {}",
                    expected, base_model
                );
            }
        }

        self.stage("Loading base model...");
        let files = loader::resolve_model_files(base_model).await?;
        let mut config = loader::load_model_config(&files).await?;

        let hints = match &files.tokenizer_config {
            Some(path) => SpecialTokenHints::from_file(path)?,
            None => SpecialTokenHints::default(),
        };
        let mut tokenizer = PromptTokenizer::from_file(&files.tokenizer, base_model, &hints)?;
        tokenizer.add_eos_token_ids(config.eos_token_ids.iter().copied());
        tokenizer.ensure_pad_token()?;

        let mut weights = loader::load_weights(&files)?;
        loader::tie_output_embeddings(&mut weights, &config);

        self.stage("Loading LoRA adapters...");
        merger::merge_lora_weights(&mut weights, &adapter)?;
        // A saved lm_head diverges from the embeddings it was tied to
        if config.tie_word_embeddings && adapter.replacements.contains_key("lm_head.weight") {
            debug!("Adapter replaces lm_head, untying it from the embeddings");
            config.untie_word_embeddings();
        }
        drop(adapter);

        let device = device::select_device(self.resolver.as_ref())?;
        let kind = DeviceKind::of(&device);
        let dtype = self.dtype.to_dtype();
        self.stage(&format!("Placing weights on {} as {:?}...", kind, dtype));
        let weights = loader::place_weights(weights, dtype, &device)?;

        let model = BaseModel::build(&config, weights, dtype, &device)?;
        info!("Model ready: {} on {}", config.architecture, kind);

        Ok(LoadedModel {
            model,
            tokenizer,
            architecture: config.architecture,
            device: kind,
        })
    }
}

/// Find the adapter directory, trying the executable's directory for
/// relative paths that do not exist under the working directory
pub fn resolve_adapter_path(path: &Path) -> Result<PathBuf> {
    if path.is_dir() {
        return Ok(path.to_path_buf());
    }
    if path.is_relative() {
        let beside_exe = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(path)));
        if let Some(candidate) = beside_exe.filter(|p| p.is_dir()) {
            info!("Using adapter next to executable: {}", candidate.display());
            return Ok(candidate);
        }
    }
    Err(Error::AdapterNotFound(path.to_path_buf()))
}
