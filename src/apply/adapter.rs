//! PEFT LoRA adapter reader
//!
//! Reads the directory layout written by the PEFT library: an
//! `adapter_config.json` next to an `adapter_model.safetensors` whose keys look
//! like `base_model.model.<module>.lora_A.weight`. Other tensors under the same
//! prefix (`modules_to_save` copies, trained biases) replace base weights whole.

use crate::error::{Error, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
const ADAPTER_PICKLE_FILE: &str = "adapter_model.bin";

const PEFT_PREFIX: &str = "base_model.model.";
const MODULES_TO_SAVE: &str = ".modules_to_save.";
const DORA_MAGNITUDE: &str = "lora_magnitude_vector";

/// Target modules are either an explicit list or a single pattern string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

impl Default for TargetModules {
    fn default() -> Self {
        TargetModules::List(Vec::new())
    }
}

/// Subset of the PEFT `adapter_config.json` needed to merge a LoRA adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeftConfig {
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    #[serde(default)]
    pub task_type: Option<String>,
    /// LoRA rank
    pub r: usize,
    /// LoRA alpha scaling factor
    pub lora_alpha: f64,
    #[serde(default)]
    pub lora_dropout: f64,
    #[serde(default)]
    pub target_modules: TargetModules,
    /// Base weights are stored transposed (GPT-2 style Conv1D)
    #[serde(default)]
    pub fan_in_fan_out: bool,
    /// Rank-stabilised scaling, `alpha / sqrt(r)`
    #[serde(default)]
    pub use_rslora: bool,
    /// Weight-decomposed LoRA; needs a magnitude rescale, not a plain merge
    #[serde(default)]
    pub use_dora: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub rank_pattern: HashMap<String, usize>,
    #[serde(default)]
    pub alpha_pattern: HashMap<String, f64>,
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

impl PeftConfig {
    /// Scaling applied to `B @ A` for the given module
    pub fn scale_for(&self, module: &str, rank: usize) -> f64 {
        let rank = lookup_pattern(&self.rank_pattern, module).unwrap_or(rank);
        let alpha = lookup_pattern(&self.alpha_pattern, module).unwrap_or(self.lora_alpha);
        if self.use_rslora {
            alpha / (rank as f64).sqrt()
        } else {
            alpha / rank as f64
        }
    }
}

fn lookup_pattern<T: Copy>(patterns: &HashMap<String, T>, module: &str) -> Option<T> {
    patterns
        .iter()
        .find(|(key, _)| module == key.as_str() || module.ends_with(&format!(".{}", key)))
        .map(|(_, value)| *value)
}

/// One adapted linear layer: `delta = scale * B @ A`
#[derive(Debug, Clone)]
pub struct LoraModule {
    /// Shape `(r, in_features)`
    pub a: Tensor,
    /// Shape `(out_features, r)`
    pub b: Tensor,
    pub scale: f64,
}

impl LoraModule {
    pub fn rank(&self) -> usize {
        self.a.dims().first().copied().unwrap_or(0)
    }
}

/// A parsed adapter, keyed by base-model module path (e.g.
/// `model.layers.0.self_attn.qkv_proj`)
#[derive(Debug)]
pub struct LoraAdapter {
    pub config: PeftConfig,
    pub modules: BTreeMap<String, LoraModule>,
    /// Full tensors keyed by base weight name, e.g. `lm_head.weight`
    pub replacements: BTreeMap<String, Tensor>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoraPart {
    A,
    B,
}

impl LoraAdapter {
    /// Load an adapter directory from disk
    pub async fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::AdapterNotFound(dir.to_path_buf()));
        }
        info!("Loading LoRA adapter from: {}", dir.display());

        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        let config_str = tokio::fs::read_to_string(&config_path).await.map_err(|e| {
            Error::InvalidAdapter(format!("failed to read {}: {}", config_path.display(), e))
        })?;
        let config: PeftConfig = serde_json::from_str(&config_str)?;

        if !config.peft_type.eq_ignore_ascii_case("lora") {
            return Err(Error::InvalidAdapter(format!(
                "unsupported PEFT type {}, only LORA adapters can be merged",
                config.peft_type
            )));
        }

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        if !weights_path.exists() {
            if dir.join(ADAPTER_PICKLE_FILE).exists() {
                return Err(Error::InvalidAdapter(format!(
                    "{} is a PyTorch pickle; convert it to {}",
                    ADAPTER_PICKLE_FILE, ADAPTER_WEIGHTS_FILE
                )));
            }
            return Err(Error::InvalidAdapter(format!(
                "{} not found in {}",
                ADAPTER_WEIGHTS_FILE,
                dir.display()
            )));
        }

        let tensors = candle_core::safetensors::load(&weights_path, &Device::Cpu)?;
        let mut adapter = Self::from_tensors(config, tensors)?;
        adapter.path = dir.to_path_buf();
        Ok(adapter)
    }

    /// Pair up `lora_A`/`lora_B` tensors into modules and collect whole-weight
    /// replacements
    pub fn from_tensors(config: PeftConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        if config.use_dora {
            return Err(Error::InvalidAdapter(
                "DoRA adapters (use_dora) cannot be merged as plain LoRA".to_string(),
            ));
        }

        let mut halves: BTreeMap<String, (Option<Tensor>, Option<Tensor>)> = BTreeMap::new();
        let mut replacements = BTreeMap::new();

        for (key, tensor) in tensors {
            if key.contains(DORA_MAGNITUDE) {
                return Err(Error::InvalidAdapter(format!(
                    "{} is a DoRA magnitude vector; DoRA adapters cannot be merged as plain LoRA",
                    key
                )));
            }
            match split_lora_key(&key) {
                Some((module, LoraPart::A)) => halves.entry(module).or_default().0 = Some(tensor),
                Some((module, LoraPart::B)) => halves.entry(module).or_default().1 = Some(tensor),
                None => match replacement_key(&key) {
                    Some(target) => {
                        debug!("Adapter tensor {} replaces {}", key, target);
                        replacements.insert(target, tensor);
                    }
                    None => {
                        return Err(Error::InvalidAdapter(format!(
                            "unsupported adapter tensor {}",
                            key
                        )))
                    }
                },
            }
        }

        let mut modules = BTreeMap::new();
        for (module, pair) in halves {
            let (a, b) = match pair {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(Error::InvalidAdapter(format!(
                        "module {} is missing its lora_A or lora_B half",
                        module
                    )))
                }
            };

            let (rank, _in_features) = a.dims2()?;
            let (_out_features, b_rank) = b.dims2()?;
            if rank != b_rank {
                return Err(Error::InvalidAdapter(format!(
                    "rank mismatch in {}: lora_A has {} rows, lora_B has {} columns",
                    module, rank, b_rank
                )));
            }
            if rank != config.r && !config.rank_pattern.is_empty() {
                debug!("Module {} uses rank {} (pattern override)", module, rank);
            } else if rank != config.r {
                warn!("Module {} has rank {} but adapter config says r={}", module, rank, config.r);
            }

            let scale = config.scale_for(&module, rank);
            modules.insert(module, LoraModule { a, b, scale });
        }

        if modules.is_empty() && replacements.is_empty() {
            return Err(Error::InvalidAdapter("adapter contains no LoRA weights".to_string()));
        }

        info!(
            "Parsed {} LoRA modules and {} replacement tensors (r={}, alpha={})",
            modules.len(),
            replacements.len(),
            config.r,
            config.lora_alpha
        );

        Ok(Self {
            config,
            modules,
            replacements,
            path: PathBuf::new(),
        })
    }
}

/// `base_model.model.model.layers.0.mlp.down_proj.lora_B.weight`
///   -> (`model.layers.0.mlp.down_proj`, B)
fn split_lora_key(key: &str) -> Option<(String, LoraPart)> {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);

    let (module, part, rest) = if let Some(idx) = key.find(".lora_A.") {
        (&key[..idx], LoraPart::A, &key[idx + ".lora_A.".len()..])
    } else if let Some(idx) = key.find(".lora_B.") {
        (&key[..idx], LoraPart::B, &key[idx + ".lora_B.".len()..])
    } else {
        return None;
    };

    // Named adapters are serialized as `lora_A.<name>.weight`
    if rest == "weight" || rest.ends_with(".weight") {
        Some((module.to_string(), part))
    } else {
        None
    }
}

/// `base_model.model.lm_head.modules_to_save.default.weight` -> `lm_head.weight`,
/// `base_model.model.model.layers.0.mlp.down_proj.bias` -> itself minus the prefix.
/// Unprefixed keys and leftover `lora_*` tensors (embedding LoRA) have no target.
fn replacement_key(key: &str) -> Option<String> {
    let key = key.strip_prefix(PEFT_PREFIX)?;
    if key.split('.').any(|part| part.starts_with("lora_")) {
        return None;
    }
    match key.find(MODULES_TO_SAVE) {
        Some(idx) => {
            let (_adapter_name, param) = key[idx + MODULES_TO_SAVE.len()..].split_once('.')?;
            Some(format!("{}.{}", &key[..idx], param))
        }
        None => Some(key.to_string()),
    }
}
