use crate::apply::WeightDType;
use crate::cli::config::Config;
use crate::device::DevicePreference;
use clap::Parser;
use std::path::PathBuf;

/// Generate text with a LoRA fine-tuned policy model
#[derive(Parser, Debug)]
#[command(
    name = "policy-llm",
    version,
    about = "Generate text with a LoRA fine-tuned policy model",
    long_about = "Loads a base causal language model, merges a LoRA adapter into it and \
                  answers a single prompt (inline or from a file) or runs an interactive session."
)]
pub struct Cli {
    /// Input prompt
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// File containing the prompt
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Write the response to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Maximum total sequence length, prompt included [default: 512]
    #[arg(short, long)]
    pub max_length: Option<usize>,

    /// Sampling temperature, 0 for greedy decoding [default: 0.7]
    #[arg(short, long)]
    pub temperature: Option<f64>,

    /// Nucleus sampling threshold in (0, 1]
    #[arg(long)]
    pub top_p: Option<f64>,

    /// Random seed for reproducible sampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Interactive mode
    #[arg(short, long)]
    pub interactive: bool,

    /// Path to the LoRA adapter directory
    /// [default: policy-mini-lora-optimized-20250715_180318_final]
    #[arg(short, long)]
    pub adapter_path: Option<PathBuf>,

    /// Base model HuggingFace id or local directory
    /// [default: microsoft/Phi-4-mini-reasoning]
    #[arg(short, long)]
    pub base_model: Option<String>,

    /// Compute device
    #[arg(long, value_enum)]
    pub device: Option<DevicePreference>,

    /// Weight precision
    #[arg(long, value_enum)]
    pub dtype: Option<WeightDType>,

    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short, long, env = "POLICY_LLM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Set the verbosity level (can be repeated for more verbose output)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Silence all log output except errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Emit log lines as JSON
    #[arg(long)]
    pub json: bool,
}

/// Where the prompt comes from, in precedence order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    Interactive,
    Inline(String),
    File(PathBuf),
    None,
}

impl Cli {
    pub fn prompt_source(&self) -> PromptSource {
        if self.interactive {
            PromptSource::Interactive
        } else if let Some(prompt) = self.prompt.as_ref().filter(|p| !p.is_empty()) {
            PromptSource::Inline(prompt.clone())
        } else if let Some(file) = &self.file {
            PromptSource::File(file.clone())
        } else {
            PromptSource::None
        }
    }

    /// Overlay command-line values on the loaded configuration
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(base_model) = &self.base_model {
            config.model.base_model = base_model.clone();
        }
        if let Some(adapter_path) = &self.adapter_path {
            config.model.adapter_path = adapter_path.clone();
        }
        if let Some(device) = self.device {
            config.model.device = device;
        }
        if let Some(dtype) = self.dtype {
            config.model.dtype = dtype;
        }
        if let Some(max_length) = self.max_length {
            config.generation.max_length = max_length;
        }
        if let Some(temperature) = self.temperature {
            config.generation.temperature = temperature;
        }
        if self.top_p.is_some() {
            config.generation.top_p = self.top_p;
        }
        if self.seed.is_some() {
            config.generation.seed = self.seed;
        }
        if self.json {
            config.logging.json_format = true;
        }
    }
}
