use crate::apply::WeightDType;
use crate::cli::error::{CliError, CliResult};
use crate::device::DevicePreference;
use crate::infer::GenerationParams;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

pub const DEFAULT_BASE_MODEL: &str = "microsoft/Phi-4-mini-reasoning";
pub const DEFAULT_ADAPTER_PATH: &str = "policy-mini-lora-optimized-20250715_180318_final";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelSettings,
    pub generation: GenerationParams,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// HuggingFace model id or local checkpoint directory
    pub base_model: String,
    pub adapter_path: PathBuf,
    pub device: DevicePreference,
    pub dtype: WeightDType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_model: DEFAULT_BASE_MODEL.to_string(),
            adapter_path: PathBuf::from(DEFAULT_ADAPTER_PATH),
            device: DevicePreference::Auto,
            dtype: WeightDType::F16,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Load the configuration file. A missing file at the default location
/// yields defaults; an explicitly named file must exist.
pub fn load_config(config_path: Option<&Path>) -> CliResult<Config> {
    let config_file = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(CliError::Config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            path.to_path_buf()
        }
        None => match get_default_config_path() {
            Ok(path) if path.exists() => path,
            _ => return Ok(Config::default()),
        },
    };

    let content = fs::read_to_string(&config_file)
        .map_err(|e| CliError::Config(format!("Failed to read config file: {}", e)))?;

    let config = parse_config(&config_file, &content)?;
    config.validate()?;
    Ok(config)
}

fn parse_config(path: &Path, content: &str) -> CliResult<Config> {
    let config = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(content)?,
        Some("toml") => toml::from_str(content)?,
        _ => serde_json::from_str(content)?,
    };
    Ok(config)
}

pub fn get_default_config_path() -> CliResult<PathBuf> {
    let proj_dirs = ProjectDirs::from("ai", "policy-llm", "policy-llm")
        .ok_or_else(|| CliError::Config("Failed to determine config directory".to_string()))?;

    Ok(proj_dirs.config_dir().join("config.yaml"))
}

impl Config {
    pub fn validate(&self) -> CliResult<()> {
        if self.model.base_model.trim().is_empty() {
            return Err(CliError::Config("base model must not be empty".to_string()));
        }
        self.generation
            .validate()
            .map_err(|e| CliError::InvalidArgument(e.to_string()))
    }
}
