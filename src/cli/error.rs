use colored::*;
use std::path::PathBuf;
use thiserror::Error;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Prompt file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Model(#[from] crate::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Print a user-friendly error message
    pub fn print_error(&self) {
        eprintln!("{} {}", "Error:".red().bold(), self);

        match self {
            CliError::FileNotFound(path) => {
                eprintln!(
                    "\n{} Make sure the file exists and the path is correct: {}",
                    "Hint:".yellow(),
                    path.display().to_string().cyan()
                );
            }
            CliError::InvalidArgument(_) => {
                eprintln!(
                    "\n{} Use {} for more information",
                    "Hint:".yellow(),
                    "policy-llm --help".cyan()
                );
            }
            CliError::Model(crate::Error::AdapterNotFound(_)) => {
                eprintln!(
                    "\n{} Pass {} a directory containing adapter_config.json and adapter_model.safetensors",
                    "Hint:".yellow(),
                    "--adapter-path".cyan()
                );
            }
            CliError::Model(crate::Error::ModelNotFound(_)) | CliError::Model(crate::Error::Hub(_)) => {
                eprintln!(
                    "\n{} Check the {} identifier; gated models need {} set",
                    "Hint:".yellow(),
                    "--base-model".cyan(),
                    "HF_TOKEN".cyan()
                );
            }
            CliError::Model(crate::Error::DeviceUnavailable(_)) => {
                eprintln!(
                    "\n{} Use {} or rebuild with the cuda or metal feature",
                    "Hint:".yellow(),
                    "--device cpu".cyan()
                );
            }
            _ => {}
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CliError {
    fn from(err: serde_yaml::Error) -> Self {
        CliError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for CliError {
    fn from(err: toml::de::Error) -> Self {
        CliError::Config(err.to_string())
    }
}
