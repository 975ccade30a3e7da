//! Error types for model loading and generation

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for policy-llm operations
#[derive(Error, Debug)]
pub enum Error {
    /// Adapter directory could not be found
    #[error("Adapter directory not found: {0}")]
    AdapterNotFound(PathBuf),

    /// Adapter files are present but unusable
    #[error("Invalid adapter: {0}")]
    InvalidAdapter(String),

    /// Base model identifier could not be resolved locally or on the Hub
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Architecture named in config.json has no loader
    #[error("Unsupported architecture: {0}. Supported architectures: phi3, llama, qwen2")]
    UnsupportedArchitecture(String),

    /// Model loading error
    #[error("Model loading error: {0}")]
    ModelLoading(String),

    /// Adapter weights could not be merged into the base weights
    #[error("LoRA merge error: {0}")]
    Merge(String),

    /// Tokenizer failure
    #[error("Tokenization error: {0}")]
    Tokenization(String),

    /// Generation failure
    #[error("Generation error: {0}")]
    Generation(String),

    /// Requested device is not usable on this machine
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Hugging Face Hub error
    #[error("Hub error: {0}")]
    Hub(#[from] hf_hub::api::tokio::ApiError),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for policy-llm operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a model loading error
    pub fn model_loading(msg: impl Into<String>) -> Self {
        Self::ModelLoading(msg.into())
    }

    /// Create a tokenization error
    pub fn tokenization(msg: impl std::fmt::Display) -> Self {
        Self::Tokenization(msg.to_string())
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
