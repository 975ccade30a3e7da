//! policy-llm: run a LoRA fine-tuned causal language model
//!
//! Loads a base model from the HuggingFace Hub or a local checkpoint, merges a
//! PEFT LoRA adapter into its weights, and generates text for single prompts
//! or an interactive session.

pub mod apply;
pub mod cli;
pub mod device;
pub mod error;
pub mod infer;
pub mod session;

pub use apply::{LoadedModel, ModelLoader, WeightDType};
pub use device::{DeviceKind, DevicePreference, DeviceResolver};
pub use error::{Error, Result};
pub use infer::generator::{CausalLm, FinishReason};
pub use infer::tokenizer::PromptTokenizer;
pub use infer::{GenerationParams, GenerationRequest, GenerationResponse, InferenceEngine};
