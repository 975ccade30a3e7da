//! Text generation with an adapted model
//!
//! [`InferenceEngine`] owns the merged model and its tokenizer for the life of
//! the process and turns prompts into decoded continuations.

pub mod generator;
pub mod sampling;
pub mod tokenizer;

use crate::apply::LoadedModel;
use crate::error::{Error, Result};
use generator::{CausalLm, FinishReason};
use sampling::Sampler;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokenizer::PromptTokenizer;
use tracing::info;

pub const DEFAULT_MAX_LENGTH: usize = 512;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Sampling settings shared by every request in a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Upper bound on the total sequence length, prompt included
    pub max_length: usize,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            temperature: DEFAULT_TEMPERATURE,
            top_p: None,
            seed: None,
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_length == 0 {
            return Err(Error::invalid_input("max length must be at least 1"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::invalid_input(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(Error::invalid_input(format!(
                    "top-p must be in (0, 1], got {}",
                    top_p
                )));
            }
        }
        Ok(())
    }

    pub fn request(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.into(),
            max_length: self.max_length,
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
        }
    }
}

/// Generation request parameters
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_length: usize,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// Request with the default max length and temperature
    pub fn new(prompt: impl Into<String>) -> Self {
        GenerationParams::default().request(prompt)
    }
}

/// Generation response
#[derive(Debug)]
pub struct GenerationResponse {
    /// Decoded continuation with the prompt removed and whitespace trimmed
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

/// Token usage statistics
#[derive(Debug, Clone, Copy)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Inference engine for running generation with an adapted model
pub struct InferenceEngine {
    model: Box<dyn CausalLm>,
    tokenizer: PromptTokenizer,
}

impl InferenceEngine {
    pub fn new(model: Box<dyn CausalLm>, tokenizer: PromptTokenizer) -> Self {
        Self { model, tokenizer }
    }

    /// Generate a continuation for one prompt
    pub fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let start = Instant::now();

        let prompt_ids = self.tokenizer.encode(&request.prompt)?;
        let mut sampler = Sampler::new(request.temperature, request.top_p, request.seed);

        let generation = generator::generate_tokens(
            self.model.as_mut(),
            &self.tokenizer,
            &prompt_ids,
            request.max_length,
            &mut sampler,
        )?;

        let decoded = self.tokenizer.decode(&generation.tokens, true)?;
        let text = generator::strip_prompt(&decoded, &request.prompt);

        let elapsed = start.elapsed().as_secs_f64();
        let completion_tokens = generation.completion_len();
        info!(
            "Generated {} tokens in {:.2}s ({:.1} tokens/sec)",
            completion_tokens,
            elapsed,
            completion_tokens as f64 / elapsed.max(f64::EPSILON)
        );

        Ok(GenerationResponse {
            text,
            finish_reason: generation.finish_reason,
            usage: TokenUsage {
                prompt_tokens: generation.prompt_len,
                completion_tokens,
            },
        })
    }
}

impl From<LoadedModel> for InferenceEngine {
    fn from(loaded: LoadedModel) -> Self {
        Self::new(Box::new(loaded.model), loaded.tokenizer)
    }
}
