//! Autoregressive token generation over a causal language model

use crate::error::{Error, Result};
use crate::infer::sampling::Sampler;
use crate::infer::tokenizer::PromptTokenizer;
use candle_core::{DType, Device, Tensor};
use tracing::{debug, warn};

/// A network that maps token ids to next-token logits, with an internal KV cache
pub trait CausalLm {
    /// Logits for the last position of `input_ids` (shape `(1, seq)`), where
    /// `seqlen_offset` tokens are already held in the cache
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor>;

    /// Drop cached keys and values before a new sequence
    fn reset(&mut self) -> Result<()>;

    /// Device the weights live on
    fn device(&self) -> &Device;
}

/// Reason for generation completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Eos,
    MaxLength,
}

/// Token-level result of a generation run
#[derive(Debug)]
pub struct TokenGeneration {
    /// Prompt ids followed by generated ids
    pub tokens: Vec<u32>,
    pub prompt_len: usize,
    pub finish_reason: FinishReason,
}

impl TokenGeneration {
    pub fn completion_len(&self) -> usize {
        self.tokens.len() - self.prompt_len
    }
}

/// Sample until an end-of-sequence token or until the sequence holds
/// `max_length` tokens, prompt included
pub fn generate_tokens(
    model: &mut dyn CausalLm,
    tokenizer: &PromptTokenizer,
    prompt_ids: &[u32],
    max_length: usize,
    sampler: &mut Sampler,
) -> Result<TokenGeneration> {
    if prompt_ids.is_empty() {
        return Err(Error::invalid_input("prompt encodes to no tokens"));
    }

    let mut tokens = prompt_ids.to_vec();
    let prompt_len = tokens.len();

    if prompt_len >= max_length {
        warn!(
            "Prompt is {} tokens, which already reaches max length {}; nothing generated",
            prompt_len, max_length
        );
        return Ok(TokenGeneration {
            tokens,
            prompt_len,
            finish_reason: FinishReason::MaxLength,
        });
    }

    model.reset()?;

    let mut offset = 0;
    let finish_reason = loop {
        let context = &tokens[offset..];
        let input = Tensor::new(context, model.device())?.unsqueeze(0)?;
        let logits = model.forward(&input, offset)?;
        let logits = last_position_logits(&logits)?;
        offset = tokens.len();

        let next = sampler.sample(&logits)?;
        tokens.push(next);

        if tokenizer.is_eos_token(next) {
            break FinishReason::Eos;
        }
        if tokens.len() >= max_length {
            break FinishReason::MaxLength;
        }
    };

    debug!(
        "Generated {} tokens ({:?})",
        tokens.len() - prompt_len,
        finish_reason
    );

    Ok(TokenGeneration {
        tokens,
        prompt_len,
        finish_reason,
    })
}

/// Flatten `(vocab)`, `(1, vocab)` or `(1, 1, vocab)` logits to the last row
fn last_position_logits(logits: &Tensor) -> Result<Vec<f32>> {
    let vocab = logits
        .dims()
        .last()
        .copied()
        .ok_or_else(|| Error::generation("model returned scalar logits"))?;
    let flat = logits.to_dtype(DType::F32)?.flatten_all()?;
    let total = flat.dim(0)?;
    Ok(flat.narrow(0, total - vocab, vocab)?.to_vec1::<f32>()?)
}

/// Remove the echoed prompt from the decoded sequence.
///
/// An exact prefix is removed as is; otherwise as many characters as the
/// prompt holds are dropped. Output shorter than the prompt yields an empty
/// string.
pub fn strip_prompt(decoded: &str, prompt: &str) -> String {
    if let Some(rest) = decoded.strip_prefix(prompt) {
        return rest.trim().to_string();
    }
    let prompt_chars = prompt.chars().count();
    if decoded.chars().count() <= prompt_chars {
        return String::new();
    }
    decoded.chars().skip(prompt_chars).collect::<String>().trim().to_string()
}
