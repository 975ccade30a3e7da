//! Tokenizer handle for prompt encoding and output decoding
//!
//! Wraps a HuggingFace `tokenizers::Tokenizer` and resolves the special tokens
//! generation depends on: the end-of-sequence token that terminates sampling
//! and the padding token that must fall back to it when the checkpoint does
//! not define one.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tokenizers::tokenizer::Tokenizer as HFTokenizer;
use tokenizers::PaddingParams;
use tracing::{debug, info, warn};

/// Common end-of-sequence spellings, checked when no config names one
const EOS_CANDIDATES: &[&str] = &[
    "<|endoftext|>",
    "<|end|>",
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "</s>",
];

/// Token names advertised by `tokenizer_config.json`
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SpecialTokenHints {
    #[serde(default, deserialize_with = "token_content")]
    pub eos_token: Option<String>,
    #[serde(default, deserialize_with = "token_content")]
    pub pad_token: Option<String>,
}

/// Tokens are stored either as a bare string or as an `AddedToken` object
fn token_content<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Token {
        Plain(String),
        Added { content: String },
    }

    Ok(Option::<Token>::deserialize(deserializer)?.map(|token| match token {
        Token::Plain(content) | Token::Added { content } => content,
    }))
}

impl SpecialTokenHints {
    /// Read hints from a `tokenizer_config.json` file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Tokenizer paired with a loaded model
pub struct PromptTokenizer {
    tokenizer: HFTokenizer,
    eos_token: Option<String>,
    eos_token_ids: Vec<u32>,
}

impl PromptTokenizer {
    /// Load `tokenizer.json` from disk
    pub fn from_file(path: &Path, name: &str, hints: &SpecialTokenHints) -> Result<Self> {
        let tokenizer = HFTokenizer::from_file(path).map_err(Error::tokenization)?;
        Self::new(tokenizer, name, hints)
    }

    /// Wrap an already constructed tokenizer
    pub fn new(tokenizer: HFTokenizer, name: &str, hints: &SpecialTokenHints) -> Result<Self> {
        let (eos_token, eos_id) = resolve_eos(&tokenizer, hints);
        let eos_token_ids: Vec<u32> = eos_id.into_iter().collect();

        if eos_token_ids.is_empty() {
            warn!("No end-of-sequence token found for tokenizer {}", name);
        }
        debug!("End-of-sequence token: {:?} {:?}", eos_token, eos_token_ids);

        let mut tokenizer = Self {
            tokenizer,
            eos_token,
            eos_token_ids,
        };

        if let Some(pad) = &hints.pad_token {
            tokenizer.set_pad_token(pad)?;
        }

        Ok(tokenizer)
    }

    /// Register extra end-of-sequence ids (e.g. from the model's config.json)
    pub fn add_eos_token_ids(&mut self, ids: impl IntoIterator<Item = u32>) {
        for id in ids {
            if !self.eos_token_ids.contains(&id) {
                self.eos_token_ids.push(id);
            }
        }
        if self.eos_token.is_none() {
            self.eos_token = self
                .eos_token_ids
                .first()
                .and_then(|&id| self.tokenizer.id_to_token(id));
        }
    }

    /// Fall back to the end-of-sequence token for padding when none is set.
    /// Returns `true` if the tokenizer was changed.
    pub fn ensure_pad_token(&mut self) -> Result<bool> {
        if self.tokenizer.get_padding().is_some() {
            return Ok(false);
        }
        let eos = self.eos_token.clone().ok_or_else(|| {
            Error::tokenization("tokenizer defines neither a padding nor an end-of-sequence token")
        })?;
        info!("Tokenizer has no padding token, using {}", eos);
        self.set_pad_token(&eos)?;
        Ok(true)
    }

    fn set_pad_token(&mut self, token: &str) -> Result<()> {
        let pad_id = self
            .tokenizer
            .token_to_id(token)
            .ok_or_else(|| Error::tokenization(format!("padding token {} is not in the vocabulary", token)))?;
        self.tokenizer.with_padding(Some(PaddingParams {
            pad_id,
            pad_token: token.to_string(),
            ..PaddingParams::default()
        }));
        Ok(())
    }

    /// Encode text to token ids, adding the model's special tokens
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::tokenization(format!("Tokenization failed: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token ids back to text
    pub fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(token_ids, skip_special_tokens)
            .map_err(|e| Error::tokenization(format!("Decoding failed: {}", e)))
    }

    pub fn is_eos_token(&self, token_id: u32) -> bool {
        self.eos_token_ids.contains(&token_id)
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_ids.first().copied()
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.tokenizer.get_padding().map(|p| p.pad_id)
    }
}

fn resolve_eos(tokenizer: &HFTokenizer, hints: &SpecialTokenHints) -> (Option<String>, Option<u32>) {
    if let Some(eos) = &hints.eos_token {
        if let Some(id) = tokenizer.token_to_id(eos) {
            return (Some(eos.clone()), Some(id));
        }
        warn!("Configured eos token {} is not in the vocabulary", eos);
    }

    EOS_CANDIDATES
        .iter()
        .find_map(|&candidate| {
            tokenizer
                .token_to_id(candidate)
                .map(|id| (Some(candidate.to_string()), Some(id)))
        })
        .unwrap_or((None, None))
}
