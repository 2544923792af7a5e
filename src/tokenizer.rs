//! Model-specific token counting.
//!
//! Chunk budgets are expressed in tokens, so the chunker needs the same
//! tokenizer the target model uses. This wraps `tiktoken-rs`, falling back
//! to `cl100k_base` for model names the library does not know yet.

use crate::error::{GraphextError, Result};

/// Tokenizer for a specific completion model.
pub struct Tokenizer {
    bpe: tiktoken_rs::CoreBPE,
    model: String,
}

impl Tokenizer {
    /// Create a tokenizer for the given model.
    ///
    /// Unknown model names fall back to the `cl100k_base` encoding rather
    /// than failing, since newer chat models share it.
    pub fn for_model(model: &str) -> Result<Self> {
        let bpe = match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => bpe,
            Err(_) => tiktoken_rs::cl100k_base().map_err(|e| GraphextError::Tokenizer {
                model: model.to_string(),
                reason: e.to_string(),
            })?,
        };

        Ok(Self {
            bpe,
            model: model.to_string(),
        })
    }

    /// Count the tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Encode `text` into token ids.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        self.bpe
            .encode_ordinary(text)
            .into_iter()
            .map(|t| t as usize)
            .collect()
    }

    /// Decode token ids back into text.
    ///
    /// Ids produced by [`Tokenizer::encode`] always decode; ids sliced at
    /// arbitrary boundaries may land mid-codepoint, in which case the
    /// undecodable remainder is dropped.
    pub fn decode(&self, tokens: &[usize]) -> String {
        self.bpe.decode(tokens.to_vec()).unwrap_or_default()
    }

    /// The model this tokenizer was built for.
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Quick token estimate without full tokenization, ~3.7 chars per token.
///
/// Useful as a cheap pre-check before paying for a real encode.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f32 / 3.7).ceil() as usize
}
