//! Tokenizer wrapper for HuggingFace tokenizers
//!
//! Adds fixed-length encoding (truncate, then right-pad) and pad token
//! resolution for causal LM vocabularies, which usually ship without a
//! dedicated pad token.

use anyhow::{Context, Result};
use std::path::Path;
use tokenizers::{
    PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams,
};

use crate::training::hub::{ModelLoader, ModelPath};

/// EOS spellings tried when no tokenizer_config.json is available
const EOS_CANDIDATES: [&str; 3] = ["</s>", "<|endoftext|>", "<eos>"];

/// Wrapper around HuggingFace tokenizer
#[derive(Clone)]
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    eos_token: Option<(String, u32)>,
    pad_token: Option<(String, u32)>,
}

impl TokenizerWrapper {
    /// Load tokenizer from a file path
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        Ok(Self::from_tokenizer(tokenizer, None, None))
    }

    /// Load tokenizer and its special-token config
    pub fn from_files(
        tokenizer_file: impl AsRef<Path>,
        tokenizer_config_file: Option<&Path>,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_file.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let (eos, pad) = match tokenizer_config_file {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {:?}", path))?;
                let config: serde_json::Value = serde_json::from_str(&content)
                    .context("Failed to parse tokenizer_config.json")?;
                (
                    special_token(&config["eos_token"]),
                    special_token(&config["pad_token"]),
                )
            }
            None => (None, None),
        };

        Ok(Self::from_tokenizer(tokenizer, eos, pad))
    }

    /// Load tokenizer from a ModelPath
    pub fn from_model_path(model_path: &ModelPath) -> Result<Self> {
        let tokenizer_path = model_path
            .tokenizer_file
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Tokenizer file not found in model path"))?;

        Self::from_files(tokenizer_path, model_path.tokenizer_config_file.as_deref())
    }

    /// Load tokenizer from HuggingFace Hub or local path
    pub fn from_pretrained(model_id_or_path: &str, loader: &ModelLoader) -> Result<Self> {
        let model_path = loader.load_model_path(model_id_or_path)?;
        Self::from_model_path(&model_path)
    }

    fn from_tokenizer(
        tokenizer: Tokenizer,
        eos_name: Option<String>,
        pad_name: Option<String>,
    ) -> Self {
        let lookup = |name: &str| tokenizer.token_to_id(name).map(|id| (name.to_string(), id));

        let eos_token = eos_name
            .as_deref()
            .and_then(lookup)
            .or_else(|| EOS_CANDIDATES.iter().find_map(|name| lookup(name)));

        let pad_token = pad_name.as_deref().and_then(lookup);
        if pad_token.is_none() {
            if let Some((name, _)) = &eos_token {
                tracing::debug!("No pad token defined, padding with EOS {:?}", name);
            }
        }

        Self {
            tokenizer,
            eos_token,
            pad_token,
        }
    }

    /// EOS token id, if the vocabulary defines one
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token.as_ref().map(|(_, id)| *id)
    }

    /// Pad token: the dedicated pad token, or EOS when there is none
    pub fn pad_token(&self) -> Option<(&str, u32)> {
        self.pad_token
            .as_ref()
            .or(self.eos_token.as_ref())
            .map(|(name, id)| (name.as_str(), *id))
    }

    /// Pad token id
    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token().map(|(_, id)| id)
    }

    /// Encode a single text without padding or truncation
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<EncodedInput> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        Ok(EncodedInput {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }

    /// Encode texts to exactly `max_length` tokens each
    ///
    /// Longer texts are truncated, shorter ones right-padded with the pad
    /// token and a zero attention mask.
    pub fn encode_fixed(&self, texts: &[String], max_length: usize) -> Result<Vec<EncodedInput>> {
        let (pad_token, pad_id) = self
            .pad_token()
            .ok_or_else(|| anyhow::anyhow!("Tokenizer defines neither a pad nor an EOS token"))?;

        let mut tokenizer = self.tokenizer.clone();
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(max_length),
            direction: PaddingDirection::Right,
            pad_to_multiple_of: None,
            pad_id,
            pad_type_id: 0,
            pad_token: pad_token.to_string(),
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Failed to set truncation: {}", e))?;

        let encodings = tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("Batch tokenization failed: {}", e))?;

        Ok(encodings
            .iter()
            .map(|encoding| EncodedInput {
                input_ids: encoding.get_ids().to_vec(),
                attention_mask: encoding.get_attention_mask().to_vec(),
            })
            .collect())
    }

    /// Decode token IDs back to text
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Decoding failed: {}", e))
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

/// Special token name from a tokenizer_config.json entry
///
/// Entries are either a plain string or an `AddedToken` object with a
/// `content` field; `null` means undefined.
fn special_token(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(obj) => obj
            .get("content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// Encoded input for a single text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedInput {
    /// Token IDs
    pub input_ids: Vec<u32>,
    /// Attention mask (1 for real tokens, 0 for padding)
    pub attention_mask: Vec<u32>,
}

impl EncodedInput {
    /// Get sequence length
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}
