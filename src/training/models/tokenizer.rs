//! Tokenizer wrapper for HuggingFace tokenizers
//!
//! Adds the pieces a language-model tokenizer needs on top of
//! `tokenizers::Tokenizer`: special tokens read from `tokenizer_config.json`,
//! a padding side, optional EOS appending, and a pad token fallback.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokenizers::{AddedToken, Tokenizer};

use crate::training::hub::ModelPath;
use crate::training::registry::PaddingSide;

/// Padding token used by some GPT-NeoX derived vocabularies
pub const PADDING_TOKEN: &str = "<|padding|>";

/// Special tokens declared in `tokenizer_config.json`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SpecialTokens {
    #[serde(default, deserialize_with = "deserialize_token")]
    pub pad_token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_token")]
    pub unk_token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_token")]
    pub eos_token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_token")]
    pub bos_token: Option<String>,
}

/// Tokens appear either as plain strings or as `{"content": ...}` objects
fn deserialize_token<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TokenSpec {
        Text(String),
        Added { content: String },
    }

    Ok(Option::<TokenSpec>::deserialize(d)?.map(|spec| match spec {
        TokenSpec::Text(content) | TokenSpec::Added { content } => content,
    }))
}

impl SpecialTokens {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read tokenizer config: {:?}", path.as_ref()))?;
        serde_json::from_str(&content).context("Failed to parse tokenizer_config.json")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenizerOptions {
    /// Append the EOS token when encoding
    pub add_eos_token: bool,
    /// Treat the first word like any other (byte-level tokenizers only)
    pub add_prefix_space: bool,
}

/// Where the pad token came from after [`LmTokenizer::ensure_pad_token`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadTokenSource {
    Existing,
    PaddingToken,
    Unk,
    Eos,
}

/// Language-model tokenizer
pub struct LmTokenizer {
    tokenizer: Tokenizer,
    special: SpecialTokens,
    pad_token_id: Option<u32>,
    padding_side: PaddingSide,
    add_eos_token: bool,
    name_or_path: String,
}

impl std::fmt::Debug for LmTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmTokenizer")
            .field("name_or_path", &self.name_or_path)
            .field("vocab_size", &self.len())
            .field("pad_token_id", &self.pad_token_id)
            .field("padding_side", &self.padding_side)
            .field("add_eos_token", &self.add_eos_token)
            .finish()
    }
}

impl LmTokenizer {
    /// Load `tokenizer.json` and, when present, `tokenizer_config.json`
    pub fn from_model_path(model_path: &ModelPath, options: &TokenizerOptions) -> Result<Self> {
        let tokenizer_path = model_path
            .tokenizer_file
            .as_ref()
            .ok_or_else(|| anyhow!("tokenizer.json not found for {}", model_path.model_id))?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        if options.add_prefix_space {
            tokenizer = with_prefix_space(&tokenizer)?;
        }

        let special = match &model_path.tokenizer_config_file {
            Some(path) => SpecialTokens::from_file(path)?,
            None => SpecialTokens::default(),
        };

        Ok(Self::new(tokenizer, special, options, &model_path.model_id))
    }

    pub fn new(
        tokenizer: Tokenizer,
        special: SpecialTokens,
        options: &TokenizerOptions,
        name_or_path: &str,
    ) -> Self {
        let pad_token_id = special.pad_token.as_deref().and_then(|t| tokenizer.token_to_id(t));
        if let (Some(pad), None) = (&special.pad_token, pad_token_id) {
            tracing::warn!("Pad token {:?} is not in the vocabulary, ignoring it", pad);
        }

        Self {
            tokenizer,
            special,
            pad_token_id,
            padding_side: PaddingSide::Right,
            add_eos_token: options.add_eos_token,
            name_or_path: name_or_path.to_string(),
        }
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn name_or_path(&self) -> &str {
        &self.name_or_path
    }

    /// Vocabulary size including added tokens
    pub fn len(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_vocab(&self) -> HashMap<String, u32> {
        self.tokenizer.get_vocab(true)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    pub fn set_pad_token_id(&mut self, id: Option<u32>) {
        self.pad_token_id = id;
    }

    pub fn unk_token_id(&self) -> Option<u32> {
        self.special.unk_token.as_deref().and_then(|t| self.token_to_id(t))
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.special.eos_token.as_deref().and_then(|t| self.token_to_id(t))
    }

    pub fn padding_side(&self) -> PaddingSide {
        self.padding_side
    }

    pub fn set_padding_side(&mut self, side: PaddingSide) {
        self.padding_side = side;
    }

    /// Token strings for `text`, without special tokens
    pub fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_tokens().to_vec())
    }

    /// Token ids for `text` with special tokens (and EOS when configured)
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
        let mut ids = encoding.get_ids().to_vec();

        if self.add_eos_token {
            if let Some(eos) = self.eos_token_id() {
                if ids.last() != Some(&eos) {
                    ids.push(eos);
                }
            }
        }
        Ok(ids)
    }

    /// Encode and pad to the longest sequence on the configured side
    pub fn encode_batch(&self, texts: &[String]) -> Result<BatchEncodedInput> {
        let pad_id = self
            .pad_token_id
            .ok_or_else(|| anyhow!("Tokenizer {} has no pad token", self.name_or_path))?;

        let encoded = texts
            .iter()
            .map(|text| self.encode(text))
            .collect::<Result<Vec<_>>>()?;

        let batch_size = encoded.len();
        let seq_len = encoded.iter().map(Vec::len).max().unwrap_or(0);

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);

        for ids in &encoded {
            let padding = seq_len - ids.len();
            let pad = std::iter::repeat(pad_id).take(padding);
            let zeros = std::iter::repeat(0u32).take(padding);
            let ones = std::iter::repeat(1u32).take(ids.len());
            match self.padding_side {
                PaddingSide::Left => {
                    input_ids.extend(pad.chain(ids.iter().copied()));
                    attention_mask.extend(zeros.chain(ones));
                }
                PaddingSide::Right => {
                    input_ids.extend(ids.iter().copied().chain(pad));
                    attention_mask.extend(ones.chain(zeros));
                }
            }
        }

        Ok(BatchEncodedInput {
            input_ids,
            attention_mask,
            batch_size,
            seq_len,
        })
    }

    /// Decode token IDs back to text
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow!("Decoding failed: {}", e))
    }

    /// Add regular tokens, returning how many were new
    pub fn add_tokens(&mut self, tokens: &[String]) -> usize {
        let added: Vec<AddedToken> = tokens
            .iter()
            .map(|t| AddedToken::from(t.clone(), false))
            .collect();
        self.tokenizer.add_tokens(&added)
    }

    /// Register `token` as a special token and use it for padding
    pub fn add_special_pad_token(&mut self, token: &str) -> Result<u32> {
        self.tokenizer
            .add_special_tokens(&[AddedToken::from(token.to_string(), true)]);
        let id = self
            .token_to_id(token)
            .ok_or_else(|| anyhow!("Failed to register pad token {:?}", token))?;
        self.special.pad_token = Some(token.to_string());
        self.pad_token_id = Some(id);
        Ok(id)
    }

    /// Make sure `<` survives tokenization, unless labels become tokens
    ///
    /// Labels are wrapped in angle-bracket tags; a tokenizer that folds `<`
    /// into another piece cannot reproduce them.
    pub fn check_angle_bracket(&self, add_labels_as_tokens: bool) -> Result<()> {
        let tokens = self.tokenize("<")?;
        let first = tokens.first().map(String::as_str).unwrap_or("");
        if !first.contains('<') && !add_labels_as_tokens {
            anyhow::bail!(
                "Current tokenizer {} does not tokenize < correctly. '<' is tokenized as '{}'. \
                 HTML tags will not be tokenized correctly. If you want to use the current \
                 model please use the --add_labels_as_tokens flag.",
                self.name_or_path,
                first
            );
        }
        Ok(())
    }

    /// Pick a pad token when the tokenizer has none
    ///
    /// Order: the existing pad token, `<|padding|>` from the vocabulary, the
    /// UNK token, then the EOS token.
    pub fn ensure_pad_token(&mut self) -> Result<PadTokenSource> {
        if self.pad_token_id.is_some() {
            return Ok(PadTokenSource::Existing);
        }

        if self.token_to_id(PADDING_TOKEN).is_some() {
            self.add_special_pad_token(PADDING_TOKEN)?;
            return Ok(PadTokenSource::PaddingToken);
        }

        if let Some(unk) = self.unk_token_id() {
            tracing::warn!("Model does not have a pad token, we will use the unk token as pad token.");
            self.pad_token_id = Some(unk);
            return Ok(PadTokenSource::Unk);
        }

        if let Some(eos) = self.eos_token_id() {
            tracing::warn!("Model does not have a pad token. We will use the eos token as pad token.");
            self.pad_token_id = Some(eos);
            return Ok(PadTokenSource::Eos);
        }

        anyhow::bail!(
            "Tokenizer {} has no pad, unk or eos token to pad with",
            self.name_or_path
        )
    }
}

/// Rebuild the tokenizer with `add_prefix_space` set on its byte-level stages
fn with_prefix_space(tokenizer: &Tokenizer) -> Result<Tokenizer> {
    let json = tokenizer
        .to_string(false)
        .map_err(|e| anyhow!("Failed to serialize tokenizer: {}", e))?;
    let mut value: serde_json::Value = serde_json::from_str(&json)?;

    let mut patched = 0;
    if let Some(pre_tokenizer) = value.get_mut("pre_tokenizer") {
        patched += set_prefix_space(pre_tokenizer);
    }
    if patched == 0 {
        tracing::debug!("Tokenizer has no byte-level pre-tokenizer, add_prefix_space has no effect");
        return Ok(tokenizer.clone());
    }

    Tokenizer::from_str(&value.to_string())
        .map_err(|e| anyhow!("Failed to rebuild tokenizer with prefix space: {}", e))
}

fn set_prefix_space(node: &mut serde_json::Value) -> usize {
    if node.get("type").and_then(|t| t.as_str()) == Some("ByteLevel") {
        node["add_prefix_space"] = serde_json::Value::Bool(true);
        return 1;
    }
    match node.get_mut("pretokenizers").and_then(|p| p.as_array_mut()) {
        Some(children) => children.iter_mut().map(set_prefix_space).sum(),
        None => 0,
    }
}

/// Batch encoded input
#[derive(Debug, Clone)]
pub struct BatchEncodedInput {
    /// Flattened token IDs [batch_size * seq_len]
    pub input_ids: Vec<u32>,
    /// Flattened attention mask
    pub attention_mask: Vec<u32>,
    /// Batch size
    pub batch_size: usize,
    /// Sequence length (after padding)
    pub seq_len: usize,
}

impl BatchEncodedInput {
    /// Convert to tensors [batch_size, seq_len]
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let input_ids = Tensor::new(&self.input_ids[..], device)?
            .reshape((self.batch_size, self.seq_len))?;

        let attention_mask = Tensor::new(&self.attention_mask[..], device)?
            .to_dtype(DType::F32)?
            .reshape((self.batch_size, self.seq_len))?;

        Ok((input_ids, attention_mask))
    }
}
