//! Model-type lookup tables
//!
//! A model's `config.json` carries a `model_type` string. The tables below map
//! it to the task head the loader builds: encoder-decoder models are loaded
//! for sequence-to-sequence generation, decoder-only models for causal
//! generation. Encoder-decoder is checked first since several types appear in
//! both tables.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Encoder-decoder model types and their generation class names
pub const SEQ2SEQ_MODEL_TYPES: &[(&str, &str)] = &[
    ("bart", "BartForConditionalGeneration"),
    ("bigbird_pegasus", "BigBirdPegasusForConditionalGeneration"),
    ("blenderbot", "BlenderbotForConditionalGeneration"),
    ("blenderbot-small", "BlenderbotSmallForConditionalGeneration"),
    ("encoder-decoder", "EncoderDecoderModel"),
    ("fsmt", "FSMTForConditionalGeneration"),
    ("led", "LEDForConditionalGeneration"),
    ("longt5", "LongT5ForConditionalGeneration"),
    ("m2m_100", "M2M100ForConditionalGeneration"),
    ("marian", "MarianMTModel"),
    ("mbart", "MBartForConditionalGeneration"),
    ("mt5", "MT5ForConditionalGeneration"),
    ("mvp", "MvpForConditionalGeneration"),
    ("nllb-moe", "NllbMoeForConditionalGeneration"),
    ("pegasus", "PegasusForConditionalGeneration"),
    ("pegasus_x", "PegasusXForConditionalGeneration"),
    ("plbart", "PLBartForConditionalGeneration"),
    ("prophetnet", "ProphetNetForConditionalGeneration"),
    ("switch_transformers", "SwitchTransformersForConditionalGeneration"),
    ("t5", "T5ForConditionalGeneration"),
    ("umt5", "UMT5ForConditionalGeneration"),
    ("xlm-prophetnet", "XLMProphetNetForConditionalGeneration"),
];

/// Decoder-only model types and their causal-LM class names
pub const CAUSAL_MODEL_TYPES: &[(&str, &str)] = &[
    ("bart", "BartForCausalLM"),
    ("bloom", "BloomForCausalLM"),
    ("code_llama", "LlamaForCausalLM"),
    ("codegen", "CodeGenForCausalLM"),
    ("cohere", "CohereForCausalLM"),
    ("falcon", "FalconForCausalLM"),
    ("gemma", "GemmaForCausalLM"),
    ("gemma2", "Gemma2ForCausalLM"),
    ("gpt2", "GPT2LMHeadModel"),
    ("gpt_bigcode", "GPTBigCodeForCausalLM"),
    ("gpt_neo", "GPTNeoForCausalLM"),
    ("gpt_neox", "GPTNeoXForCausalLM"),
    ("gptj", "GPTJForCausalLM"),
    ("llama", "LlamaForCausalLM"),
    ("mamba", "MambaForCausalLM"),
    ("marian", "MarianForCausalLM"),
    ("mbart", "MBartForCausalLM"),
    ("mistral", "MistralForCausalLM"),
    ("mixtral", "MixtralForCausalLM"),
    ("olmo", "OlmoForCausalLM"),
    ("open-llama", "OpenLlamaForCausalLM"),
    ("openai-gpt", "OpenAIGPTLMHeadModel"),
    ("opt", "OPTForCausalLM"),
    ("pegasus", "PegasusForCausalLM"),
    ("persimmon", "PersimmonForCausalLM"),
    ("phi", "PhiForCausalLM"),
    ("phi3", "Phi3ForCausalLM"),
    ("qwen2", "Qwen2ForCausalLM"),
    ("qwen2_moe", "Qwen2MoeForCausalLM"),
    ("stablelm", "StableLmForCausalLM"),
    ("starcoder2", "Starcoder2ForCausalLM"),
    ("xglm", "XGLMForCausalLM"),
    // Ship their own modelling code
    ("mpt", "MPTForCausalLM"),
    ("RefinedWebModel", "RWForCausalLM"),
    ("RefinedWeb", "RWForCausalLM"),
];

/// Model types whose tokenizer needs a leading space before the first word
const PREFIX_SPACE_MODEL_TYPES: &[&str] = &["bloom", "gpt2", "roberta"];

/// Model types whose projections are `Conv1D` modules, stored `(in, out)`
const CONV1D_MODEL_TYPES: &[&str] = &["gpt2", "openai-gpt"];

/// Which generation head the model is loaded with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Decoder-only, causal language modelling
    Causal,
    /// Encoder-decoder, sequence-to-sequence
    Seq2Seq,
}

/// Side on which batches are padded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingSide {
    Left,
    Right,
}

impl ModelKind {
    /// Decoder-only models generate after the prompt, so pad on the left
    pub fn padding_side(&self) -> PaddingSide {
        match self {
            Self::Causal => PaddingSide::Left,
            Self::Seq2Seq => PaddingSide::Right,
        }
    }

    /// peft task type name
    pub fn task_type(&self) -> &'static str {
        match self {
            Self::Causal => "CAUSAL_LM",
            Self::Seq2Seq => "SEQ_2_SEQ_LM",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Causal => write!(f, "causal"),
            Self::Seq2Seq => write!(f, "seq2seq"),
        }
    }
}

impl std::fmt::Display for PaddingSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
        }
    }
}

fn lookup(table: &[(&str, &'static str)], model_type: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(name, _)| *name == model_type)
        .map(|(_, class)| *class)
}

/// Class name for an encoder-decoder model type
pub fn seq2seq_class(model_type: &str) -> Option<&'static str> {
    lookup(SEQ2SEQ_MODEL_TYPES, model_type)
}

/// Class name for a decoder-only model type
pub fn causal_class(model_type: &str) -> Option<&'static str> {
    lookup(CAUSAL_MODEL_TYPES, model_type)
}

/// Classify a `model_type` string
pub fn classify_model_type(model_id: &str, model_type: &str) -> Result<ModelKind> {
    if seq2seq_class(model_type).is_some() {
        tracing::warn!(
            "Model {} is an encoder-decoder model. We will load it as a Seq2SeqLM model.",
            model_id
        );
        return Ok(ModelKind::Seq2Seq);
    }
    if causal_class(model_type).is_some() {
        tracing::warn!(
            "Model {} is a decoder-only model. We will load it as a CausalLM model.",
            model_id
        );
        return Ok(ModelKind::Causal);
    }

    fn names(table: &[(&str, &str)]) -> String {
        table
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }
    anyhow::bail!(
        "Model {} of type {} is not supported. Supported models are:\nSeq2SeqLM: {}\nCausalLM: {}",
        model_id,
        model_type,
        names(SEQ2SEQ_MODEL_TYPES),
        names(CAUSAL_MODEL_TYPES)
    )
}

/// Models that ship custom modelling code alongside their weights
pub fn requires_remote_code(model_id: &str) -> bool {
    model_id.contains("mpt") || model_id.contains("falcon")
}

/// Whether the tokenizer for this model type should add a prefix space
pub fn adds_prefix_space(model_type: &str) -> bool {
    PREFIX_SPACE_MODEL_TYPES.iter().any(|t| *t == model_type)
}

/// Whether this model type stores its projection weights transposed
pub fn uses_conv1d(model_type: &str) -> bool {
    CONV1D_MODEL_TYPES.contains(&model_type)
}
