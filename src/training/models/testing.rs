//! Tiny model directories for tests

use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

pub const HIDDEN: usize = 32;
pub const INTERMEDIATE: usize = 64;
pub const VOCAB: usize = 8;

/// Vocabulary of the fixture tokenizer, in id order
pub const TOKENS: [&str; VOCAB] = ["<unk>", "<s>", "</s>", "<", "hello", "world", "Paris", "Ada"];

fn randn(shape: (usize, usize)) -> Tensor {
    Tensor::randn(0f32, 0.02, shape, &Device::Cpu).unwrap()
}

/// One-block llama with an untied output projection
pub fn tiny_llama_tensors() -> Vec<(String, Tensor)> {
    let mut tensors = vec![
        ("model.embed_tokens.weight".to_string(), randn((VOCAB, HIDDEN))),
        ("lm_head.weight".to_string(), randn((VOCAB, HIDDEN))),
        ("model.norm.weight".to_string(), Tensor::ones(HIDDEN, DType::F32, &Device::Cpu).unwrap()),
    ];
    let prefix = "model.layers.0";
    for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
        tensors.push((format!("{}.self_attn.{}.weight", prefix, proj), randn((HIDDEN, HIDDEN))));
    }
    for proj in ["gate_proj", "up_proj"] {
        tensors.push((format!("{}.mlp.{}.weight", prefix, proj), randn((INTERMEDIATE, HIDDEN))));
    }
    tensors.push((format!("{}.mlp.down_proj.weight", prefix), randn((HIDDEN, INTERMEDIATE))));
    for norm in ["input_layernorm", "post_attention_layernorm"] {
        tensors.push((
            format!("{}.{}.weight", prefix, norm),
            Tensor::ones(HIDDEN, DType::F32, &Device::Cpu).unwrap(),
        ));
    }
    tensors
}

/// WordLevel tokenizer splitting on whitespace and punctuation
pub fn write_tokenizer(dir: &Path, tokens: &[&str], unk: &str) {
    let vocab: serde_json::Map<String, serde_json::Value> = tokens
        .iter()
        .enumerate()
        .map(|(id, token)| (token.to_string(), serde_json::json!(id)))
        .collect();
    let tokenizer = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": unk}
    });
    std::fs::write(dir.join("tokenizer.json"), tokenizer.to_string()).unwrap();
}

pub fn write_tokenizer_config(dir: &Path, config: serde_json::Value) {
    std::fs::write(dir.join("tokenizer_config.json"), config.to_string()).unwrap();
}

pub fn write_model_config(dir: &Path, model_type: &str) {
    let config = serde_json::json!({
        "architectures": ["LlamaForCausalLM"],
        "model_type": model_type,
        "hidden_size": HIDDEN,
        "intermediate_size": INTERMEDIATE,
        "num_hidden_layers": 1,
        "vocab_size": VOCAB,
        "torch_dtype": "bfloat16",
        "tie_word_embeddings": false
    });
    std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
}

/// Complete llama model directory without a pad token
pub fn tiny_llama_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_model_config(dir.path(), "llama");

    let tensors: HashMap<String, Tensor> = tiny_llama_tensors().into_iter().collect();
    candle_core::safetensors::save(&tensors, dir.path().join("model.safetensors")).unwrap();

    write_tokenizer(dir.path(), &TOKENS, "<unk>");
    write_tokenizer_config(
        dir.path(),
        serde_json::json!({
            "bos_token": "<s>",
            "eos_token": {"content": "</s>", "lstrip": false, "rstrip": false},
            "unk_token": "<unk>",
            "pad_token": null,
            "model_max_length": 2048
        }),
    );
    dir
}
