//! Model and tokenizer loading for training and inference

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::model::{get_trainable_parameters, LoadedModel};
use super::tokenizer::{LmTokenizer, TokenizerOptions};
use crate::training::device_map::{get_device_map, PlacementEnv};
use crate::training::hub::{HubModelConfig, ModelLoader, ModelPath};
use crate::training::lora::{
    find_all_linear_names, freeze_adapters, inject_lora, load_pretrained_adapter, merge_and_unload,
    LoraConfig,
};
use crate::training::quantization::{dtype_name, DTypeSpec, Quantization, QuantizationConfig};
use crate::training::registry::{adds_prefix_space, classify_model_type, requires_remote_code};

/// Options for [`load_model_for_training`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingLoadOptions {
    /// Local directory or Hub id of the base model
    #[serde(alias = "model_weights_name_or_path")]
    pub model_name_or_path: String,
    /// 4 or 8 bit weights; `None` for full precision
    pub quantization: Option<Quantization>,
    pub use_lora: bool,
    /// Pretrained adapter; fresh adapters are created when unset
    pub lora_weights_name_or_path: Option<String>,
    /// Modules to adapt; every linear layer when unset or empty
    pub lora_target_modules: Option<Vec<String>>,
    pub lora_r: usize,
    pub lora_alpha: f32,
    pub lora_dropout: f32,
    #[serde(alias = "torch_dtype")]
    pub dtype: Option<DTypeSpec>,
    pub add_labels_as_tokens: bool,
    pub labels: Vec<String>,
    pub force_auto_device_map: bool,
    pub use_gradient_checkpointing: bool,
    #[serde(alias = "use_better_transformer")]
    pub use_fused_attention: bool,
}

impl Default for TrainingLoadOptions {
    fn default() -> Self {
        Self {
            model_name_or_path: String::new(),
            quantization: None,
            use_lora: false,
            lora_weights_name_or_path: None,
            lora_target_modules: None,
            lora_r: 8,
            lora_alpha: 16.0,
            lora_dropout: 0.05,
            dtype: None,
            add_labels_as_tokens: false,
            labels: Vec::new(),
            force_auto_device_map: false,
            use_gradient_checkpointing: false,
            use_fused_attention: false,
        }
    }
}

/// Options for [`load_model_for_inference`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceLoadOptions {
    #[serde(alias = "weights_path")]
    pub model_name_or_path: String,
    pub quantization: Option<Quantization>,
    /// Adapter to apply; merged into the weights when not quantized
    pub lora_weights_name_or_path: Option<String>,
    #[serde(alias = "torch_dtype")]
    pub dtype: Option<DTypeSpec>,
    pub force_auto_device_map: bool,
    #[serde(alias = "use_better_transformer")]
    pub use_fused_attention: bool,
}

impl Default for InferenceLoadOptions {
    fn default() -> Self {
        Self {
            model_name_or_path: String::new(),
            quantization: None,
            lora_weights_name_or_path: None,
            dtype: Some(DTypeSpec::Named(candle_core::DType::F32)),
            force_auto_device_map: false,
            use_fused_attention: false,
        }
    }
}

fn read_options<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read load options: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse load options: {:?}", path))
}

impl TrainingLoadOptions {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        read_options(path.as_ref())
    }
}

impl InferenceLoadOptions {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        read_options(path.as_ref())
    }
}

fn require_model_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        anyhow::bail!("No model given: set model_name_or_path");
    }
    Ok(())
}

fn load_tokenizer(
    loader_name: &str,
    model_path: &ModelPath,
    config: &HubModelConfig,
) -> Result<LmTokenizer> {
    if requires_remote_code(loader_name) {
        tracing::warn!(
            "{} ships custom modelling code; it is not executed, only its weights are read",
            loader_name
        );
    }
    let model_type = config.model_type.as_deref().unwrap_or("");
    LmTokenizer::from_model_path(
        model_path,
        &TokenizerOptions {
            add_eos_token: true,
            add_prefix_space: adds_prefix_space(model_type),
        },
    )
}

fn log_quantization(quantization: Option<&QuantizationConfig>, dtype: Option<DTypeSpec>) -> Result<()> {
    match quantization {
        Some(qconfig) => tracing::info!("Quantization config: {}", qconfig.to_json_pretty()?),
        None => tracing::info!(
            "Loading model with dtype: {}",
            dtype.map_or_else(|| "default".to_string(), |d| d.to_string())
        ),
    }
    Ok(())
}

/// Load a model and tokenizer for fine-tuning, using the process placement hints
pub fn load_model_for_training(options: &TrainingLoadOptions) -> Result<(LoadedModel, LmTokenizer)> {
    load_model_for_training_with(options, &PlacementEnv::from_process_env()?)
}

/// Load a model and tokenizer for fine-tuning
///
/// Quantized weights can only be trained through LoRA adapters. Without
/// LoRA or quantization the whole model is trainable.
pub fn load_model_for_training_with(
    options: &TrainingLoadOptions,
    env: &PlacementEnv,
) -> Result<(LoadedModel, LmTokenizer)> {
    require_model_name(&options.model_name_or_path)?;
    let name = options.model_name_or_path.as_str();

    let mut use_fused_attention = options.use_fused_attention;
    if use_fused_attention {
        tracing::warn!(
            "Fused attention is not supported for training and will be disabled. \
             It can still be used for inference."
        );
        use_fused_attention = false;
    }

    if options.quantization.is_some() && !options.use_lora {
        anyhow::bail!(
            "Quantization == 4/8 is only supported with LoRA. If you want to train a 4/8 bit \
             quantized model, you must set use_lora=true. If you want a 4/8 bit optimizer, set \
             quantization=None and choose the optimizer separately."
        );
    }

    tracing::info!("Loading model from {}", name);
    let device_map = get_device_map(options.force_auto_device_map, use_fused_attention, env)?;

    let model_path = ModelLoader::new().load_model_path(name)?;
    let config = HubModelConfig::from_file(&model_path.config_file)?;

    let mut tokenizer = load_tokenizer(name, &model_path, &config)?;
    tokenizer.check_angle_bracket(options.add_labels_as_tokens)?;

    let qconfig = options
        .quantization
        .map(|q| QuantizationConfig::new(q, options.dtype));
    log_quantization(qconfig.as_ref(), options.dtype)?;

    let kind = classify_model_type(name, config.require_model_type()?)?;
    let dtype = DTypeSpec::resolve(options.dtype, config.torch_dtype.as_deref())?;
    let device = device_map.resolve()?;
    let mut model =
        LoadedModel::from_model_path(&model_path, kind, dtype, qconfig.as_ref(), device_map, &device)?;
    tokenizer.set_padding_side(kind.padding_side());

    if options.add_labels_as_tokens {
        if options.labels.is_empty() {
            anyhow::bail!("add_labels_as_tokens is set but no labels were given");
        }
        tracing::info!("Adding labels as tokens: {:?}", options.labels);
        tracing::info!("Model has {} tokens before adding labels.", tokenizer.len());
        tokenizer.add_tokens(&options.labels);
        model.resize_token_embeddings(tokenizer.len())?;
        tracing::info!("Model has {} tokens after adding labels.", tokenizer.len());
    }

    model.log_summary();
    tokenizer.ensure_pad_token()?;

    if options.quantization.is_some() {
        model.prepare_for_kbit_training(options.use_gradient_checkpointing)?;
    } else if options.use_gradient_checkpointing {
        model.gradient_checkpointing_enable();
    }

    if options.use_lora {
        model.enable_input_require_grads();

        match &options.lora_weights_name_or_path {
            None => {
                tracing::info!("No pretrained LoRA weights provided, we will initialize the weights randomly.");
                let targets = match &options.lora_target_modules {
                    Some(targets) if !targets.is_empty() => targets.clone(),
                    _ => {
                        tracing::warn!(
                            "No target modules provided, will use all the modules compatible with LoRA."
                        );
                        find_all_linear_names(&model, options.quantization)
                    }
                };
                let lora_config = LoraConfig::new(options.lora_r, options.lora_alpha)
                    .with_dropout(options.lora_dropout)
                    .with_target_modules(targets)
                    .with_task(kind);
                inject_lora(&mut model, &lora_config)?;
            }
            Some(adapter) => {
                tracing::info!("Loading pretrained LoRA weights from {}", adapter);
                let adapter_path = ModelLoader::new().load_adapter_path(adapter)?;
                load_pretrained_adapter(&mut model, &adapter_path)?;
            }
        }

        if let Some(lora_config) = model.lora_config() {
            tracing::info!("LoRA config:\n{}", serde_json::to_string_pretty(lora_config)?);
        }
    } else if options.quantization.is_none() {
        model.enable_full_training()?;
    }

    let (trainable, total, percent) = get_trainable_parameters(&model);
    tracing::info!(
        "---> Trainable params: {} || all params: {} || trainable%: {:.6}",
        trainable,
        total,
        percent
    );

    Ok((model, tokenizer))
}

/// Load a model and tokenizer for generation, using the process placement hints
pub fn load_model_for_inference(options: &InferenceLoadOptions) -> Result<(LoadedModel, LmTokenizer)> {
    load_model_for_inference_with(options, &PlacementEnv::from_process_env()?)
}

/// Load a model and tokenizer for generation
pub fn load_model_for_inference_with(
    options: &InferenceLoadOptions,
    env: &PlacementEnv,
) -> Result<(LoadedModel, LmTokenizer)> {
    require_model_name(&options.model_name_or_path)?;
    let name = options.model_name_or_path.as_str();

    tracing::info!("Loading model from {}", name);
    let device_map = get_device_map(options.force_auto_device_map, options.use_fused_attention, env)?;

    let model_path = ModelLoader::new().load_model_path(name)?;
    let config = HubModelConfig::from_file(&model_path.config_file)?;
    let dtype = DTypeSpec::resolve(options.dtype, config.torch_dtype.as_deref())?;

    let mut tokenizer = load_tokenizer(name, &model_path, &config)?;

    let qconfig = options
        .quantization
        .map(|q| QuantizationConfig::new(q, options.dtype));
    log_quantization(qconfig.as_ref(), options.dtype)?;

    let kind = classify_model_type(name, config.require_model_type()?)?;
    let device = device_map.resolve()?;
    let mut model =
        LoadedModel::from_model_path(&model_path, kind, dtype, qconfig.as_ref(), device_map, &device)?;
    tokenizer.set_padding_side(kind.padding_side());

    if options.use_fused_attention {
        model.enable_fused_attention();
    }

    model.log_summary();
    tokenizer.ensure_pad_token()?;

    if let Some(adapter) = &options.lora_weights_name_or_path {
        tracing::info!("Loading pretrained LoRA weights from {}", adapter);
        let adapter_path = ModelLoader::new().load_adapter_path(adapter)?;
        load_pretrained_adapter(&mut model, &adapter_path)?;
        freeze_adapters(&mut model)?;

        if options.quantization.is_none() {
            merge_and_unload(&mut model)?;
        }
    }

    tracing::debug!("Inference model ready ({})", dtype_name(model.dtype()));
    Ok((model, tokenizer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::device_map::DeviceMap;
    use crate::training::lora::save_adapter;
    use crate::training::models::testing::{tiny_llama_dir, write_model_config, HIDDEN, VOCAB};
    use crate::training::models::LayerKind;
    use crate::training::registry::{ModelKind, PaddingSide};
    use candle_core::{DType, Device, Tensor};

    const V_PROJ: &str = "model.layers.0.self_attn.v_proj";

    fn training(dir: &Path) -> TrainingLoadOptions {
        TrainingLoadOptions {
            model_name_or_path: dir.to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    fn single() -> PlacementEnv {
        PlacementEnv::default()
    }

    /// Train-time v_proj adapter with B set to `value`, saved in peft layout
    fn saved_v_proj_adapter(model_dir: &Path, adapter_dir: &Path, value: f64) -> LoadedModel {
        let options = TrainingLoadOptions {
            use_lora: true,
            lora_target_modules: Some(vec!["v_proj".to_string()]),
            ..training(model_dir)
        };
        let (trained, _) = load_model_for_training_with(&options, &single()).unwrap();

        let lora = trained.require_layer(V_PROJ).unwrap().lora().unwrap();
        let filled = (lora.lora_b().ones_like().unwrap() * value).unwrap();
        lora.vars()[1].set(&filled).unwrap();

        save_adapter(&trained, adapter_dir).unwrap();
        trained
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_options_from_json() {
        let options: TrainingLoadOptions = serde_json::from_str(
            r#"{
                "model_weights_name_or_path": "meta-llama/Llama-2-7b-hf",
                "quantization": 4,
                "use_lora": true,
                "torch_dtype": "bfloat16",
                "use_better_transformer": true
            }"#,
        )
        .unwrap();
        assert_eq!(options.model_name_or_path, "meta-llama/Llama-2-7b-hf");
        assert_eq!(options.quantization, Some(Quantization::FourBit));
        assert_eq!(options.dtype, Some(DTypeSpec::Named(DType::BF16)));
        assert!(options.use_fused_attention);
        assert_eq!(options.lora_r, 8);
        assert_eq!(options.lora_dropout, 0.05);

        let options: InferenceLoadOptions = serde_json::from_str(r#"{"weights_path": "x"}"#).unwrap();
        assert_eq!(options.dtype, Some(DTypeSpec::Named(DType::F32)));

        let bad = serde_json::from_str::<TrainingLoadOptions>(r#"{"quantization": 2}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_quantization_requires_lora() {
        let dir = tiny_llama_dir();
        let options = TrainingLoadOptions {
            quantization: Some(Quantization::EightBit),
            ..training(dir.path())
        };
        let err = load_model_for_training_with(&options, &single()).unwrap_err();
        assert!(err.to_string().contains("only supported with LoRA"));
    }

    #[test]
    fn test_full_training() {
        let dir = tiny_llama_dir();
        let (model, tokenizer) = load_model_for_training_with(&training(dir.path()), &single()).unwrap();

        assert_eq!(model.kind(), ModelKind::Causal);
        assert_eq!(*model.device_map(), DeviceMap::Unset);
        assert_eq!(tokenizer.padding_side(), PaddingSide::Left);
        // No pad token in the fixture: UNK is used
        assert_eq!(tokenizer.pad_token_id(), Some(0));
        // dtype unset: F32 even though config.json says bfloat16
        assert_eq!(model.dtype(), DType::F32);

        let (trainable, total, _) = get_trainable_parameters(&model);
        assert_eq!(trainable, total);
    }

    #[test]
    fn test_lora_training_targets_all_linear_layers() {
        let dir = tiny_llama_dir();
        let options = TrainingLoadOptions {
            use_lora: true,
            use_gradient_checkpointing: true,
            ..training(dir.path())
        };
        let (model, _) = load_model_for_training_with(&options, &single()).unwrap();

        let config = model.lora_config().unwrap();
        assert_eq!(
            config.target_modules,
            vec!["down_proj", "gate_proj", "k_proj", "o_proj", "q_proj", "up_proj", "v_proj"]
        );
        assert_eq!(config.task_type.as_deref(), Some("CAUSAL_LM"));
        assert!(model.require_layer("lm_head").unwrap().lora().is_none());
        assert!(model.is_gradient_checkpointing());
        assert!(model.input_require_grads());

        let (trainable, total, percent) = get_trainable_parameters(&model);
        assert!(trainable > 0 && trainable < total);
        assert!(percent < 100.0);
    }

    #[test]
    fn test_qlora_training() {
        let dir = tiny_llama_dir();
        let options = TrainingLoadOptions {
            quantization: Some(Quantization::FourBit),
            use_lora: true,
            lora_target_modules: Some(vec!["q_proj".to_string()]),
            ..training(dir.path())
        };
        let (model, _) = load_model_for_training_with(&options, &single()).unwrap();

        let q_proj = model.require_layer("model.layers.0.self_attn.q_proj").unwrap();
        assert_eq!(q_proj.kind(), LayerKind::Linear4bit);
        assert_eq!(q_proj.lora().unwrap().lora_a().dtype(), DType::F32);
        assert!(model.input_require_grads());
        assert_eq!(find_all_linear_names(&model, Some(Quantization::FourBit)).len(), 7);
    }

    #[test]
    fn test_labels_as_tokens_resizes_embeddings() {
        let dir = tiny_llama_dir();
        let options = TrainingLoadOptions {
            add_labels_as_tokens: true,
            labels: vec!["<person>".to_string(), "</person>".to_string()],
            ..training(dir.path())
        };
        let (model, tokenizer) = load_model_for_training_with(&options, &single()).unwrap();

        assert_eq!(tokenizer.len(), VOCAB + 2);
        let embed = model.require_layer("model.embed_tokens").unwrap();
        assert_eq!(embed.weight().shape().dims(), &[VOCAB + 2, 32]);

        let missing = TrainingLoadOptions {
            add_labels_as_tokens: true,
            ..training(dir.path())
        };
        assert!(load_model_for_training_with(&missing, &single()).is_err());
    }

    #[test]
    fn test_unsupported_model_type() {
        let dir = tiny_llama_dir();
        write_model_config(dir.path(), "bert");
        let err = load_model_for_training_with(&training(dir.path()), &single()).unwrap_err();
        assert!(err.to_string().contains("of type bert is not supported"));
    }

    #[test]
    fn test_distributed_force_auto_fails() {
        let dir = tiny_llama_dir();
        let options = TrainingLoadOptions {
            force_auto_device_map: true,
            ..training(dir.path())
        };
        assert!(load_model_for_training_with(&options, &PlacementEnv::new(2, 1)).is_err());
    }

    #[test]
    fn test_training_resumes_pretrained_adapter() {
        let dir = tiny_llama_dir();
        let adapter_dir = tempfile::tempdir().unwrap();
        saved_v_proj_adapter(dir.path(), adapter_dir.path(), 0.5);

        // Rank and targets come from adapter_config.json, not the options
        let options = TrainingLoadOptions {
            use_lora: true,
            lora_r: 2,
            lora_target_modules: Some(vec!["q_proj".to_string()]),
            lora_weights_name_or_path: Some(adapter_dir.path().to_string_lossy().to_string()),
            ..training(dir.path())
        };
        let (model, _) = load_model_for_training_with(&options, &single()).unwrap();

        let config = model.lora_config().unwrap();
        assert_eq!(config.rank, 8);
        assert_eq!(config.target_modules, vec!["v_proj"]);
        assert!(model.require_layer("model.layers.0.self_attn.q_proj").unwrap().lora().is_none());

        let lora = model.require_layer(V_PROJ).unwrap().lora().unwrap();
        assert!(lora.is_trainable());
        let b = lora.lora_b().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(b.iter().all(|v| *v == 0.5));

        let (trainable, _, _) = get_trainable_parameters(&model);
        assert_eq!(trainable, 8 * HIDDEN + HIDDEN * 8);
        assert_eq!(model.trainable_vars().len(), 2);
        assert!(model.input_require_grads());
    }

    #[test]
    fn test_inference_merges_adapter() {
        let dir = tiny_llama_dir();
        let adapter_dir = tempfile::tempdir().unwrap();
        let trained = saved_v_proj_adapter(dir.path(), adapter_dir.path(), 0.5);

        let lora = trained.require_layer(V_PROJ).unwrap().lora().unwrap();
        let base = candle_core::safetensors::load(dir.path().join("model.safetensors"), &Device::Cpu).unwrap();
        let w = &base["model.layers.0.self_attn.v_proj.weight"];
        // alpha 16 / r 8
        let update = (lora.lora_b().matmul(lora.lora_a()).unwrap() * 2.0).unwrap();
        let expected = (w + &update).unwrap();

        let options = InferenceLoadOptions {
            model_name_or_path: dir.path().to_string_lossy().to_string(),
            lora_weights_name_or_path: Some(adapter_dir.path().to_string_lossy().to_string()),
            ..Default::default()
        };
        let (model, tokenizer) = load_model_for_inference_with(&options, &single()).unwrap();
        assert!(model.layers().all(|layer| layer.lora().is_none()));
        assert!(model.lora_config().is_none());
        assert_eq!(tokenizer.padding_side(), PaddingSide::Left);
        assert_eq!(get_trainable_parameters(&model).0, 0);

        let merged = model.require_layer(V_PROJ).unwrap().weight().tensor().unwrap();
        assert!(max_abs_diff(&merged, &expected) < 1e-5);
        assert!(max_abs_diff(&merged, w) > 1e-3);

        // Quantized bases keep the adapter, frozen
        let options = InferenceLoadOptions {
            quantization: Some(Quantization::EightBit),
            ..options
        };
        let (model, _) = load_model_for_inference_with(&options, &single()).unwrap();
        let v_proj = model.require_layer(V_PROJ).unwrap();
        assert_eq!(v_proj.kind(), LayerKind::Linear8bit);
        assert!(!v_proj.lora().unwrap().is_trainable());
        assert_eq!(get_trainable_parameters(&model).0, 0);
        assert!(model.trainable_vars().is_empty());
    }
}
