//! LoRA (Low-Rank Adaptation)
//!
//! LoRA freezes a pretrained weight and learns a low-rank update:
//!
//! ```text
//! W' = W + BA * (alpha / rank)
//! ```
//!
//! Where:
//! - W is the frozen pretrained weight
//! - B ∈ ℝ^(out × rank) initialized to zeros
//! - A ∈ ℝ^(rank × in) initialized with Kaiming uniform
//!
//! Adapters are stored with peft's naming (`base_model.model.<layer>.lora_A.weight`)
//! and `adapter_config.json` layout, so adapters trained with Python tooling
//! load here and vice versa.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarMap};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::training::hub::{AdapterPath, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};
use crate::training::models::{LayerKind, LoadedModel};
use crate::training::quantization::Quantization;
use crate::training::registry::ModelKind;

/// Prefix peft puts in front of every adapted module name
pub const PEFT_PREFIX: &str = "base_model.model.";

/// LoRA configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition (typically 4-64)
    #[serde(rename = "r")]
    pub rank: usize,
    /// Scaling factor (typically rank * 2)
    #[serde(rename = "lora_alpha")]
    pub alpha: f32,
    /// Dropout probability for LoRA layers (0.0-0.1)
    #[serde(rename = "lora_dropout", default)]
    pub dropout: f32,
    /// Module names to adapt (e.g., ["q_proj", "v_proj"]); empty means every linear layer
    #[serde(default, deserialize_with = "deserialize_target_modules")]
    pub target_modules: Vec<String>,
    /// Which biases are trained; only "none" is supported
    #[serde(default = "default_bias")]
    pub bias: String,
    /// peft task type ("CAUSAL_LM" or "SEQ_2_SEQ_LM")
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

fn default_bias() -> String {
    "none".to_string()
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

/// peft writes `target_modules` as a list, a single name, or null
fn deserialize_target_modules<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Targets {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Targets>::deserialize(d)? {
        Some(Targets::One(name)) => vec![name],
        Some(Targets::Many(names)) => names,
        None => Vec::new(),
    })
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 16.0,
            dropout: 0.05,
            target_modules: Vec::new(),
            bias: default_bias(),
            task_type: None,
            peft_type: default_peft_type(),
            base_model_name_or_path: None,
        }
    }
}

impl LoraConfig {
    /// Create a new LoRA config
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            ..Default::default()
        }
    }

    /// Set dropout
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Set target modules
    pub fn with_target_modules(mut self, modules: Vec<String>) -> Self {
        self.target_modules = modules;
        self
    }

    /// Set the task type from the model kind
    pub fn with_task(mut self, kind: ModelKind) -> Self {
        self.task_type = Some(kind.task_type().to_string());
        self
    }

    /// Get the scaling factor
    pub fn scaling(&self) -> f32 {
        self.alpha / self.rank as f32
    }

    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            anyhow::bail!("LoRA rank must be greater than 0");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("LoRA dropout must be in [0, 1), got {}", self.dropout);
        }
        if self.bias != "none" {
            anyhow::bail!("Only bias=\"none\" is supported, got {:?}", self.bias);
        }
        if self.peft_type != "LORA" {
            anyhow::bail!("Expected a LORA adapter, got peft_type {:?}", self.peft_type);
        }
        Ok(())
    }

    /// Whether `module` (a full dotted name) is targeted
    pub fn targets(&self, module: &str) -> bool {
        self.target_modules
            .iter()
            .any(|t| module == t.as_str() || module.ends_with(&format!(".{}", t)))
    }

    /// Load from a peft `adapter_config.json`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read adapter config: {:?}", path.as_ref()))?;
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse adapter_config.json")?;
        config.validate()?;
        Ok(config)
    }
}

/// Low-rank pair attached to one linear layer
pub struct LoraAdapter {
    /// Down projection: rank x in_features
    lora_a: Var,
    /// Up projection: out_features x rank
    lora_b: Var,
    scaling: f64,
    dropout: f32,
    trainable: bool,
}

impl LoraAdapter {
    /// Fresh adapter: A Kaiming-uniform, B zeros
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: &LoraConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let kaiming = Init::Kaiming {
            dist: candle_nn::init::NormalOrUniform::Uniform,
            fan: candle_nn::init::FanInOut::FanIn,
            non_linearity: candle_nn::init::NonLinearity::Linear,
        };
        let lora_a = kaiming.var((config.rank, in_features), dtype, device)?;
        let lora_b = Init::Const(0.0).var((out_features, config.rank), dtype, device)?;

        Ok(Self {
            lora_a,
            lora_b,
            scaling: config.scaling() as f64,
            dropout: config.dropout,
            trainable: true,
        })
    }

    /// Adapter from saved matrices
    pub fn from_tensors(lora_a: &Tensor, lora_b: &Tensor, config: &LoraConfig) -> Result<Self> {
        let (rank_a, _) = lora_a.dims2()?;
        let (_, rank_b) = lora_b.dims2()?;
        if rank_a != rank_b || rank_a != config.rank {
            anyhow::bail!(
                "LoRA rank mismatch: lora_A has rank {}, lora_B has rank {}, config says {}",
                rank_a,
                rank_b,
                config.rank
            );
        }

        Ok(Self {
            lora_a: Var::from_tensor(lora_a)?,
            lora_b: Var::from_tensor(lora_b)?,
            scaling: config.scaling() as f64,
            dropout: config.dropout,
            trainable: true,
        })
    }

    pub fn lora_a(&self) -> &Tensor {
        self.lora_a.as_tensor()
    }

    pub fn lora_b(&self) -> &Tensor {
        self.lora_b.as_tensor()
    }

    pub fn rank(&self) -> usize {
        self.lora_a.dim(0).unwrap_or(0)
    }

    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Whether an optimizer should update this adapter
    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub(crate) fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// LoRA contribution for input `x`: x @ A^T @ B^T * scaling
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = x.to_dtype(self.lora_a.dtype())?;
        let x = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&x, self.dropout)?
        } else {
            x
        };
        let out = x
            .broadcast_matmul(&self.lora_a.t()?)?
            .broadcast_matmul(&self.lora_b.t()?)?;
        Ok((out * self.scaling)?)
    }

    /// The dense weight update B @ A * scaling
    pub fn delta_weight(&self) -> Result<Tensor> {
        let delta = self.lora_b.matmul(self.lora_a.as_tensor())?;
        Ok((delta * self.scaling)?)
    }

    pub fn num_params(&self) -> usize {
        self.lora_a.elem_count() + self.lora_b.elem_count()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.num_params() * self.lora_a.dtype().size_in_bytes()
    }

    pub(crate) fn vars(&self) -> [&Var; 2] {
        [&self.lora_a, &self.lora_b]
    }
}

/// peft tensor names for the adapter on `layer`
pub fn adapter_tensor_names(layer: &str) -> (String, String) {
    (
        format!("{}{}.lora_A.weight", PEFT_PREFIX, layer),
        format!("{}{}.lora_B.weight", PEFT_PREFIX, layer),
    )
}

fn register_var(var_map: &VarMap, name: String, var: &Var) -> Result<()> {
    let mut data = var_map
        .data()
        .lock()
        .map_err(|_| anyhow!("LoRA variable store lock poisoned"))?;
    data.insert(name, var.clone());
    Ok(())
}

fn unregister_vars(var_map: &VarMap, names: &[String]) -> Result<()> {
    let mut data = var_map
        .data()
        .lock()
        .map_err(|_| anyhow!("LoRA variable store lock poisoned"))?;
    for name in names {
        data.remove(name);
    }
    Ok(())
}

/// Names of every linear layer of the class matching `quantization`
///
/// Only the last dotted component of each layer name is kept (so
/// `model.layers.0.self_attn.q_proj` yields `q_proj`). `lm_head` is never
/// returned.
pub fn find_all_linear_names(model: &LoadedModel, quantization: Option<Quantization>) -> Vec<String> {
    let class = match quantization {
        None => LayerKind::Linear,
        Some(Quantization::FourBit) => LayerKind::Linear4bit,
        Some(Quantization::EightBit) => LayerKind::Linear8bit,
    };

    let mut names: BTreeSet<String> = model
        .layers()
        .filter(|layer| layer.kind() == class)
        .map(|layer| {
            let name = layer.name();
            name.rsplit('.').next().unwrap_or(name).to_string()
        })
        .collect();

    names.remove("lm_head");
    names.into_iter().collect()
}

/// Attach fresh adapters to every targeted linear layer
///
/// Returns the number of adapted layers.
pub fn inject_lora(model: &mut LoadedModel, config: &LoraConfig) -> Result<usize> {
    config.validate()?;
    if config.target_modules.is_empty() {
        anyhow::bail!("No LoRA target modules given");
    }

    // Quantized bases keep adapters in full precision
    let dtype = if model.quantization().is_some() {
        DType::F32
    } else {
        model.dtype()
    };
    let device = model.device().clone();

    let targets: Vec<String> = model
        .layers()
        .filter(|layer| layer.kind().is_linear() && config.targets(layer.name()))
        .map(|layer| layer.name().to_string())
        .collect();

    if targets.is_empty() {
        anyhow::bail!(
            "Target modules {:?} not found in the base model",
            config.target_modules
        );
    }

    for name in &targets {
        let (in_features, out_features) = model.require_layer(name)?.linear_dims()?;
        let adapter = LoraAdapter::new(in_features, out_features, config, dtype, &device)?;
        attach(model, name, adapter)?;
    }

    model.set_lora_config(config.clone());
    tracing::info!(
        "Injected LoRA adapters (rank {}, alpha {}) into {} layers",
        config.rank,
        config.alpha,
        targets.len()
    );
    Ok(targets.len())
}

fn attach(model: &mut LoadedModel, name: &str, adapter: LoraAdapter) -> Result<()> {
    let (a_name, b_name) = adapter_tensor_names(name);
    let [a, b] = adapter.vars();
    register_var(model.adapters(), a_name, a)?;
    register_var(model.adapters(), b_name, b)?;
    model.require_layer_mut(name)?.set_lora(Some(adapter));
    Ok(())
}

/// Attach adapters saved in peft format
pub fn load_pretrained_adapter(model: &mut LoadedModel, adapter: &AdapterPath) -> Result<usize> {
    let config = LoraConfig::from_file(&adapter.config_file)?;
    let tensors = candle_core::safetensors::load(&adapter.weights_file, model.device())
        .with_context(|| format!("Failed to load adapter weights: {:?}", adapter.weights_file))?;

    let pairs = pair_adapter_tensors(&tensors)?;
    if pairs.is_empty() {
        anyhow::bail!("No LoRA weights found in {:?}", adapter.weights_file);
    }

    let dtype = if model.quantization().is_some() {
        DType::F32
    } else {
        model.dtype()
    };

    for (layer, (a, b)) in &pairs {
        let layer_ref = model.require_layer(layer)?;
        if !layer_ref.kind().is_linear() {
            anyhow::bail!("Adapter targets {} which is not a linear layer", layer);
        }
        let (in_features, out_features) = layer_ref.linear_dims()?;
        if a.dims() != [config.rank, in_features] || b.dims() != [out_features, config.rank] {
            anyhow::bail!(
                "Adapter shapes for {} ({:?}, {:?}) do not match layer ({} -> {})",
                layer,
                a.dims(),
                b.dims(),
                in_features,
                out_features
            );
        }
        let adapter = LoraAdapter::from_tensors(&a.to_dtype(dtype)?, &b.to_dtype(dtype)?, &config)?;
        attach(model, layer, adapter)?;
    }

    tracing::info!(
        "Loaded pretrained LoRA weights for {} layers from {:?}",
        pairs.len(),
        adapter.weights_file
    );
    model.set_lora_config(config);
    Ok(pairs.len())
}

/// Exclude every attached adapter from training
///
/// Returns the number of frozen adapters.
pub fn freeze_adapters(model: &mut LoadedModel) -> Result<usize> {
    let adapted: Vec<String> = model
        .layers()
        .filter(|layer| layer.lora().is_some_and(|l| l.is_trainable()))
        .map(|layer| layer.name().to_string())
        .collect();

    for name in &adapted {
        if let Some(lora) = model.require_layer_mut(name)?.lora_mut() {
            lora.set_trainable(false);
        }
    }
    tracing::debug!("Froze {} LoRA adapters", adapted.len());
    Ok(adapted.len())
}

/// Group `...lora_A.weight` / `...lora_B.weight` tensors by layer name
fn pair_adapter_tensors(
    tensors: &HashMap<String, Tensor>,
) -> Result<Vec<(String, (Tensor, Tensor))>> {
    let mut pairs = Vec::new();
    for (name, a) in tensors {
        let Some(stem) = name.strip_suffix(".lora_A.weight") else {
            continue;
        };
        let b = tensors
            .get(&format!("{}.lora_B.weight", stem))
            .ok_or_else(|| anyhow!("Missing lora_B for {}", name))?;
        let layer = stem.strip_prefix(PEFT_PREFIX).unwrap_or(stem).to_string();
        pairs.push((layer, (a.clone(), b.clone())));
    }
    pairs.sort_by(|x, y| x.0.cmp(&y.0));
    Ok(pairs)
}

/// Save adapters in peft format, returning the written directory
pub fn save_adapter(model: &LoadedModel, dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    let config = model
        .lora_config()
        .ok_or_else(|| anyhow!("Model has no LoRA adapters to save"))?;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create adapter directory: {:?}", dir))?;

    let mut config = config.clone();
    config.base_model_name_or_path = Some(model.model_id().to_string());
    std::fs::write(
        dir.join(ADAPTER_CONFIG_FILE),
        serde_json::to_string_pretty(&config)?,
    )?;

    model
        .adapters()
        .save(dir.join(ADAPTER_WEIGHTS_FILE))
        .context("Failed to save adapter weights")?;

    tracing::info!("Saved LoRA adapter to {:?}", dir);
    Ok(dir.to_path_buf())
}

/// Fold adapters into the base weights and drop them
///
/// Quantized layers cannot absorb the update; their adapters are kept.
/// Returns the number of merged layers.
pub fn merge_and_unload(model: &mut LoadedModel) -> Result<usize> {
    let adapted: Vec<String> = model
        .layers()
        .filter(|layer| layer.lora().is_some())
        .map(|layer| layer.name().to_string())
        .collect();

    let mut merged = 0;
    for name in adapted {
        let layer = model.require_layer_mut(&name)?;
        if layer.kind() != LayerKind::Linear {
            tracing::warn!("Cannot merge LoRA into quantized layer {}, keeping adapter", name);
            continue;
        }
        layer.merge_lora()?;

        let (a_name, b_name) = adapter_tensor_names(&name);
        unregister_vars(model.adapters(), &[a_name, b_name])?;
        merged += 1;
    }

    if model.layers().all(|layer| layer.lora().is_none()) {
        model.clear_lora_config();
    }

    tracing::info!("Merged LoRA adapters into {} layers", merged);
    Ok(merged)
}
