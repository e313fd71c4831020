//! A model loaded from safetensors as a tree of named layers

use anyhow::{anyhow, Context, Result};
use candle_core::quantized::QTensor;
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::layer::{Layer, LayerKind, WeightStorage};
use crate::training::device_map::DeviceMap;
use crate::training::hub::{HubModelConfig, ModelPath};
use crate::training::lora::LoraConfig;
use crate::training::quantization::{dtype_name, Quantization, QuantizationConfig};
use crate::training::registry::{uses_conv1d, ModelKind};

/// Module names that hold embedding tables
const EMBEDDING_MODULES: &[&str] = &[
    "embed_tokens",
    "wte",
    "wpe",
    "word_embeddings",
    "position_embeddings",
    "token_type_embeddings",
    "shared",
    "embed_positions",
    "embed_in",
];

/// Embedding tables indexed by token id
const TOKEN_EMBEDDING_MODULES: &[&str] = &["embed_tokens", "wte", "word_embeddings", "shared", "embed_in"];

/// Output projections onto the vocabulary
const OUTPUT_MODULES: &[&str] = &["lm_head", "embed_out"];

/// `Conv1D` projections of GPT-2 style models
const CONV1D_MODULES: &[&str] = &["c_attn", "c_proj", "c_fc", "q_attn"];

fn last_component(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn classify_layer(module: &str, tensor: &Tensor, is_weight: bool) -> LayerKind {
    if !is_weight || !tensor.dtype().is_float() {
        return LayerKind::Other;
    }
    match tensor.rank() {
        2 if EMBEDDING_MODULES.contains(&last_component(module)) => LayerKind::Embedding,
        2 => LayerKind::Linear,
        1 => LayerKind::Norm,
        _ => LayerKind::Other,
    }
}

/// A causal or sequence-to-sequence language model
pub struct LoadedModel {
    model_id: String,
    config: HubModelConfig,
    kind: ModelKind,
    dtype: DType,
    device: Device,
    device_map: DeviceMap,
    quantization: Option<Quantization>,
    layers: BTreeMap<String, Layer>,
    adapters: VarMap,
    lora_config: Option<LoraConfig>,
    gradient_checkpointing: bool,
    input_require_grads: bool,
    fused_attention: bool,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model_id", &self.model_id)
            .field("kind", &self.kind)
            .field("dtype", &self.dtype)
            .field("device_map", &self.device_map)
            .field("quantization", &self.quantization)
            .field("layers", &self.layers.len())
            .field("lora", &self.lora_config.as_ref().map(|c| c.rank))
            .finish()
    }
}

impl LoadedModel {
    /// Load every weight of a model directory
    pub fn from_model_path(
        model_path: &ModelPath,
        kind: ModelKind,
        dtype: DType,
        quantization: Option<&QuantizationConfig>,
        device_map: DeviceMap,
        device: &Device,
    ) -> Result<Self> {
        model_path.validate()?;
        let config = HubModelConfig::from_file(&model_path.config_file)?;

        let safetensors = unsafe {
            MmapedSafetensors::multi(&model_path.weights_files)
                .context("Failed to load model weights")?
        };

        let mut tensors = Vec::new();
        for (name, _) in safetensors.tensors() {
            let tensor = safetensors
                .load(&name, device)
                .with_context(|| format!("Failed to load tensor {}", name))?;
            tensors.push((name, tensor));
        }
        tracing::debug!(
            "Read {} tensors from {} weight file(s)",
            tensors.len(),
            model_path.weights_files.len()
        );

        Self::from_tensors(
            &model_path.model_id,
            config,
            kind,
            tensors,
            dtype,
            quantization,
            device_map,
            device,
        )
    }

    /// Build from named tensors
    ///
    /// Floating-point tensors are cast to `dtype`. With a quantization config,
    /// every linear layer except the output projection is stored quantized.
    #[allow(clippy::too_many_arguments)]
    pub fn from_tensors(
        model_id: &str,
        config: HubModelConfig,
        kind: ModelKind,
        tensors: impl IntoIterator<Item = (String, Tensor)>,
        dtype: DType,
        quantization: Option<&QuantizationConfig>,
        device_map: DeviceMap,
        device: &Device,
    ) -> Result<Self> {
        let mut weights: BTreeMap<String, (Tensor, bool)> = BTreeMap::new();
        let mut biases: HashMap<String, Tensor> = HashMap::new();
        let conv1d = config.model_type.as_deref().is_some_and(uses_conv1d);

        for (name, tensor) in tensors {
            let tensor = if tensor.dtype().is_float() {
                tensor.to_dtype(dtype)?.to_device(device)?
            } else {
                tensor.to_device(device)?
            };
            if let Some(module) = name.strip_suffix(".bias") {
                biases.insert(module.to_string(), tensor);
            } else if let Some(module) = name.strip_suffix(".weight") {
                // Conv1D keeps (in, out); every layer here is held as (out, in)
                let tensor = if conv1d
                    && tensor.rank() == 2
                    && CONV1D_MODULES.contains(&last_component(module))
                {
                    tensor.t()?.contiguous()?
                } else {
                    tensor
                };
                weights.insert(module.to_string(), (tensor, true));
            } else {
                weights.insert(name, (tensor, false));
            }
        }

        // Biases without a weight are kept as standalone parameters
        let orphans: Vec<String> = biases
            .keys()
            .filter(|module| !weights.contains_key(*module))
            .cloned()
            .collect();
        for module in orphans {
            if let Some(bias) = biases.remove(&module) {
                weights.insert(format!("{}.bias", module), (bias, false));
            }
        }

        let mut layers = BTreeMap::new();
        let mut quantized = 0usize;
        for (module, (tensor, is_weight)) in weights {
            let mut kind_of = classify_layer(&module, &tensor, is_weight);
            let bias = biases.remove(&module).map(WeightStorage::Frozen);

            let weight = match quantization {
                Some(qconfig)
                    if kind_of == LayerKind::Linear
                        && !OUTPUT_MODULES.contains(&last_component(&module)) =>
                {
                    let in_features = tensor.dim(1)?;
                    match qconfig.ggml_dtype(in_features) {
                        Some(ggml) => {
                            let qtensor = QTensor::quantize(&tensor.to_dtype(DType::F32)?, ggml)
                                .with_context(|| format!("Failed to quantize {}", module))?;
                            kind_of = match qconfig.quantization() {
                                Quantization::FourBit => LayerKind::Linear4bit,
                                Quantization::EightBit => LayerKind::Linear8bit,
                            };
                            quantized += 1;
                            WeightStorage::Quantized(Arc::new(qtensor))
                        }
                        None => {
                            tracing::debug!(
                                "{} has {} input features, not a multiple of the block size; left unquantized",
                                module,
                                in_features
                            );
                            WeightStorage::Frozen(tensor)
                        }
                    }
                }
                _ => WeightStorage::Frozen(tensor),
            };

            layers.insert(module.clone(), Layer::new(module, kind_of, weight, bias));
        }

        if layers.is_empty() {
            anyhow::bail!("Model {} has no weights", model_id);
        }

        let quantization = quantization.map(|q| q.quantization());
        if let Some(q) = quantization {
            tracing::info!("Quantized {} linear layers to {}", quantized, q);
        }

        Ok(Self {
            model_id: model_id.to_string(),
            config,
            kind,
            dtype,
            device: device.clone(),
            device_map,
            quantization,
            layers,
            adapters: VarMap::new(),
            lora_config: None,
            gradient_checkpointing: false,
            input_require_grads: false,
            fused_attention: false,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn config(&self) -> &HubModelConfig {
        &self.config
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_map(&self) -> &DeviceMap {
        &self.device_map
    }

    pub fn quantization(&self) -> Option<Quantization> {
        self.quantization
    }

    /// Layers in name order
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub fn require_layer(&self, name: &str) -> Result<&Layer> {
        self.layers
            .get(name)
            .ok_or_else(|| anyhow!("Layer {} not found in {}", name, self.model_id))
    }

    pub fn require_layer_mut(&mut self, name: &str) -> Result<&mut Layer> {
        let model_id = &self.model_id;
        self.layers
            .get_mut(name)
            .ok_or_else(|| anyhow!("Layer {} not found in {}", name, model_id))
    }

    /// LoRA variables under their peft names
    pub fn adapters(&self) -> &VarMap {
        &self.adapters
    }

    pub fn lora_config(&self) -> Option<&LoraConfig> {
        self.lora_config.as_ref()
    }

    pub(crate) fn set_lora_config(&mut self, config: LoraConfig) {
        self.lora_config = Some(config);
    }

    pub(crate) fn clear_lora_config(&mut self) {
        self.lora_config = None;
    }

    pub fn is_gradient_checkpointing(&self) -> bool {
        self.gradient_checkpointing
    }

    pub fn input_require_grads(&self) -> bool {
        self.input_require_grads
    }

    pub fn fused_attention(&self) -> bool {
        self.fused_attention
    }

    pub fn gradient_checkpointing_enable(&mut self) {
        tracing::info!("Gradient checkpointing enabled");
        self.gradient_checkpointing = true;
    }

    /// Let gradients flow back to the input embeddings
    pub fn enable_input_require_grads(&mut self) {
        self.input_require_grads = true;
    }

    /// Run attention through fused kernels (inference only)
    pub fn enable_fused_attention(&mut self) {
        tracing::info!("Fused attention enabled for {}", self.model_id);
        self.fused_attention = true;
    }

    /// Grow or shrink the token embedding tables to `new_len` rows
    ///
    /// Added rows are the mean of the existing rows. Untied output
    /// projections are resized together with the input embedding.
    pub fn resize_token_embeddings(&mut self, new_len: usize) -> Result<usize> {
        if new_len == 0 {
            anyhow::bail!("Cannot resize token embeddings to 0 rows");
        }

        let targets: Vec<String> = self
            .layers
            .values()
            .filter(|layer| {
                let last = last_component(layer.name());
                (layer.kind() == LayerKind::Embedding && TOKEN_EMBEDDING_MODULES.contains(&last))
                    || (layer.kind() == LayerKind::Linear && OUTPUT_MODULES.contains(&last))
            })
            .map(|layer| layer.name().to_string())
            .collect();

        if !targets.iter().any(|name| {
            TOKEN_EMBEDDING_MODULES.contains(&last_component(name))
        }) {
            anyhow::bail!("Model {} has no token embedding to resize", self.model_id);
        }

        for name in &targets {
            let layer = self.require_layer_mut(name)?;
            let weight = layer.weight.tensor()?;
            let (rows, _) = weight.dims2()?;
            layer.weight = layer.weight.replaced(resize_rows(&weight, new_len)?)?;

            if let Some(bias) = &layer.bias {
                let bias_tensor = bias.tensor()?;
                if bias_tensor.dims() == [rows] {
                    let resized = if new_len <= rows {
                        bias_tensor.narrow(0, 0, new_len)?
                    } else {
                        let extra = Tensor::zeros(new_len - rows, bias_tensor.dtype(), bias_tensor.device())?;
                        Tensor::cat(&[&bias_tensor, &extra], 0)?
                    };
                    layer.bias = Some(bias.replaced(resized)?);
                }
            }
            tracing::debug!("Resized {} from {} to {} rows", name, rows, new_len);
        }

        self.config.vocab_size = Some(new_len);
        Ok(targets.len())
    }

    /// Freeze the base model for adapter training on quantized weights
    ///
    /// Half-precision dense weights are upcast to F32 and input gradients are
    /// enabled.
    pub fn prepare_for_kbit_training(&mut self, use_gradient_checkpointing: bool) -> Result<()> {
        let mut upcast = false;
        for layer in self.layers.values_mut() {
            let (weight, weight_upcast) = freeze_upcast(&layer.weight)?;
            layer.weight = weight;
            upcast |= weight_upcast;
            if let Some(bias) = &layer.bias {
                let (bias, bias_upcast) = freeze_upcast(bias)?;
                layer.bias = Some(bias);
                upcast |= bias_upcast;
            }
        }
        if upcast {
            tracing::info!("Upcast half-precision weights from {} to float32", dtype_name(self.dtype));
            self.dtype = DType::F32;
        }

        self.enable_input_require_grads();
        if use_gradient_checkpointing {
            self.gradient_checkpointing_enable();
        }
        Ok(())
    }

    /// Make every dense base weight trainable
    pub fn enable_full_training(&mut self) -> Result<()> {
        for layer in self.layers.values_mut() {
            if let WeightStorage::Frozen(t) = &layer.weight {
                if t.dtype().is_float() {
                    layer.weight = WeightStorage::Trainable(Var::from_tensor(t)?);
                }
            }
            if let Some(WeightStorage::Frozen(t)) = &layer.bias {
                layer.bias = Some(WeightStorage::Trainable(Var::from_tensor(t)?));
            }
        }
        Ok(())
    }

    /// Variables an optimizer should update
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = self
            .layers
            .values()
            .flat_map(|layer| [Some(&layer.weight), layer.bias.as_ref()])
            .flatten()
            .filter_map(|w| match w {
                WeightStorage::Trainable(v) => Some(v.clone()),
                _ => None,
            })
            .collect();
        vars.extend(
            self.layers
                .values()
                .filter_map(|layer| layer.lora())
                .filter(|lora| lora.is_trainable())
                .flat_map(|lora| lora.vars().into_iter().cloned()),
        );
        vars
    }

    /// All parameters including adapters
    pub fn num_parameters(&self) -> usize {
        self.layers
            .values()
            .map(|layer| layer.num_params() + layer.lora().map_or(0, |l| l.num_params()))
            .sum()
    }

    pub fn num_trainable_parameters(&self) -> usize {
        self.layers.values().map(|layer| layer.num_trainable_params()).sum()
    }

    /// Bytes held by weights, biases and adapters
    pub fn memory_footprint(&self) -> usize {
        self.layers.values().map(|layer| layer.size_in_bytes()).sum()
    }

    /// Layer counts per kind
    pub fn layer_summary(&self) -> BTreeMap<String, usize> {
        let mut summary = BTreeMap::new();
        for layer in self.layers.values() {
            *summary.entry(layer.kind().to_string()).or_insert(0) += 1;
        }
        summary
    }

    pub(crate) fn log_summary(&self) {
        tracing::info!("Model dtype: {}", dtype_name(self.dtype));
        tracing::info!(
            "Total model memory footprint: {} MB",
            self.memory_footprint() as f64 / 1e6
        );
    }
}

fn resize_rows(weight: &Tensor, new_len: usize) -> Result<Tensor> {
    let (rows, cols) = weight.dims2()?;
    if new_len <= rows {
        return Ok(weight.narrow(0, 0, new_len)?);
    }
    let mean = weight.to_dtype(DType::F32)?.mean_keepdim(0)?;
    let extra = mean
        .broadcast_as((new_len - rows, cols))?
        .to_dtype(weight.dtype())?
        .contiguous()?;
    Ok(Tensor::cat(&[weight, &extra], 0)?)
}

/// Frozen copy of `storage`, and whether it was upcast from half precision
fn freeze_upcast(storage: &WeightStorage) -> Result<(WeightStorage, bool)> {
    match storage {
        WeightStorage::Quantized(q) => Ok((WeightStorage::Quantized(q.clone()), false)),
        dense => {
            let tensor = dense.tensor()?;
            match tensor.dtype() {
                DType::F16 | DType::BF16 => Ok((WeightStorage::Frozen(tensor.to_dtype(DType::F32)?), true)),
                _ => Ok((WeightStorage::Frozen(tensor.detach()), false)),
            }
        }
    }
}

/// `(trainable, total, percent trainable)` over every parameter
pub fn get_trainable_parameters(model: &LoadedModel) -> (usize, usize, f64) {
    let trainable = model.num_trainable_parameters();
    let total = model.num_parameters();
    let percent = if total == 0 {
        0.0
    } else {
        100.0 * trainable as f64 / total as f64
    };
    (trainable, total, percent)
}
