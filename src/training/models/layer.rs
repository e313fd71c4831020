//! Named layers of a loaded model

use anyhow::{anyhow, Result};
use candle_core::quantized::QTensor;
use candle_core::{DType, Shape, Tensor, Var};
use std::sync::Arc;

use crate::training::lora::LoraAdapter;

/// Layer class, decided from the weight's name and rank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Linear,
    /// Linear layer with 4-bit quantized weight
    Linear4bit,
    /// Linear layer with 8-bit quantized weight
    Linear8bit,
    Embedding,
    Norm,
    Other,
}

impl LayerKind {
    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Linear | Self::Linear4bit | Self::Linear8bit)
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Linear4bit | Self::Linear8bit)
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => write!(f, "Linear"),
            Self::Linear4bit => write!(f, "Linear4bit"),
            Self::Linear8bit => write!(f, "Linear8bit"),
            Self::Embedding => write!(f, "Embedding"),
            Self::Norm => write!(f, "Norm"),
            Self::Other => write!(f, "Other"),
        }
    }
}

/// How a parameter is held
pub enum WeightStorage {
    /// Dense, excluded from gradients
    Frozen(Tensor),
    /// Dense, tracked for gradients
    Trainable(Var),
    /// Block-quantized, always frozen
    Quantized(Arc<QTensor>),
}

impl std::fmt::Debug for WeightStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frozen(t) => write!(f, "Frozen({:?}, {:?})", t.shape(), t.dtype()),
            Self::Trainable(v) => write!(f, "Trainable({:?}, {:?})", v.shape(), v.dtype()),
            Self::Quantized(q) => write!(f, "Quantized({:?}, {:?})", q.shape(), q.dtype()),
        }
    }
}

impl WeightStorage {
    pub fn shape(&self) -> Shape {
        match self {
            Self::Frozen(t) => t.shape().clone(),
            Self::Trainable(v) => v.shape().clone(),
            Self::Quantized(q) => q.shape().clone(),
        }
    }

    pub fn elem_count(&self) -> usize {
        self.shape().elem_count()
    }

    /// Bytes held by this parameter (packed size for quantized weights)
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Frozen(t) => t.elem_count() * t.dtype().size_in_bytes(),
            Self::Trainable(v) => v.elem_count() * v.dtype().size_in_bytes(),
            Self::Quantized(q) => q.storage_size_in_bytes(),
        }
    }

    pub fn is_trainable(&self) -> bool {
        matches!(self, Self::Trainable(_))
    }

    /// Dense dtype, `None` for quantized storage
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::Frozen(t) => Some(t.dtype()),
            Self::Trainable(v) => Some(v.dtype()),
            Self::Quantized(_) => None,
        }
    }

    /// Dense view (dequantized for quantized storage)
    pub fn tensor(&self) -> Result<Tensor> {
        match self {
            Self::Frozen(t) => Ok(t.clone()),
            Self::Trainable(v) => Ok(v.as_tensor().clone()),
            Self::Quantized(q) => Ok(q.dequantize(&q.device())?),
        }
    }

    /// Replace the dense value, keeping frozen/trainable state
    pub(crate) fn replaced(&self, tensor: Tensor) -> Result<Self> {
        match self {
            Self::Frozen(_) => Ok(Self::Frozen(tensor)),
            Self::Trainable(_) => Ok(Self::Trainable(Var::from_tensor(&tensor)?)),
            Self::Quantized(_) => Err(anyhow!("Cannot replace a quantized weight")),
        }
    }
}

/// One module of the model: a weight, an optional bias and an optional adapter
pub struct Layer {
    name: String,
    kind: LayerKind,
    pub(crate) weight: WeightStorage,
    pub(crate) bias: Option<WeightStorage>,
    lora: Option<LoraAdapter>,
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("weight", &self.weight)
            .field("bias", &self.bias)
            .field("lora", &self.lora.as_ref().map(|l| l.rank()))
            .finish()
    }
}

impl Layer {
    pub fn new(
        name: impl Into<String>,
        kind: LayerKind,
        weight: WeightStorage,
        bias: Option<WeightStorage>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            weight,
            bias,
            lora: None,
        }
    }

    /// Full dotted module name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn weight(&self) -> &WeightStorage {
        &self.weight
    }

    pub fn bias(&self) -> Option<&WeightStorage> {
        self.bias.as_ref()
    }

    pub fn lora(&self) -> Option<&LoraAdapter> {
        self.lora.as_ref()
    }

    pub(crate) fn lora_mut(&mut self) -> Option<&mut LoraAdapter> {
        self.lora.as_mut()
    }

    pub(crate) fn set_lora(&mut self, lora: Option<LoraAdapter>) {
        self.lora = lora;
    }

    /// `(in_features, out_features)` of a linear layer
    pub fn linear_dims(&self) -> Result<(usize, usize)> {
        if !self.kind.is_linear() {
            anyhow::bail!("{} is a {} layer, not linear", self.name, self.kind);
        }
        let (out_features, in_features) = self.weight.shape().dims2()?;
        Ok((in_features, out_features))
    }

    /// Base parameters (weight and bias, without adapter)
    pub fn num_params(&self) -> usize {
        self.weight.elem_count() + self.bias.as_ref().map_or(0, |b| b.elem_count())
    }

    pub fn num_trainable_params(&self) -> usize {
        let base = [Some(&self.weight), self.bias.as_ref()]
            .into_iter()
            .flatten()
            .filter(|w| w.is_trainable())
            .map(|w| w.elem_count())
            .sum::<usize>();
        let adapter = self
            .lora
            .as_ref()
            .filter(|l| l.is_trainable())
            .map_or(0, |l| l.num_params());
        base + adapter
    }

    pub fn size_in_bytes(&self) -> usize {
        self.weight.size_in_bytes()
            + self.bias.as_ref().map_or(0, |b| b.size_in_bytes())
            + self.lora.as_ref().map_or(0, |l| l.size_in_bytes())
    }

    /// Apply a linear layer: x @ W^T + b, plus the adapter update
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !self.kind.is_linear() {
            anyhow::bail!("forward is only defined for linear layers, {} is {}", self.name, self.kind);
        }

        let weight = self.weight.tensor()?;
        let x_cast = x.to_dtype(weight.dtype())?;
        let mut out = x_cast.broadcast_matmul(&weight.t()?)?;
        if let Some(bias) = &self.bias {
            out = out.broadcast_add(&bias.tensor()?.to_dtype(out.dtype())?)?;
        }

        if let Some(lora) = &self.lora {
            let delta = lora.forward(x, train)?.to_dtype(out.dtype())?;
            out = (out + delta)?;
        }
        Ok(out)
    }

    /// Fold the adapter into a dense weight and drop it
    pub(crate) fn merge_lora(&mut self) -> Result<()> {
        let Some(lora) = self.lora.take() else {
            return Ok(());
        };
        let weight = self.weight.tensor()?;
        let merged = (weight.to_dtype(DType::F32)? + lora.delta_weight()?.to_dtype(DType::F32)?)?
            .to_dtype(weight.dtype())?;
        self.weight = self.weight.replaced(merged)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::lora::LoraConfig;
    use candle_core::quantized::GgmlDType;
    use candle_core::Device;

    fn linear(name: &str, w: &[[f32; 2]; 2]) -> Layer {
        let weight = Tensor::new(w, &Device::Cpu).unwrap();
        Layer::new(name, LayerKind::Linear, WeightStorage::Frozen(weight), None)
    }

    #[test]
    fn test_linear_forward_with_bias() {
        let mut layer = linear("proj", &[[1.0, 0.0], [0.0, 2.0]]);
        layer.bias = Some(WeightStorage::Frozen(
            Tensor::new(&[0.5f32, -1.0], &Device::Cpu).unwrap(),
        ));

        let x = Tensor::new(&[[3f32, 4.0]], &Device::Cpu).unwrap();
        let y = layer.forward(&x, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(y, vec![vec![3.5, 7.0]]);
        assert_eq!(layer.linear_dims().unwrap(), (2, 2));
        assert_eq!(layer.num_params(), 6);
        assert_eq!(layer.num_trainable_params(), 0);
    }

    #[test]
    fn test_merge_matches_adapted_forward() {
        let mut layer = linear("q_proj", &[[1.0, 2.0], [3.0, 4.0]]);
        let config = LoraConfig::new(1, 1.0);
        let a = Tensor::new(&[[1f32, 1.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[2f32], [0.0]], &Device::Cpu).unwrap();
        layer.set_lora(Some(LoraAdapter::from_tensors(&a, &b, &config).unwrap()));
        assert_eq!(layer.num_trainable_params(), 4);

        layer.lora_mut().unwrap().set_trainable(false);
        assert_eq!(layer.num_trainable_params(), 0);
        layer.lora_mut().unwrap().set_trainable(true);

        let x = Tensor::new(&[[1f32, -1.0]], &Device::Cpu).unwrap();
        let before = layer.forward(&x, false).unwrap().to_vec2::<f32>().unwrap();

        layer.merge_lora().unwrap();
        assert!(layer.lora().is_none());
        let w = layer.weight().tensor().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(w, vec![vec![3.0, 4.0], vec![3.0, 4.0]]);

        let after = layer.forward(&x, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_non_linear_layer_rejects_forward() {
        let weight = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
        let layer = Layer::new("model.norm", LayerKind::Norm, WeightStorage::Frozen(weight), None);
        assert!(layer.linear_dims().is_err());
        assert!(layer.forward(&Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap(), false).is_err());
    }

    #[test]
    fn test_quantized_storage() {
        let weight = Tensor::ones((4, 32), DType::F32, &Device::Cpu).unwrap();
        let q = QTensor::quantize(&weight, GgmlDType::Q8_0).unwrap();
        let storage = WeightStorage::Quantized(Arc::new(q));

        assert_eq!(storage.elem_count(), 128);
        assert!(storage.size_in_bytes() < 128 * 4);
        assert!(storage.dtype().is_none());
        assert!(storage.replaced(weight).is_err());

        let dense = storage.tensor().unwrap();
        assert_eq!(dense.dims(), &[4, 32]);
    }
}
