//! Quantization settings
//!
//! Weights can be loaded in 4-bit or 8-bit precision. The user-facing
//! configuration keeps the bitsandbytes vocabulary (`load_in_4bit`,
//! `nf4`, double quantization) so configs written for Python tooling read the
//! same; [`QuantizationConfig::ggml_dtype`] maps it onto the block formats
//! Candle stores quantized tensors in.

use anyhow::Result;
use candle_core::quantized::GgmlDType;
use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Supported weight quantization widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BitsValue", into = "u8")]
pub enum Quantization {
    FourBit,
    EightBit,
}

impl Quantization {
    /// Validate a bit width
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            4 => Ok(Self::FourBit),
            8 => Ok(Self::EightBit),
            other => Err(invalid_quantization(other)),
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            Self::FourBit => 4,
            Self::EightBit => 8,
        }
    }
}

fn invalid_quantization(value: impl std::fmt::Display) -> anyhow::Error {
    anyhow::anyhow!(
        "Quantization must be 4 or 8, or None for FP32/FP16 training. You passed: {}",
        value
    )
}

impl std::str::FromStr for Quantization {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bits: u8 = s.trim().parse().map_err(|_| invalid_quantization(s))?;
        Self::from_bits(bits)
    }
}

impl std::fmt::Display for Quantization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Configs may spell the width as `4` or `"4"`
#[derive(Deserialize)]
#[serde(untagged)]
enum BitsValue {
    Number(u8),
    Text(String),
}

impl TryFrom<BitsValue> for Quantization {
    type Error = anyhow::Error;

    fn try_from(value: BitsValue) -> Result<Self> {
        match value {
            BitsValue::Number(bits) => Self::from_bits(bits),
            BitsValue::Text(text) => text.parse(),
        }
    }
}

impl From<Quantization> for u8 {
    fn from(q: Quantization) -> u8 {
        q.bits()
    }
}

/// Requested weight dtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DTypeSpec {
    /// Use the dtype recorded in the model config
    Auto,
    Named(DType),
}

impl DTypeSpec {
    /// Resolve against the model config's `torch_dtype` field
    pub fn resolve(spec: Option<Self>, config_dtype: Option<&str>) -> Result<DType> {
        match spec {
            Some(Self::Named(dtype)) => Ok(dtype),
            Some(Self::Auto) => match config_dtype {
                Some(name) => parse_dtype(name),
                None => Ok(DType::F32),
            },
            None => Ok(DType::F32),
        }
    }
}

/// Parse a dtype name, accepting both torch and candle spellings
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.trim().to_lowercase().as_str() {
        "float32" | "f32" | "float" => Ok(DType::F32),
        "float16" | "f16" | "half" => Ok(DType::F16),
        "bfloat16" | "bf16" => Ok(DType::BF16),
        "float64" | "f64" | "double" => Ok(DType::F64),
        other => anyhow::bail!(
            "Unsupported dtype: {}. Supported: auto, float32, float16, bfloat16, float64",
            other
        ),
    }
}

/// Torch-style dtype name used in logs and serialized configs
pub fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "float32",
        DType::F16 => "float16",
        DType::BF16 => "bfloat16",
        DType::F64 => "float64",
        DType::U8 => "uint8",
        DType::U32 => "uint32",
        DType::I64 => "int64",
    }
}

impl std::str::FromStr for DTypeSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            Ok(Self::Named(parse_dtype(s)?))
        }
    }
}

impl TryFrom<String> for DTypeSpec {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DTypeSpec> for String {
    fn from(spec: DTypeSpec) -> String {
        spec.to_string()
    }
}

impl std::fmt::Display for DTypeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Named(dtype) => write!(f, "{}", dtype_name(*dtype)),
        }
    }
}

/// Quantization configuration in bitsandbytes terms
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuantizationConfig {
    pub load_in_4bit: bool,
    pub load_in_8bit: bool,
    pub bnb_4bit_use_double_quant: bool,
    pub bnb_4bit_quant_type: String,
    #[serde(serialize_with = "serialize_dtype")]
    pub bnb_4bit_compute_dtype: DType,
}

fn serialize_dtype<S: serde::Serializer>(dtype: &DType, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(dtype_name(*dtype))
}

impl QuantizationConfig {
    /// Build the config for a quantization width
    ///
    /// 4-bit uses NF4 with double quantization. The compute dtype is the
    /// requested dtype, or bfloat16 when none (or `auto`) was requested.
    pub fn new(quantization: Quantization, requested: Option<DTypeSpec>) -> Self {
        match quantization {
            Quantization::FourBit => Self {
                load_in_4bit: true,
                load_in_8bit: false,
                bnb_4bit_use_double_quant: true,
                bnb_4bit_quant_type: "nf4".to_string(),
                bnb_4bit_compute_dtype: match requested {
                    Some(DTypeSpec::Named(dtype)) => dtype,
                    Some(DTypeSpec::Auto) | None => DType::BF16,
                },
            },
            Quantization::EightBit => Self {
                load_in_4bit: false,
                load_in_8bit: true,
                bnb_4bit_use_double_quant: false,
                bnb_4bit_quant_type: "fp4".to_string(),
                bnb_4bit_compute_dtype: DType::F32,
            },
        }
    }

    pub fn quantization(&self) -> Quantization {
        if self.load_in_4bit {
            Quantization::FourBit
        } else {
            Quantization::EightBit
        }
    }

    /// Storage format for a linear layer with `in_features` inputs
    ///
    /// Returns `None` when the input width is not a multiple of the block
    /// size; such layers stay unquantized. K-quants quantize their block
    /// scales as well, which is what double quantization asks for.
    pub fn ggml_dtype(&self, in_features: usize) -> Option<GgmlDType> {
        let candidates: &[GgmlDType] = match self.quantization() {
            Quantization::EightBit => &[GgmlDType::Q8_0],
            Quantization::FourBit if self.bnb_4bit_use_double_quant => {
                &[GgmlDType::Q4K, GgmlDType::Q4_0]
            }
            Quantization::FourBit => &[GgmlDType::Q4_0],
        };

        candidates
            .iter()
            .copied()
            .find(|dtype| in_features > 0 && in_features % dtype.block_size() == 0)
    }

    /// Pretty JSON for logging
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
