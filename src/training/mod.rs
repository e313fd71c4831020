//! Model loading for fine-tuning and inference
//!
//! Loads decoder-only and encoder-decoder language models with Candle,
//! optionally quantized to 4 or 8 bits and wrapped with LoRA adapters.
//!
//! For GPU support:
//! ```bash
//! cargo build --features cuda    # NVIDIA GPU
//! cargo build --features metal   # Apple GPU
//! ```
//!
//! # Modules
//!
//! - `device` - CPU/CUDA/Metal device abstraction
//! - `device_map` - Placement strategy from launcher environment variables
//! - `quantization` - Bit width and quantization config
//! - `registry` - Supported model types
//! - `hub` - HuggingFace Hub integration
//! - `models` - Loaded model, tokenizer and loader entry points
//! - `lora` - LoRA adapter implementation

pub mod device;
pub mod device_map;
pub mod hub;
pub mod lora;
pub mod models;
pub mod quantization;
pub mod registry;

// Re-exports
pub use device::{select_device, DevicePreference};
pub use device_map::{get_device_map, DeviceMap, PlacementEnv};
pub use hub::{HubApi, HubModelConfig, ModelLoader, ModelPath};
pub use lora::{find_all_linear_names, LoraAdapter, LoraConfig};
pub use models::{
    get_trainable_parameters, load_model_for_inference, load_model_for_training,
    InferenceLoadOptions, LmTokenizer, LoadedModel, TrainingLoadOptions,
};
pub use quantization::{DTypeSpec, Quantization, QuantizationConfig};
pub use registry::{classify_model_type, ModelKind, PaddingSide};
