//! Loaded language models
//!
//! A model is held as a flat map of named layers read from its safetensors
//! weights, next to the tokenizer it was trained with. The loader entry points
//! put the pieces together for training or inference.

mod layer;
mod loader;
mod model;
mod tokenizer;

#[cfg(test)]
pub(crate) mod testing;

pub use layer::{Layer, LayerKind, WeightStorage};
pub use loader::{
    load_model_for_inference, load_model_for_inference_with, load_model_for_training,
    load_model_for_training_with, InferenceLoadOptions, TrainingLoadOptions,
};
pub use model::{get_trainable_parameters, LoadedModel};
pub use tokenizer::{
    BatchEncodedInput, LmTokenizer, PadTokenSource, SpecialTokens, TokenizerOptions, PADDING_TOKEN,
};
