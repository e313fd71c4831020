//! # lmprep
//!
//! Loading helpers for fine-tuning and serving language models, and tooling
//! for named-entity recognition datasets.
//!
//! ## Overview
//!
//! - Device-map selection from process placement hints
//! - 4/8-bit weight quantization
//! - Decoder-only and encoder-decoder model-type lookup
//! - LoRA adapters: injection, peft-format loading and saving, merging
//! - Tagged NER files: reading, writing and seeded validation/test splits
//!
//! ## Architecture
//!
//! - `data` - Tagged NER format and dataset splitting
//! - `training` - Model, tokenizer and adapter loading with Candle
//! - `cli` - Command-line interface

pub mod cli;
pub mod data;
pub mod training;

// Re-export commonly used types
pub use anyhow::{Error, Result};
