//! Command-line interface
//!
//! Provides CLI commands for counting, splitting, model inspection and device listing.

use crate::data::{read_conll_file, SplitConfig, TaggedDataset};
use crate::training::device::{device_label, print_available_devices};
use crate::training::models::{
    get_trainable_parameters, load_model_for_inference, load_model_for_training,
    InferenceLoadOptions, LmTokenizer, LoadedModel, TrainingLoadOptions,
};
use crate::training::quantization::dtype_name;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// How `inspect` loads the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LoadMode {
    Training,
    Inference,
}

/// Execute the count command
pub fn count(inputs: Vec<String>) -> Result<()> {
    if inputs.is_empty() {
        anyhow::bail!("No input files given");
    }

    let mut total = 0;
    for input in &inputs {
        let sentences = read_conll_file(input)?;
        tracing::info!("{}: {} sentences", input, sentences.len());
        println!("{}\t{}", input, sentences.len());
        total += sentences.len();
    }

    if inputs.len() > 1 {
        println!("total\t{}", total);
    }
    Ok(())
}

/// Paths written by the split command
#[derive(Debug, Clone)]
pub struct SplitOutputs {
    pub validation: PathBuf,
    pub test: PathBuf,
    pub validation_rows: usize,
    pub test_rows: usize,
}

/// Split a tagged file into validation and test files
pub fn split_file(
    input: &Path,
    output_dir: &Path,
    config: &SplitConfig,
    val_name: &str,
    test_name: &str,
    jsonl: bool,
) -> Result<SplitOutputs> {
    let dataset = TaggedDataset::from_conll_file(input)?;
    tracing::info!("Loaded {} sentences from {:?}", dataset.len(), input);

    let (validation, test) = dataset.split_validation_test(config)?;
    tracing::info!(
        "Split into {} validation and {} test sentences (seed {})",
        validation.len(),
        test.len(),
        config.seed
    );

    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

    let validation_path = validation.write_conll(output_dir, val_name)?;
    let test_path = test.write_conll(output_dir, test_name)?;

    if jsonl {
        validation.to_jsonl(output_dir.join(format!("{}.jsonl", val_name)))?;
        test.to_jsonl(output_dir.join(format!("{}.jsonl", test_name)))?;
    }

    Ok(SplitOutputs {
        validation: validation_path,
        test: test_path,
        validation_rows: validation.len(),
        test_rows: test.len(),
    })
}

/// Execute the split command
pub fn split(
    input: String,
    output_dir: String,
    val_fraction: f64,
    seed: u64,
    val_name: String,
    test_name: String,
    jsonl: bool,
) -> Result<()> {
    tracing::info!("Starting split");
    tracing::info!("  Input: {}", input);
    tracing::info!("  Output: {}", output_dir);
    tracing::info!("  Validation fraction: {}", val_fraction);

    let config = SplitConfig {
        validation_fraction: val_fraction,
        seed,
    };
    let outputs = split_file(
        Path::new(&input),
        Path::new(&output_dir),
        &config,
        &val_name,
        &test_name,
        jsonl,
    )?;

    println!("\nSplit Summary:");
    println!("  Validation: {} sentences -> {:?}", outputs.validation_rows, outputs.validation);
    println!("  Test: {} sentences -> {:?}", outputs.test_rows, outputs.test);
    Ok(())
}

fn print_model_summary(model: &LoadedModel, tokenizer: &LmTokenizer) {
    let (trainable, total, percent) = get_trainable_parameters(model);

    println!("\nModel Summary:");
    println!("  Model: {}", model.model_id());
    println!("  Kind: {}", model.kind());
    println!("  Device map: {} ({})", model.device_map(), device_label(model.device()));
    println!("  Dtype: {}", dtype_name(model.dtype()));
    if let Some(q) = model.quantization() {
        println!("  Quantization: {}", q);
    }
    println!("  Memory footprint: {:.2} MB", model.memory_footprint() as f64 / 1e6);
    println!("  Parameters: {} ({} trainable, {:.4}%)", total, trainable, percent);
    for (kind, count) in model.layer_summary() {
        println!("    {}: {}", kind, count);
    }
    if let Some(lora) = model.lora_config() {
        println!(
            "  LoRA: rank {}, alpha {}, targets {:?}",
            lora.rank, lora.alpha, lora.target_modules
        );
    }
    println!("  Tokenizer: {} tokens, padding {}", tokenizer.len(), tokenizer.padding_side());
    println!("  Pad token id: {:?}", tokenizer.pad_token_id());
}

/// Execute the inspect command
pub fn inspect(config: String, mode: LoadMode) -> Result<()> {
    tracing::info!("Inspecting model with options from {}", config);

    let (model, tokenizer) = match mode {
        LoadMode::Training => load_model_for_training(&TrainingLoadOptions::from_file(&config)?)?,
        LoadMode::Inference => load_model_for_inference(&InferenceLoadOptions::from_file(&config)?)?,
    };

    print_model_summary(&model, &tokenizer);
    Ok(())
}

/// Execute the devices command
pub fn devices() -> Result<()> {
    print_available_devices();
    Ok(())
}
