//! HuggingFace Hub integration
//!
//! Resolves a model or adapter identifier to local files. Identifiers that
//! look like paths are read from disk; anything else is downloaded from the
//! Hub (and cached by `hf-hub`).

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::{Api, ApiRepo};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Single-file safetensors weights
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// Index of sharded safetensors weights
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
/// peft adapter configuration
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
/// peft adapter weights
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// HuggingFace Hub API wrapper
pub struct HubApi {
    api: Api,
}

impl HubApi {
    /// Create a new HubApi instance
    pub fn new() -> Result<Self> {
        let api = Api::new().context("Failed to initialize HuggingFace Hub API")?;
        Ok(Self { api })
    }

    /// Download config, weights and tokenizer files of a model
    pub fn download_model(&self, model_id: &str) -> Result<ModelPath> {
        tracing::info!("Downloading model from HuggingFace Hub: {}", model_id);

        let repo = self.api.model(model_id.to_string());

        let config_path = repo
            .get("config.json")
            .with_context(|| format!("Failed to download config.json for {}", model_id))?;

        let weights_files = if let Ok(path) = repo.get(WEIGHTS_FILE) {
            tracing::debug!("Downloaded {}: {:?}", WEIGHTS_FILE, path);
            vec![path]
        } else if let Ok(index_path) = repo.get(WEIGHTS_INDEX_FILE) {
            download_shards(&repo, &index_path)?
        } else {
            return Err(anyhow!(
                "No safetensors weights found for {} (tried {} and {})",
                model_id,
                WEIGHTS_FILE,
                WEIGHTS_INDEX_FILE
            ));
        };

        let tokenizer_file = repo.get("tokenizer.json").ok();
        let tokenizer_config_file = repo.get("tokenizer_config.json").ok();

        let model_dir = config_path
            .parent()
            .ok_or_else(|| anyhow!("Invalid config path"))?
            .to_path_buf();

        Ok(ModelPath {
            path: model_dir,
            model_id: model_id.to_string(),
            is_local: false,
            config_file: config_path,
            weights_files,
            tokenizer_file,
            tokenizer_config_file,
        })
    }

    /// Download a LoRA adapter
    pub fn download_adapter(&self, adapter_id: &str) -> Result<AdapterPath> {
        tracing::info!("Downloading LoRA adapter from HuggingFace Hub: {}", adapter_id);

        let repo = self.api.model(adapter_id.to_string());
        let config_file = repo
            .get(ADAPTER_CONFIG_FILE)
            .with_context(|| format!("Failed to download {} for {}", ADAPTER_CONFIG_FILE, adapter_id))?;
        let weights_file = repo
            .get(ADAPTER_WEIGHTS_FILE)
            .with_context(|| format!("Failed to download {} for {}", ADAPTER_WEIGHTS_FILE, adapter_id))?;

        Ok(AdapterPath {
            config_file,
            weights_file,
        })
    }
}

fn download_shards(repo: &ApiRepo, index_path: &Path) -> Result<Vec<PathBuf>> {
    shard_names(index_path)?
        .into_iter()
        .map(|name| {
            repo.get(&name)
                .with_context(|| format!("Failed to download weight shard {}", name))
        })
        .collect()
}

/// Distinct shard file names listed in a safetensors index, sorted
pub fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(index_path)
        .with_context(|| format!("Failed to read weight index: {:?}", index_path))?;
    let index: serde_json::Value =
        serde_json::from_str(&content).context("Failed to parse weight index")?;

    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("Weight index {:?} has no weight_map", index_path))?;

    let names: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();

    if names.is_empty() {
        anyhow::bail!("Weight index {:?} lists no shards", index_path);
    }
    Ok(names.into_iter().collect())
}

/// Represents a downloaded or local model path
#[derive(Debug, Clone)]
pub struct ModelPath {
    /// Root directory containing model files
    pub path: PathBuf,
    /// Model ID or path as given by the caller
    pub model_id: String,
    /// Whether this is a local path (not downloaded from Hub)
    pub is_local: bool,
    /// Path to config.json
    pub config_file: PathBuf,
    /// Safetensors weight files (one, or every shard)
    pub weights_files: Vec<PathBuf>,
    /// Path to tokenizer.json (optional)
    pub tokenizer_file: Option<PathBuf>,
    /// Path to tokenizer_config.json (optional)
    pub tokenizer_config_file: Option<PathBuf>,
}

impl ModelPath {
    /// Create a ModelPath from a local directory
    pub fn from_local(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.is_dir() {
            return Err(anyhow!("Model directory does not exist: {:?}", path));
        }

        let config_file = path.join("config.json");
        if !config_file.exists() {
            return Err(anyhow!("config.json not found in {:?}", path));
        }

        let weights_files = if path.join(WEIGHTS_FILE).exists() {
            vec![path.join(WEIGHTS_FILE)]
        } else if path.join(WEIGHTS_INDEX_FILE).exists() {
            shard_names(&path.join(WEIGHTS_INDEX_FILE))?
                .into_iter()
                .map(|name| path.join(name))
                .collect()
        } else {
            return Err(anyhow!(
                "No safetensors weights found in {:?} (tried {} and {})",
                path,
                WEIGHTS_FILE,
                WEIGHTS_INDEX_FILE
            ));
        };

        let existing = |name: &str| Some(path.join(name)).filter(|p| p.exists());

        Ok(Self {
            model_id: path.to_string_lossy().to_string(),
            tokenizer_file: existing("tokenizer.json"),
            tokenizer_config_file: existing("tokenizer_config.json"),
            path: path.clone(),
            is_local: true,
            config_file,
            weights_files,
        })
    }

    /// Validate that all required files exist
    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!("Config file not found: {:?}", self.config_file));
        }
        for file in &self.weights_files {
            if !file.exists() {
                return Err(anyhow!("Weights file not found: {:?}", file));
            }
        }
        Ok(())
    }
}

/// Files of a LoRA adapter
#[derive(Debug, Clone)]
pub struct AdapterPath {
    pub config_file: PathBuf,
    pub weights_file: PathBuf,
}

impl AdapterPath {
    /// Create an AdapterPath from a local directory
    pub fn from_local(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_file = path.join(ADAPTER_CONFIG_FILE);
        let weights_file = path.join(ADAPTER_WEIGHTS_FILE);

        if !config_file.exists() {
            return Err(anyhow!("{} not found in {:?}", ADAPTER_CONFIG_FILE, path));
        }
        if !weights_file.exists() {
            return Err(anyhow!("{} not found in {:?}", ADAPTER_WEIGHTS_FILE, path));
        }

        Ok(Self {
            config_file,
            weights_file,
        })
    }
}

/// Configuration from HuggingFace model's config.json
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct HubModelConfig {
    /// Model architectures (e.g., ["LlamaForCausalLM"])
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Model type (e.g., "llama", "t5")
    pub model_type: Option<String>,

    /// Vocabulary size
    pub vocab_size: Option<usize>,

    /// Hidden size
    pub hidden_size: Option<usize>,

    /// Number of hidden layers
    pub num_hidden_layers: Option<usize>,

    /// Stored weight dtype (e.g., "bfloat16")
    pub torch_dtype: Option<String>,

    /// Whether the output projection shares the input embedding
    pub tie_word_embeddings: Option<bool>,

    /// Encoder-decoder flag
    #[serde(default)]
    pub is_encoder_decoder: bool,

    /// Padding token ID
    pub pad_token_id: Option<u32>,

    /// Any extra fields we don't explicitly handle
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl HubModelConfig {
    /// Load config from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        serde_json::from_str(&content).context("Failed to parse config.json")
    }

    /// The `model_type` field, required for picking a model head
    pub fn require_model_type(&self) -> Result<&str> {
        self.model_type.as_deref().ok_or_else(|| {
            anyhow!(
                "config.json has no model_type. Architectures: {:?}",
                self.architectures
            )
        })
    }

    /// Whether the output projection shares the input embedding (HF default: true)
    pub fn ties_word_embeddings(&self) -> bool {
        self.tie_word_embeddings.unwrap_or(true)
    }
}

/// Model loader that handles both local and HuggingFace models
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelLoader;

impl ModelLoader {
    pub fn new() -> Self {
        Self
    }

    fn is_local(id_or_path: &str) -> bool {
        Path::new(id_or_path).exists()
            || id_or_path.starts_with('.')
            || id_or_path.starts_with('/')
            || id_or_path.starts_with('~')
    }

    /// Load model path - auto-detects local vs HuggingFace
    ///
    /// If the path exists locally, or looks like a path, it is read from
    /// disk. Otherwise it is treated as a Hub model ID.
    pub fn load_model_path(&self, model_id_or_path: &str) -> Result<ModelPath> {
        if Self::is_local(model_id_or_path) {
            if !Path::new(model_id_or_path).exists() {
                return Err(anyhow!(
                    "Local model path does not exist: {}",
                    model_id_or_path
                ));
            }
            tracing::info!("Loading model from local path: {}", model_id_or_path);
            let mut model_path = ModelPath::from_local(model_id_or_path)?;
            model_path.model_id = model_id_or_path.to_string();
            Ok(model_path)
        } else {
            HubApi::new()?.download_model(model_id_or_path)
        }
    }

    /// Load adapter path - auto-detects local vs HuggingFace
    pub fn load_adapter_path(&self, adapter_id_or_path: &str) -> Result<AdapterPath> {
        if Self::is_local(adapter_id_or_path) {
            if !Path::new(adapter_id_or_path).exists() {
                return Err(anyhow!(
                    "Local adapter path does not exist: {}",
                    adapter_id_or_path
                ));
            }
            AdapterPath::from_local(adapter_id_or_path)
        } else {
            HubApi::new()?.download_adapter(adapter_id_or_path)
        }
    }

    /// Load config from a model (local or HuggingFace)
    pub fn load_config(&self, model_id_or_path: &str) -> Result<HubModelConfig> {
        let model_path = self.load_model_path(model_id_or_path)?;
        HubModelConfig::from_file(&model_path.config_file)
    }
}
