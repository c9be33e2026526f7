//! HuggingFace Hub integration for model downloading
//!
//! Downloads checkpoints (single-file or sharded safetensors) and tokenizer
//! files, and resolves local model directories.

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::{Api, ApiBuilder};
use std::path::{Path, PathBuf};

/// Default environment variable holding the Hub access token
pub const DEFAULT_TOKEN_ENV: &str = "HF_TOKEN";

/// Hub client configuration
#[derive(Clone, Default)]
pub struct HubConfig {
    /// Access token for gated checkpoints. Resolved at run time, never logged.
    pub token: Option<String>,
    /// Override for the local cache directory
    pub cache_dir: Option<PathBuf>,
}

impl std::fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

impl HubConfig {
    /// Read the token from an environment variable (empty values count as unset)
    pub fn from_env(var_name: &str) -> Self {
        let token = std::env::var(var_name).ok().filter(|t| !t.trim().is_empty());
        if token.is_some() {
            tracing::info!("Using Hub token from ${}", var_name);
        } else {
            tracing::debug!("${} not set, using anonymous Hub access", var_name);
        }
        Self {
            token,
            cache_dir: None,
        }
    }

    /// Set the cache directory
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }
}

/// HuggingFace Hub API wrapper
pub struct HubApi {
    api: Api,
}

impl HubApi {
    /// Create a client with default settings
    pub fn new() -> Result<Self> {
        Self::with_config(&HubConfig::default())
    }

    /// Create a client from a config
    pub fn with_config(config: &HubConfig) -> Result<Self> {
        let mut builder = ApiBuilder::new();
        if let Some(token) = &config.token {
            builder = builder.with_token(Some(token.clone()));
        }
        if let Some(dir) = &config.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder
            .build()
            .context("Failed to initialize HuggingFace Hub API")?;
        Ok(Self { api })
    }

    /// Download a model from HuggingFace Hub
    ///
    /// Fetches `config.json`, the tokenizer files and either
    /// `model.safetensors` or every shard listed in
    /// `model.safetensors.index.json`.
    pub fn download_model(&self, model_id: &str) -> Result<ModelPath> {
        tracing::info!("Downloading model from HuggingFace Hub: {}", model_id);

        let repo = self.api.model(model_id.to_string());

        let config_path = repo
            .get("config.json")
            .with_context(|| format!("Failed to download config.json for {}", model_id))?;

        tracing::debug!("Downloaded config.json: {:?}", config_path);

        let weights_files = if let Ok(path) = repo.get("model.safetensors") {
            tracing::debug!("Downloaded model.safetensors: {:?}", path);
            vec![path]
        } else {
            let index_path = repo.get("model.safetensors.index.json").with_context(|| {
                format!(
                    "No safetensors weights found for {} (tried model.safetensors and model.safetensors.index.json)",
                    model_id
                )
            })?;

            let mut files = Vec::new();
            for shard in shard_names(&index_path)? {
                tracing::info!("  Fetching shard {}", shard);
                let path = repo
                    .get(&shard)
                    .with_context(|| format!("Failed to download {}", shard))?;
                files.push(path);
            }
            files
        };

        let tokenizer_path = repo.get("tokenizer.json").ok();
        let tokenizer_config_path = repo.get("tokenizer_config.json").ok();

        if tokenizer_path.is_some() {
            tracing::debug!("Downloaded tokenizer.json");
        }

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
            tokenizer_file: tokenizer_path,
            tokenizer_config_file: tokenizer_config_path,
        })
    }
}

/// Shard file names from a `model.safetensors.index.json`, sorted and deduplicated
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(index_path)
        .with_context(|| format!("Failed to read {:?}", index_path))?;
    let index: serde_json::Value =
        serde_json::from_str(&content).context("Failed to parse safetensors index")?;

    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("Safetensors index has no weight_map"))?;

    let mut shards: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    shards.sort();
    shards.dedup();
    Ok(shards)
}

/// Represents a downloaded or local model path
#[derive(Debug, Clone)]
pub struct ModelPath {
    /// Root directory containing model files
    pub path: PathBuf,
    /// Original model ID (e.g., "mistralai/Mistral-7B-Instruct-v0.1")
    pub model_id: String,
    /// Whether this is a local path (not downloaded from Hub)
    pub is_local: bool,
    /// Path to config.json
    pub config_file: PathBuf,
    /// Safetensors weight files (one, or every shard in order)
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

        if !path.exists() {
            return Err(anyhow!("Model directory does not exist: {:?}", path));
        }

        let config_file = path.join("config.json");
        if !config_file.exists() {
            return Err(anyhow!("config.json not found in {:?}", path));
        }

        let weights_files = find_weight_files(&path)?;

        let tokenizer_file = path.join("tokenizer.json");
        let tokenizer_config_file = path.join("tokenizer_config.json");

        Ok(Self {
            model_id: path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            path: path.clone(),
            is_local: true,
            config_file,
            weights_files,
            tokenizer_file: tokenizer_file.exists().then_some(tokenizer_file),
            tokenizer_config_file: tokenizer_config_file.exists().then_some(tokenizer_config_file),
        })
    }

    /// Validate that all required files exist
    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!("Config file not found: {:?}", self.config_file));
        }
        if self.weights_files.is_empty() {
            return Err(anyhow!("No weight files for {}", self.model_id));
        }
        for file in &self.weights_files {
            if !file.exists() {
                return Err(anyhow!("Weights file not found: {:?}", file));
            }
        }
        Ok(())
    }
}

/// Find weight files (handles both single and sharded safetensors)
fn find_weight_files(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let single_file = model_dir.join("model.safetensors");
    if single_file.exists() {
        return Ok(vec![single_file]);
    }

    let mut shards = Vec::new();
    for entry in std::fs::read_dir(model_dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "safetensors").unwrap_or(false) {
            if let Some(name) = path.file_name() {
                let name_str = name.to_string_lossy();
                if name_str.starts_with("model-") && name_str.contains("-of-") {
                    shards.push(path);
                }
            }
        }
    }

    if shards.is_empty() {
        anyhow::bail!("No model weight files found in {:?}", model_dir);
    }

    shards.sort();
    Ok(shards)
}

/// Model loader that handles both local and HuggingFace models
pub struct ModelLoader {
    hub: HubApi,
}

impl ModelLoader {
    /// Create a loader with an anonymous Hub client
    pub fn new() -> Result<Self> {
        Ok(Self {
            hub: HubApi::new()?,
        })
    }

    /// Create a loader from a Hub config
    pub fn with_config(config: &HubConfig) -> Result<Self> {
        Ok(Self {
            hub: HubApi::with_config(config)?,
        })
    }

    /// Load model path - auto-detects local vs HuggingFace
    ///
    /// If the path exists locally, treats it as a local directory.
    /// Otherwise, downloads from HuggingFace Hub.
    pub fn load_model_path(&self, model_id_or_path: &str) -> Result<ModelPath> {
        let local_path = Path::new(model_id_or_path);
        let looks_local = model_id_or_path.starts_with('.')
            || model_id_or_path.starts_with('/')
            || model_id_or_path.starts_with('~');

        if local_path.exists() {
            tracing::info!("Loading model from local path: {}", model_id_or_path);
            ModelPath::from_local(model_id_or_path)
        } else if looks_local {
            Err(anyhow!(
                "Local model path does not exist: {}",
                model_id_or_path
            ))
        } else {
            self.hub.download_model(model_id_or_path)
        }
    }
}
