//! Configuration for text generators
//!
//! Defines the generator initialization config and sampling parameters
//! for controlling generation behavior.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::training::hub::DEFAULT_TOKEN_ENV;
use crate::training::{DevicePreference, HubConfig, QuantType};

/// Configuration for initializing a generator model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// HuggingFace model ID or local path
    pub model_id: String,

    /// Directory with adapter_model.safetensors / adapter_config.json
    pub adapter_path: Option<PathBuf>,

    /// Device preference (auto, cuda, metal, cpu)
    pub device: DevicePreference,

    /// Activation dtype ("f32", "f16", "bf16")
    pub dtype: String,

    /// Projection weight format for the base model
    pub quant: QuantType,

    /// Environment variable holding the Hub token
    pub token_env: String,

    /// Hub cache directory override
    pub cache_dir: Option<PathBuf>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model_id: "mistralai/Mistral-7B-Instruct-v0.1".to_string(),
            adapter_path: None,
            device: DevicePreference::Auto,
            dtype: "f16".to_string(),
            quant: QuantType::Q4_0,
            token_env: DEFAULT_TOKEN_ENV.to_string(),
            cache_dir: None,
        }
    }
}

impl GeneratorConfig {
    /// Create a new generator config with the given model ID
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            ..Default::default()
        }
    }

    /// Load a trained adapter on top of the base model
    pub fn with_adapter(mut self, path: impl Into<PathBuf>) -> Self {
        self.adapter_path = Some(path.into());
        self
    }

    /// Set the device preference
    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    /// Set the data type
    pub fn with_dtype(mut self, dtype: &str) -> Self {
        self.dtype = dtype.to_string();
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Hub settings with the token read from `token_env`
    pub fn hub_config(&self) -> HubConfig {
        let hub = HubConfig::from_env(&self.token_env);
        match &self.cache_dir {
            Some(dir) => hub.with_cache_dir(dir),
            None => hub,
        }
    }
}

/// Sampling parameters for text generation
///
/// Controls the randomness and diversity of generated text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Maximum new tokens to generate
    pub max_new_tokens: usize,

    /// Temperature (higher = more random); 0 means greedy
    pub temperature: f64,

    /// Top-p (nucleus sampling) cumulative probability threshold
    pub top_p: Option<f64>,

    /// Top-k sampling
    pub top_k: Option<usize>,

    /// Repetition penalty (1.0 = no penalty)
    pub repetition_penalty: f32,

    /// Tokens considered by the repetition penalty
    pub repeat_last_n: usize,

    /// Random seed for reproducibility (None = random)
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 50,
            temperature: 0.7,
            top_p: None,
            top_k: None,
            repetition_penalty: 1.0,
            repeat_last_n: 64,
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Deterministic argmax decoding
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// Set temperature
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    /// Set top-p
    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Set top-k
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Set max new tokens
    pub fn with_max_new_tokens(mut self, max_tokens: usize) -> Self {
        self.max_new_tokens = max_tokens;
        self
    }

    /// Set random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
