//! Adapter checkpoints
//!
//! A checkpoint directory holds only what training produced:
//!
//! ```text
//! checkpoint-{step}/
//!   adapter_model.safetensors   LoRA A/B matrices
//!   adapter_config.json         LoRA config + base model id
//!   optimizer.safetensors       AdamW moments
//!   trainer_state.json          step, epoch, log history, training config
//! ```
//!
//! The frozen base model is never written; it is re-downloaded and
//! re-quantized when an adapter is loaded.

use anyhow::{Context, Result};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::training::lora::LoraConfig;
use crate::training::optimizer::PagedAdamW;
use crate::training::quant::QuantType;
use crate::training::trainer::{TrainingConfig, TrainingMetrics};

pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// Contents of `adapter_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub base_model_name_or_path: String,
    pub peft_type: String,
    pub task_type: String,
    pub quant: QuantType,
    #[serde(flatten)]
    pub lora: LoraConfig,
}

impl AdapterConfig {
    pub fn new(base_model: impl Into<String>, lora: LoraConfig, quant: QuantType) -> Self {
        Self {
            base_model_name_or_path: base_model.into(),
            peft_type: "LORA".to_string(),
            task_type: "CAUSAL_LM".to_string(),
            quant,
            lora,
        }
    }
}

/// Contents of `trainer_state.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub log_history: Vec<TrainingMetrics>,
    pub config: TrainingConfig,
}

/// Directory name for a step
pub fn checkpoint_dir(output_dir: impl AsRef<Path>, step: usize) -> PathBuf {
    output_dir.as_ref().join(format!("checkpoint-{}", step))
}

/// Write adapter weights and config into `dir`
pub fn save_adapter(dir: impl AsRef<Path>, var_map: &VarMap, adapter_config: &AdapterConfig) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {:?}", dir))?;

    var_map
        .save(dir.join(ADAPTER_WEIGHTS_FILE))
        .with_context(|| format!("Failed to save adapter weights to {:?}", dir))?;
    write_json(&dir.join(ADAPTER_CONFIG_FILE), adapter_config)?;
    Ok(())
}

/// Write a full training checkpoint and return its directory
pub fn save_checkpoint(
    output_dir: impl AsRef<Path>,
    var_map: &VarMap,
    optimizer: &PagedAdamW,
    adapter_config: &AdapterConfig,
    state: &TrainerState,
) -> Result<PathBuf> {
    let dir = checkpoint_dir(output_dir, state.global_step);
    save_adapter(&dir, var_map, adapter_config)?;
    optimizer.save(dir.join(OPTIMIZER_FILE))?;
    write_json(&dir.join(TRAINER_STATE_FILE), state)?;

    tracing::info!("Saved checkpoint to {:?}", dir);
    Ok(dir)
}

/// Read `adapter_config.json` from an adapter directory
pub fn load_adapter_config(dir: impl AsRef<Path>) -> Result<AdapterConfig> {
    read_json(&dir.as_ref().join(ADAPTER_CONFIG_FILE))
}

/// Overwrite the adapter vars in `var_map` with the weights saved in `dir`
///
/// `var_map` must already contain the vars, i.e. the adapters have been
/// injected with the same config.
pub fn load_adapter(dir: impl AsRef<Path>, var_map: &mut VarMap) -> Result<AdapterConfig> {
    let dir = dir.as_ref();
    let config = load_adapter_config(dir)?;
    let weights = dir.join(ADAPTER_WEIGHTS_FILE);
    var_map
        .load(&weights)
        .with_context(|| format!("Failed to load adapter weights from {:?}", weights))?;

    tracing::info!("Loaded adapter from {:?}", dir);
    Ok(config)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read file: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optimizer::ParamsPagedAdamW;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};
    use tempfile::TempDir;

    fn adapter_varmap(fill: f64) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.pp("model.layers.0.self_attn.q_proj")
            .get_with_hints((4, 8), "lora_a", Init::Const(fill))
            .unwrap();
        vb.pp("model.layers.0.self_attn.q_proj")
            .get_with_hints((8, 4), "lora_b", Init::Const(fill))
            .unwrap();
        varmap
    }

    fn state(step: usize) -> TrainerState {
        TrainerState {
            global_step: step,
            epoch: 1.5,
            max_steps: 300,
            log_history: vec![TrainingMetrics {
                step,
                epoch: 1.5,
                loss: 2.25,
                learning_rate: 5e-5,
                grad_norm: 0.8,
                samples_per_second: 3.0,
            }],
            config: TrainingConfig::default(),
        }
    }

    #[test]
    fn test_save_checkpoint_layout() {
        let dir = TempDir::new().unwrap();
        let varmap = adapter_varmap(0.5);
        let optimizer = PagedAdamW::from_varmap(&varmap, ParamsPagedAdamW::default()).unwrap();
        let adapter_config = AdapterConfig::new("mistralai/Mistral-7B-Instruct-v0.1", LoraConfig::default(), QuantType::Q4_0);

        let path = save_checkpoint(dir.path(), &varmap, &optimizer, &adapter_config, &state(100)).unwrap();
        assert_eq!(path, dir.path().join("checkpoint-100"));
        for file in [ADAPTER_WEIGHTS_FILE, ADAPTER_CONFIG_FILE, OPTIMIZER_FILE, TRAINER_STATE_FILE] {
            assert!(path.join(file).exists(), "missing {}", file);
        }

        let raw = std::fs::read_to_string(path.join(ADAPTER_CONFIG_FILE)).unwrap();
        assert!(raw.contains("\"peft_type\": \"LORA\""));
        assert!(raw.contains("\"rank\": 8"));
        assert_eq!(load_adapter_config(&path).unwrap(), adapter_config);

        let raw = std::fs::read_to_string(path.join(TRAINER_STATE_FILE)).unwrap();
        let restored: TrainerState = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored.global_step, 100);
        assert_eq!(restored.log_history.len(), 1);
    }

    #[test]
    fn test_load_adapter_restores_weights() {
        let dir = TempDir::new().unwrap();
        let saved = adapter_varmap(0.5);
        let adapter_config = AdapterConfig::new("base", LoraConfig::default(), QuantType::Q4_0);
        save_adapter(dir.path(), &saved, &adapter_config).unwrap();

        let mut fresh = adapter_varmap(0.0);
        load_adapter(dir.path(), &mut fresh).unwrap();

        let data = fresh.data().lock().unwrap();
        let a = data.get("model.layers.0.self_attn.q_proj.lora_a").unwrap();
        let expected = Tensor::full(0.5f32, (4, 8), &Device::Cpu).unwrap();
        let diff = (a.as_tensor() - expected)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_load_adapter_missing_dir_is_error() {
        let mut varmap = adapter_varmap(0.0);
        assert!(load_adapter("/nonexistent/adapter", &mut varmap).is_err());
    }
}
