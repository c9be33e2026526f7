//! LoRA adapters for QLoRA fine-tuning
//!
//! LoRA reduces the number of trainable parameters by decomposing weight updates
//! into low-rank matrices:
//!
//! ```text
//! W' = W + BA * (alpha / rank)
//! ```
//!
//! Where:
//! - W is the frozen (here: 4-bit quantized) pretrained weight
//! - B ∈ ℝ^(out × rank) initialized to zeros
//! - A ∈ ℝ^(rank × in) initialized with Kaiming uniform
//! - alpha is a scaling factor
//!
//! The adapter matrices are f32 `Var`s owned by a `VarMap`; the base weight
//! is never touched.

use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};

/// Projection names an adapter can be attached to
pub const KNOWN_PROJECTIONS: [&str; 7] = [
    "q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj",
];

/// Which bias terms are trained alongside the adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraBias {
    #[default]
    None,
    All,
    LoraOnly,
}

/// LoRA configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition
    pub rank: usize,
    /// Scaling numerator
    pub alpha: f32,
    /// Dropout probability applied to the adapter input while training
    pub dropout: f32,
    /// Projections to wrap (e.g., ["q_proj", "v_proj"])
    pub target_modules: Vec<String>,
    /// Bias training mode (only `None` is supported)
    #[serde(default)]
    pub bias: LoraBias,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 32.0,
            dropout: 0.1,
            target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
            bias: LoraBias::None,
        }
    }
}

impl LoraConfig {
    /// Create a new LoRA config
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            ..Default::default()
        }
    }

    /// Set dropout
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Set target modules
    pub fn with_target_modules(mut self, modules: Vec<String>) -> Self {
        self.target_modules = modules;
        self
    }

    /// Get the scaling factor
    pub fn scaling(&self) -> f32 {
        self.alpha / self.rank as f32
    }

    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            anyhow::bail!("LoRA rank must be greater than 0");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("LoRA dropout must be in [0, 1), got {}", self.dropout);
        }
        if self.bias != LoraBias::None {
            anyhow::bail!("LoRA bias mode {:?} is not supported, use 'none'", self.bias);
        }
        if self.target_modules.is_empty() {
            anyhow::bail!("LoRA target_modules must not be empty");
        }
        for name in &self.target_modules {
            if !KNOWN_PROJECTIONS.contains(&name.as_str()) {
                anyhow::bail!(
                    "Unknown LoRA target module '{}'. Valid options: {}",
                    name,
                    KNOWN_PROJECTIONS.join(", ")
                );
            }
        }
        Ok(())
    }
}

/// Trainable low-rank update for one frozen projection
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    /// Down projection: input_dim -> rank
    lora_a: Tensor,
    /// Up projection: rank -> output_dim
    lora_b: Tensor,
    scaling: f64,
    dropout: f32,
    in_features: usize,
    out_features: usize,
    rank: usize,
}

impl LoraAdapter {
    /// Create adapter vars under `vb` (`lora_a`, `lora_b`)
    pub fn new(in_features: usize, out_features: usize, config: &LoraConfig, vb: VarBuilder) -> Result<Self> {
        let lora_a = vb.get_with_hints(
            (config.rank, in_features),
            "lora_a",
            Init::Kaiming {
                dist: candle_nn::init::NormalOrUniform::Uniform,
                fan: candle_nn::init::FanInOut::FanIn,
                non_linearity: candle_nn::init::NonLinearity::Linear,
            },
        )?;

        let lora_b = vb.get_with_hints((out_features, config.rank), "lora_b", Init::Const(0.0))?;

        Ok(Self {
            lora_a,
            lora_b,
            scaling: config.scaling() as f64,
            dropout: config.dropout,
            in_features,
            out_features,
            rank: config.rank,
        })
    }

    /// Low-rank delta `dropout(x) @ A^T @ B^T * scaling`, returned in f32
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = x.to_dtype(DType::F32)?;
        let x = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&x, self.dropout)?
        } else {
            x
        };

        let out = x
            .broadcast_matmul(&self.lora_a.t()?)?
            .broadcast_matmul(&self.lora_b.t()?)?;
        Ok((out * self.scaling)?)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Trainable parameters in A and B
    pub fn num_params(&self) -> usize {
        self.rank * self.in_features + self.out_features * self.rank
    }
}

/// Statistics about LoRA parameters
#[derive(Debug, Clone)]
pub struct LoraStats {
    /// Total parameters in the model
    pub total_params: usize,
    /// Trainable parameters (LoRA only)
    pub trainable_params: usize,
    /// Percentage of trainable parameters
    pub trainable_percent: f64,
    /// Number of wrapped projections
    pub num_lora_layers: usize,
}

impl LoraStats {
    /// Create stats from counts
    pub fn new(total: usize, trainable: usize, num_layers: usize) -> Self {
        let trainable_percent = if total == 0 {
            0.0
        } else {
            trainable as f64 / total as f64 * 100.0
        };
        Self {
            total_params: total,
            trainable_params: trainable,
            trainable_percent,
            num_lora_layers: num_layers,
        }
    }
}

impl std::fmt::Display for LoraStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4} ({} adapted projections)",
            self.trainable_params, self.total_params, self.trainable_percent, self.num_lora_layers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_lora_config_default() {
        let config = LoraConfig::default();
        assert_eq!(config.rank, 8);
        assert_eq!(config.alpha, 32.0);
        assert_eq!(config.scaling(), 4.0);
        assert_eq!(config.dropout, 0.1);
        assert_eq!(config.target_modules, vec!["q_proj", "v_proj"]);
        assert_eq!(config.bias, LoraBias::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lora_config_custom() {
        let config = LoraConfig::new(16, 32.0)
            .with_dropout(0.05)
            .with_target_modules(vec!["q_proj".to_string(), "k_proj".to_string(), "v_proj".to_string()]);

        assert_eq!(config.rank, 16);
        assert_eq!(config.scaling(), 2.0);
        assert_eq!(config.target_modules.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(LoraConfig::new(0, 32.0).validate().is_err());

        let unknown = LoraConfig::default().with_target_modules(vec!["query".to_string()]);
        let err = unknown.validate().unwrap_err();
        assert!(err.to_string().contains("query"));

        let biased = LoraConfig {
            bias: LoraBias::All,
            ..Default::default()
        };
        assert!(biased.validate().is_err());

        assert!(LoraConfig::default().with_dropout(1.0).validate().is_err());
    }

    #[test]
    fn test_config_serde() {
        let json = serde_json::to_string(&LoraConfig::default()).unwrap();
        assert!(json.contains("\"bias\":\"none\""));
        let parsed: LoraConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, LoraConfig::default());
    }

    #[test]
    fn test_adapter_starts_as_identity_update() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let adapter = LoraAdapter::new(32, 16, &LoraConfig::default(), vb.pp("proj")).unwrap();

        assert_eq!(adapter.num_params(), 8 * 32 + 16 * 8);
        assert_eq!(varmap.all_vars().len(), 2);

        let x = Tensor::randn(0f32, 1.0, (2, 3, 32), &device).unwrap();
        let out = adapter.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[2, 3, 16]);
        let total = out.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn test_lora_stats() {
        let stats = LoraStats::new(7_000_000_000, 3_407_872, 64);
        assert!((stats.trainable_percent - 0.0487).abs() < 0.001);
        assert!(stats.to_string().contains("trainable params: 3407872"));
        assert_eq!(LoraStats::new(0, 0, 0).trainable_percent, 0.0);
    }
}
