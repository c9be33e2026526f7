//! Training loop for QLoRA fine-tuning
//!
//! Provides a high-level API for training with:
//! - Gradient accumulation
//! - Learning rate scheduling with warmup
//! - Global gradient-norm clipping
//! - Periodic checkpointing
//! - Opt-in metrics export (`metrics.jsonl`)

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::optim::Optimizer;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use super::checkpoint::{self, AdapterConfig, TrainerState};
use super::dataset::TokenizedDataset;
use super::lora::{LoraConfig, LoraStats};
use super::loss::causal_lm_loss;
use super::models::QuantizedMistral;
use super::optimizer::{LearningRateScheduler, OptimizerKind, PagedAdamW, ParamsPagedAdamW, SchedulerKind};

/// File the optional metrics sink appends to, inside `output_dir`
pub const METRICS_FILE: &str = "metrics.jsonl";

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Output directory for checkpoints and the final adapter
    pub output_dir: PathBuf,
    /// Batch size per forward pass
    pub per_device_batch_size: usize,
    /// Number of training epochs
    pub num_epochs: usize,
    /// Peak learning rate
    pub learning_rate: f64,
    /// Decoupled weight decay
    pub weight_decay: f64,
    /// Warmup steps as a fraction of total optimization steps
    pub warmup_ratio: f64,
    /// Batches per optimization step
    pub gradient_accumulation_steps: usize,
    /// Maximum gradient norm for clipping (0 disables clipping)
    pub max_grad_norm: f64,
    /// Log every N optimization steps
    pub logging_steps: usize,
    /// Save checkpoint every N optimization steps (0 to disable)
    pub save_steps: usize,
    /// Half-precision activations
    pub fp16: bool,
    /// Recompute activations in the backward pass (not supported)
    pub gradient_checkpointing: bool,
    pub optimizer: OptimizerKind,
    pub scheduler: SchedulerKind,
    /// Seed for data shuffling
    pub seed: u64,
    /// Append every logged metrics line to `output_dir/metrics.jsonl`
    pub report_metrics: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./qlora_sentiment"),
            per_device_batch_size: 2,
            num_epochs: 3,
            learning_rate: 5e-5,
            weight_decay: 0.0,
            warmup_ratio: 0.0,
            gradient_accumulation_steps: 1,
            max_grad_norm: 1.0,
            logging_steps: 10,
            save_steps: 100,
            fp16: true,
            gradient_checkpointing: false,
            optimizer: OptimizerKind::PagedAdamW,
            scheduler: SchedulerKind::Linear,
            seed: 42,
            report_metrics: false,
        }
    }
}

impl TrainingConfig {
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.per_device_batch_size = batch_size;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_logging_steps(mut self, steps: usize) -> Self {
        self.logging_steps = steps;
        self
    }

    pub fn with_save_steps(mut self, steps: usize) -> Self {
        self.save_steps = steps;
        self
    }

    pub fn with_report_metrics(mut self, enabled: bool) -> Self {
        self.report_metrics = enabled;
        self
    }

    /// Activation dtype implied by `fp16`
    pub fn compute_dtype(&self) -> DType {
        if self.fp16 {
            DType::F16
        } else {
            DType::F32
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.per_device_batch_size == 0 {
            anyhow::bail!("per_device_batch_size must be greater than 0");
        }
        if self.num_epochs == 0 {
            anyhow::bail!("num_epochs must be greater than 0");
        }
        if self.gradient_accumulation_steps == 0 {
            anyhow::bail!("gradient_accumulation_steps must be greater than 0");
        }
        if self.logging_steps == 0 {
            anyhow::bail!("logging_steps must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            anyhow::bail!("warmup_ratio must be in [0, 1], got {}", self.warmup_ratio);
        }
        if self.learning_rate <= 0.0 {
            anyhow::bail!("learning_rate must be positive");
        }
        if self.gradient_checkpointing {
            anyhow::bail!("gradient_checkpointing is not supported; set it to false");
        }
        Ok(())
    }
}

/// Where a trainer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    Configured,
    Training,
    Trained,
    /// A run started and returned an error; the trainer cannot be reused
    Failed,
}

/// Metrics for one logging window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Optimization step
    pub step: usize,
    /// Fractional epoch
    pub epoch: f64,
    /// Mean loss since the previous log line
    pub loss: f64,
    pub learning_rate: f64,
    /// Gradient norm before clipping at this step
    pub grad_norm: f64,
    pub samples_per_second: f64,
}

impl std::fmt::Display for TrainingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Step {} | Epoch {:.2} | Loss: {:.4} | LR: {:.2e} | Grad norm: {:.4} | {:.1} samples/s",
            self.step, self.epoch, self.loss, self.learning_rate, self.grad_norm, self.samples_per_second
        )
    }
}

/// Training result
#[derive(Debug)]
pub struct TrainingResult {
    /// Optimization steps taken
    pub global_step: usize,
    /// Mean loss over all batches
    pub train_loss: f64,
    /// Every logged metrics line
    pub log_history: Vec<TrainingMetrics>,
    /// Loss per batch
    pub history: Vec<f64>,
    /// Last checkpoint written
    pub checkpoint_path: Option<PathBuf>,
    /// Directory holding the final adapter
    pub adapter_path: PathBuf,
}

/// Trainer for LoRA adapters on a frozen quantized model
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    var_map: VarMap,
    phase: TrainingPhase,
}

impl Trainer {
    /// Create a new trainer
    pub fn new(config: TrainingConfig, device: Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device,
            var_map: VarMap::new(),
            phase: TrainingPhase::Configured,
        })
    }

    /// Get the device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get the config
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Get the var_map holding the adapter weights
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    /// Inject adapters into `model`, registering their vars with this trainer
    pub fn attach_adapters(&self, model: &mut QuantizedMistral, lora: &LoraConfig) -> Result<LoraStats> {
        model.inject_lora(lora, &self.var_map)
    }

    /// Create optimizer
    pub fn create_optimizer(&self) -> Result<PagedAdamW> {
        let params = ParamsPagedAdamW {
            lr: self.config.learning_rate,
            weight_decay: self.config.weight_decay,
            paged: self.config.optimizer == OptimizerKind::PagedAdamW,
            ..Default::default()
        };
        PagedAdamW::from_varmap(&self.var_map, params)
    }

    /// Create learning rate scheduler
    pub fn create_scheduler(&self, total_steps: usize) -> LearningRateScheduler {
        let warmup_steps = (total_steps as f64 * self.config.warmup_ratio).ceil() as usize;
        LearningRateScheduler::new(
            self.config.scheduler,
            self.config.learning_rate,
            warmup_steps,
            total_steps,
        )
    }

    /// Train the adapters of `model` on `dataset`
    ///
    /// Only valid once, from the `Configured` phase. Ends in `Trained` on
    /// success and `Failed` if the run errors after it started.
    pub fn train(&mut self, model: &QuantizedMistral, dataset: &TokenizedDataset) -> Result<TrainingResult> {
        if self.phase != TrainingPhase::Configured {
            anyhow::bail!("Trainer is in phase {:?}; train() can only run once", self.phase);
        }
        let lora_config = model
            .lora_config()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Model has no LoRA adapters; call attach_adapters first"))?;
        if self.var_map.all_vars().is_empty() {
            anyhow::bail!("No trainable parameters registered with this trainer");
        }
        if dataset.is_empty() {
            anyhow::bail!("Training dataset is empty");
        }

        self.phase = TrainingPhase::Training;
        let result = self.run_epochs(model, dataset, lora_config);
        match &result {
            Ok(_) => self.phase = TrainingPhase::Trained,
            Err(err) => {
                tracing::error!("Training failed: {:#}", err);
                self.phase = TrainingPhase::Failed;
            }
        }
        result
    }

    fn run_epochs(
        &self,
        model: &QuantizedMistral,
        dataset: &TokenizedDataset,
        lora_config: LoraConfig,
    ) -> Result<TrainingResult> {
        let cfg = self.config.clone();
        let batch_size = cfg.per_device_batch_size;
        let accum = cfg.gradient_accumulation_steps;
        let num_batches = dataset.num_batches(batch_size);
        let steps_per_epoch = num_batches.div_ceil(accum);
        let total_steps = steps_per_epoch * cfg.num_epochs;

        tracing::info!("Starting training:");
        tracing::info!("  Dataset size: {}", dataset.len());
        tracing::info!("  Batch size: {}", batch_size);
        tracing::info!("  Gradient accumulation steps: {}", accum);
        tracing::info!("  Epochs: {}", cfg.num_epochs);
        tracing::info!("  Total optimization steps: {}", total_steps);
        tracing::info!("  Learning rate: {} ({:?} schedule)", cfg.learning_rate, cfg.scheduler);
        tracing::info!("  Optimizer: {:?}", cfg.optimizer);

        let mut optimizer = self.create_optimizer()?;
        let mut scheduler = self.create_scheduler(total_steps);
        let adapter_config = AdapterConfig::new(model.model_id(), lora_config, model.load_config().quant);

        std::fs::create_dir_all(&cfg.output_dir)
            .with_context(|| format!("Failed to create output directory: {:?}", cfg.output_dir))?;
        let mut metrics_sink = if cfg.report_metrics {
            let path = cfg.output_dir.join(METRICS_FILE);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open metrics file: {:?}", path))?;
            tracing::info!("  Reporting metrics to {:?}", path);
            Some(file)
        } else {
            None
        };

        let mut global_step = 0;
        let mut history = Vec::with_capacity(num_batches * cfg.num_epochs);
        let mut log_history = Vec::new();
        let mut checkpoint_path = None;

        let mut accumulated_loss: Option<Tensor> = None;
        let mut accumulated_batches = 0;
        let mut window_loss = 0.0;
        let mut window_batches = 0;
        let mut window_samples = 0;
        let mut window_start = Instant::now();

        for epoch in 0..cfg.num_epochs {
            let epoch_start = Instant::now();
            let mut epoch_loss = 0.0;
            let order = dataset.epoch_order(cfg.seed, epoch);

            for (batch_idx, batch) in dataset.batches(&order, batch_size, &self.device).enumerate() {
                let batch = batch?;
                let logits = model.forward(&batch.input_ids, Some(&batch.attention_mask), None, true)?;
                let loss = causal_lm_loss(&logits, &batch.labels)?;
                let loss_value = loss.to_scalar::<f32>()? as f64;
                if !loss_value.is_finite() {
                    anyhow::bail!("Loss became {} at step {}", loss_value, global_step);
                }

                let scaled_loss = (&loss / accum as f64)?;
                accumulated_loss = Some(match accumulated_loss.take() {
                    Some(acc) => (acc + scaled_loss)?,
                    None => scaled_loss,
                });
                accumulated_batches += 1;

                history.push(loss_value);
                epoch_loss += loss_value;
                window_loss += loss_value;
                window_batches += 1;
                window_samples += batch.batch_size();

                let last_batch = batch_idx + 1 == num_batches;
                if accumulated_batches < accum && !last_batch {
                    continue;
                }

                let Some(acc_loss) = accumulated_loss.take() else {
                    continue;
                };
                accumulated_batches = 0;

                let grads = acc_loss.backward()?;
                let lr = scheduler.get_lr();
                optimizer.set_learning_rate(lr);
                let grad_norm = optimizer.step_with_clipping(&grads, cfg.max_grad_norm)?;
                scheduler.step();
                global_step += 1;

                if global_step % cfg.logging_steps == 0 {
                    let elapsed = window_start.elapsed().as_secs_f64().max(1e-9);
                    let metrics = TrainingMetrics {
                        step: global_step,
                        epoch: epoch as f64 + (batch_idx + 1) as f64 / num_batches as f64,
                        loss: window_loss / window_batches.max(1) as f64,
                        learning_rate: lr,
                        grad_norm,
                        samples_per_second: window_samples as f64 / elapsed,
                    };
                    tracing::info!("{}", metrics);
                    if let Some(sink) = metrics_sink.as_mut() {
                        writeln!(sink, "{}", serde_json::to_string(&metrics)?)
                            .context("Failed to write metrics")?;
                    }
                    log_history.push(metrics);

                    window_loss = 0.0;
                    window_batches = 0;
                    window_samples = 0;
                    window_start = Instant::now();
                }

                if cfg.save_steps > 0 && global_step % cfg.save_steps == 0 {
                    let state = TrainerState {
                        global_step,
                        epoch: epoch as f64 + (batch_idx + 1) as f64 / num_batches as f64,
                        max_steps: total_steps,
                        log_history: log_history.clone(),
                        config: cfg.clone(),
                    };
                    checkpoint_path = Some(checkpoint::save_checkpoint(
                        &cfg.output_dir,
                        &self.var_map,
                        &optimizer,
                        &adapter_config,
                        &state,
                    )?);
                }
            }

            tracing::info!(
                "Epoch {} completed in {:.1}s | Avg loss: {:.4}",
                epoch + 1,
                epoch_start.elapsed().as_secs_f64(),
                epoch_loss / num_batches as f64
            );
        }

        let already_saved = cfg.save_steps > 0 && global_step % cfg.save_steps == 0;
        if !already_saved {
            let state = TrainerState {
                global_step,
                epoch: cfg.num_epochs as f64,
                max_steps: total_steps,
                log_history: log_history.clone(),
                config: cfg.clone(),
            };
            checkpoint_path = Some(checkpoint::save_checkpoint(
                &cfg.output_dir,
                &self.var_map,
                &optimizer,
                &adapter_config,
                &state,
            )?);
        }
        checkpoint::save_adapter(&cfg.output_dir, &self.var_map, &adapter_config)?;

        let train_loss = history.iter().sum::<f64>() / history.len().max(1) as f64;
        tracing::info!(
            "Training finished: {} steps, mean loss {:.4}, adapter saved to {:?}",
            global_step,
            train_loss,
            cfg.output_dir
        );

        Ok(TrainingResult {
            global_step,
            train_loss,
            log_history,
            history,
            checkpoint_path,
            adapter_path: cfg.output_dir.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InstructionRecord;
    use crate::training::dataset::TokenizeConfig;
    use crate::training::models::mistral::tests::{tiny_model, tiny_model_with};
    use crate::training::models::LoadConfig;
    use crate::training::models::tokenizer::tests::test_tokenizer;
    use tempfile::TempDir;

    fn records() -> Vec<InstructionRecord> {
        [
            ("Loved it, fits great!", "positive"),
            ("Terrible quality, returned it", "negative"),
            ("fits great", "positive"),
            ("returned it", "negative"),
        ]
        .iter()
        .map(|(text, output)| InstructionRecord {
            instruction: format!("Classify the sentiment of this review: '{}'", text),
            input: String::new(),
            output: output.to_string(),
        })
        .collect()
    }

    fn small_config(dir: &TempDir) -> TrainingConfig {
        TrainingConfig {
            fp16: false,
            learning_rate: 1e-3,
            ..TrainingConfig::default()
        }
        .with_output_dir(dir.path())
        .with_epochs(2)
        .with_logging_steps(1)
        .with_save_steps(2)
    }

    #[test]
    fn test_config_defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.per_device_batch_size, 2);
        assert_eq!(config.num_epochs, 3);
        assert_eq!(config.learning_rate, 5e-5);
        assert_eq!(config.logging_steps, 10);
        assert_eq!(config.save_steps, 100);
        assert_eq!(config.optimizer, OptimizerKind::PagedAdamW);
        assert_eq!(config.compute_dtype(), DType::F16);
        assert!(!config.report_metrics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_gradient_checkpointing() {
        let config = TrainingConfig {
            gradient_checkpointing: true,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gradient_checkpointing"));
        assert!(Trainer::new(config, Device::Cpu).is_err());
        assert!(TrainingConfig::default().with_batch_size(0).validate().is_err());
    }

    #[test]
    fn test_train_end_to_end() {
        let dir = TempDir::new().unwrap();
        let tok_dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let tokenizer = test_tokenizer(tok_dir.path());
        let dataset = TokenizedDataset::from_records(
            &records(),
            &tokenizer,
            &TokenizeConfig::default().with_max_length(16),
        )
        .unwrap();

        let mut model = tiny_model(&device);
        let mut trainer = Trainer::new(small_config(&dir).with_report_metrics(true), device).unwrap();
        let stats = trainer.attach_adapters(&mut model, &LoraConfig::default()).unwrap();
        assert!(stats.trainable_params > 0);
        assert_eq!(trainer.phase(), TrainingPhase::Configured);

        let result = trainer.train(&model, &dataset).unwrap();

        // 4 records / batch 2 = 2 steps per epoch, 2 epochs
        assert_eq!(result.global_step, 4);
        assert_eq!(result.history.len(), 4);
        assert_eq!(result.log_history.len(), 4);
        assert!(result.train_loss.is_finite());
        assert_eq!(trainer.phase(), TrainingPhase::Trained);

        assert!(dir.path().join("checkpoint-2").join("adapter_model.safetensors").exists());
        assert!(dir.path().join("checkpoint-4").join("trainer_state.json").exists());
        assert_eq!(result.checkpoint_path, Some(dir.path().join("checkpoint-4")));
        assert!(dir.path().join("adapter_config.json").exists());

        let metrics = std::fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap();
        assert_eq!(metrics.lines().count(), 4);
        let first: TrainingMetrics = serde_json::from_str(metrics.lines().next().unwrap()).unwrap();
        assert_eq!(first.step, 1);

        // B started at zero and must have moved
        let data = trainer.var_map().data().lock().unwrap();
        let b = data.get("model.layers.0.self_attn.q_proj.lora_b").unwrap();
        let norm = b.as_tensor().sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(norm > 0.0);
        drop(data);

        assert!(trainer.train(&model, &dataset).is_err());
    }

    #[test]
    fn test_metrics_file_absent_by_default() {
        let dir = TempDir::new().unwrap();
        let tok_dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let tokenizer = test_tokenizer(tok_dir.path());
        let dataset = TokenizedDataset::from_records(
            &records()[..2],
            &tokenizer,
            &TokenizeConfig::default().with_max_length(16),
        )
        .unwrap();

        let mut model = tiny_model(&device);
        let mut trainer = Trainer::new(small_config(&dir).with_epochs(1), device).unwrap();
        trainer.attach_adapters(&mut model, &LoraConfig::default()).unwrap();
        let result = trainer.train(&model, &dataset).unwrap();

        assert_eq!(result.global_step, 1);
        assert!(!dir.path().join(METRICS_FILE).exists());
        // save_steps 2 never hit; the final checkpoint is still written
        assert!(dir.path().join("checkpoint-1").exists());
    }

    #[test]
    fn test_train_without_adapters_is_error() {
        let dir = TempDir::new().unwrap();
        let tok_dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let tokenizer = test_tokenizer(tok_dir.path());
        let dataset =
            TokenizedDataset::from_records(&records(), &tokenizer, &TokenizeConfig::default().with_max_length(16))
                .unwrap();

        let model = tiny_model(&device);
        let mut trainer = Trainer::new(small_config(&dir), device).unwrap();
        let err = trainer.train(&model, &dataset).unwrap_err();
        assert!(err.to_string().contains("no LoRA adapters"));
        assert_eq!(trainer.phase(), TrainingPhase::Configured);
    }

    #[test]
    fn test_failed_run_is_terminal() {
        let dir = TempDir::new().unwrap();
        let tok_dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let tokenizer = test_tokenizer(tok_dir.path());
        let dataset =
            TokenizedDataset::from_records(&records(), &tokenizer, &TokenizeConfig::default().with_max_length(16))
                .unwrap();

        // A regular file where the output directory should be
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let config = small_config(&dir).with_output_dir(&blocker);

        let mut model = tiny_model(&device);
        let mut trainer = Trainer::new(config, device).unwrap();
        trainer.attach_adapters(&mut model, &LoraConfig::default()).unwrap();

        let err = trainer.train(&model, &dataset).unwrap_err();
        assert!(err.to_string().contains("Failed to create output directory"));
        assert_eq!(trainer.phase(), TrainingPhase::Failed);

        let err = trainer.train(&model, &dataset).unwrap_err();
        assert!(err.to_string().contains("Failed"));
        assert_eq!(trainer.phase(), TrainingPhase::Failed);
    }

    #[test]
    fn test_fp16_training_step() {
        let dir = TempDir::new().unwrap();
        let tok_dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let tokenizer = test_tokenizer(tok_dir.path());
        let dataset = TokenizedDataset::from_records(
            &records()[..2],
            &tokenizer,
            &TokenizeConfig::default().with_max_length(16),
        )
        .unwrap();

        let config = TrainingConfig {
            fp16: true,
            ..small_config(&dir).with_epochs(1)
        };
        assert_eq!(config.compute_dtype(), DType::F16);

        let mut model = tiny_model_with(&device, LoadConfig::default());
        assert_eq!(model.load_config().dtype, DType::F16);
        let mut trainer = Trainer::new(config, device).unwrap();
        trainer.attach_adapters(&mut model, &LoraConfig::default()).unwrap();
        let result = trainer.train(&model, &dataset).unwrap();

        assert_eq!(result.global_step, 1);
        assert!(result.train_loss.is_finite());
        assert_eq!(trainer.phase(), TrainingPhase::Trained);

        let data = trainer.var_map().data().lock().unwrap();
        let b = data.get("model.layers.0.self_attn.q_proj.lora_b").unwrap();
        let norm = b
            .as_tensor()
            .to_dtype(DType::F32)
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(norm > 0.0);
    }

    #[test]
    fn test_gradient_accumulation_step_count() {
        let dir = TempDir::new().unwrap();
        let tok_dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let tokenizer = test_tokenizer(tok_dir.path());
        let dataset =
            TokenizedDataset::from_records(&records(), &tokenizer, &TokenizeConfig::default().with_max_length(16))
                .unwrap();

        let config = TrainingConfig {
            per_device_batch_size: 1,
            gradient_accumulation_steps: 3,
            ..small_config(&dir).with_epochs(1)
        };
        let mut model = tiny_model(&device);
        let mut trainer = Trainer::new(config, device).unwrap();
        trainer.attach_adapters(&mut model, &LoraConfig::default()).unwrap();
        let result = trainer.train(&model, &dataset).unwrap();

        // 4 batches: one full window of 3, then a trailing window of 1
        assert_eq!(result.global_step, 2);
        assert_eq!(result.history.len(), 4);
    }
}
