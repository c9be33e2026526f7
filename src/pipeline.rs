//! End-to-end fine-tuning pipeline
//!
//! Runs the five stages in order, each consuming the previous stage's
//! output:
//! 1. Convert the review CSV to instruction JSON
//! 2. Tokenize the instruction records
//! 3. Load and quantize the base model
//! 4. Inject LoRA adapters
//! 5. Train, then sample the inspection prompts

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Instant;

use crate::data::{load_json, ConversionStats, ConverterConfig, DatasetConverter, InstructionRecord};
use crate::generation::{Generation, SamplingParams, TextGenerator, DEFAULT_PROMPTS};
use crate::training::device::device_name;
use crate::training::hub::DEFAULT_TOKEN_ENV;
use crate::training::{
    select_device, DevicePreference, HubConfig, LoadConfig, LoraConfig, LoraStats,
    ModelLoader, QuantType, QuantizedMistral, TokenizeConfig, TokenizedDataset, TokenizerWrapper,
    Trainer, TrainingConfig, TrainingResult,
};

/// Configuration for a full pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Review export to convert
    pub csv_path: PathBuf,
    /// Where the instruction records are written and read back from
    pub json_path: PathBuf,
    /// HuggingFace model ID or local path
    pub model_id: String,
    /// Environment variable holding the Hub token
    pub token_env: String,
    /// Hub cache directory override
    pub cache_dir: Option<PathBuf>,
    pub device: DevicePreference,
    pub quant: QuantType,
    pub converter: ConverterConfig,
    pub tokenize: TokenizeConfig,
    pub lora: LoraConfig,
    pub training: TrainingConfig,
    pub sampling: SamplingParams,
    /// Prompts sampled after training
    pub prompts: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            csv_path: PathBuf::from("Womens Clothing E-Commerce Reviews.csv"),
            json_path: PathBuf::from("sentiment_instructions.json"),
            model_id: "mistralai/Mistral-7B-Instruct-v0.1".to_string(),
            token_env: DEFAULT_TOKEN_ENV.to_string(),
            cache_dir: None,
            device: DevicePreference::Auto,
            quant: QuantType::Q4_0,
            converter: ConverterConfig::default(),
            tokenize: TokenizeConfig::default(),
            lora: LoraConfig::default(),
            training: TrainingConfig::default(),
            sampling: SamplingParams::default(),
            prompts: DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl PipelineConfig {
    /// Set the CSV input path
    pub fn with_csv_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.csv_path = path.into();
        self
    }

    /// Set the instruction JSON path
    pub fn with_json_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.json_path = path.into();
        self
    }

    /// Set the base model
    pub fn with_model_id(mut self, model_id: &str) -> Self {
        self.model_id = model_id.to_string();
        self
    }

    /// Set the device preference
    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    pub fn with_lora(mut self, lora: LoraConfig) -> Self {
        self.lora = lora;
        self
    }

    pub fn with_training(mut self, training: TrainingConfig) -> Self {
        self.training = training;
        self
    }

    pub fn with_tokenize(mut self, tokenize: TokenizeConfig) -> Self {
        self.tokenize = tokenize;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Reject bad settings before any expensive stage runs
    pub fn validate(&self) -> Result<()> {
        self.lora.validate()?;
        self.training.validate()?;
        if self.tokenize.max_length == 0 {
            anyhow::bail!("max_length must be greater than 0");
        }
        if self.tokenize.batch_size == 0 {
            anyhow::bail!("tokenization batch_size must be greater than 0");
        }
        Ok(())
    }

    /// Hub settings with the token read from `token_env`
    pub fn hub_config(&self) -> HubConfig {
        let hub = HubConfig::from_env(&self.token_env);
        match &self.cache_dir {
            Some(dir) => hub.with_cache_dir(dir),
            None => hub,
        }
    }

    fn load_config(&self) -> LoadConfig {
        LoadConfig::default()
            .with_dtype(self.training.compute_dtype())
            .with_quant(self.quant)
    }
}

/// Adapted model after training
pub struct TrainedAdapter {
    pub model: QuantizedMistral,
    pub tokenizer: TokenizerWrapper,
    pub lora_stats: LoraStats,
    pub result: TrainingResult,
}

/// Everything a full run produced
pub struct PipelineReport {
    pub conversion: ConversionStats,
    pub lora_stats: LoraStats,
    pub training: TrainingResult,
    pub generations: Vec<Generation>,
}

/// Stage 1: CSV to instruction JSON
pub fn convert_dataset(config: &PipelineConfig) -> Result<ConversionStats> {
    tracing::info!("Converting {:?} -> {:?}", config.csv_path, config.json_path);
    DatasetConverter::new(config.converter.clone()).convert_file(&config.csv_path, &config.json_path)
}

/// Stages 2-5a: tokenize, load, inject, train
///
/// The records are tokenized before the base model is loaded and quantized.
pub fn train_adapter(config: &PipelineConfig, records: &[InstructionRecord]) -> Result<TrainedAdapter> {
    config.validate()?;
    if records.is_empty() {
        anyhow::bail!("No instruction records to train on");
    }

    let device = select_device(config.device)?;
    let loader = ModelLoader::with_config(&config.hub_config())?;
    let model_path = loader.load_model_path(&config.model_id)?;
    let tokenizer = TokenizerWrapper::from_model_path(&model_path)?;

    let start = Instant::now();
    let dataset = TokenizedDataset::from_records(records, &tokenizer, &config.tokenize)?;
    tracing::info!(
        "Tokenized {} records to length {} in {:.2?}",
        dataset.len(),
        dataset.max_length(),
        start.elapsed()
    );

    let start = Instant::now();
    let mut model = QuantizedMistral::from_model_path(&model_path, &device, &config.load_config())?;
    tracing::info!(
        "Loaded {} on {} ({} params) in {:.2?}",
        model_path.model_id,
        device_name(&device),
        model.num_params(),
        start.elapsed()
    );

    let mut trainer = Trainer::new(config.training.clone(), device)?;
    let lora_stats = trainer.attach_adapters(&mut model, &config.lora)?;
    let result = trainer.train(&model, &dataset)?;

    Ok(TrainedAdapter {
        model,
        tokenizer,
        lora_stats,
        result,
    })
}

/// Stage 5b: sample each prompt from the trained model
pub fn inspect(
    generator: &TextGenerator,
    prompts: &[String],
    params: &SamplingParams,
) -> Result<Vec<Generation>> {
    prompts
        .iter()
        .map(|prompt| {
            let generation = generator.complete(prompt, params)?;
            tracing::info!(
                "Generated {} tokens ({:?})",
                generation.token_ids.len(),
                generation.stop_reason
            );
            Ok(generation)
        })
        .collect()
}

/// Run every stage in order
pub fn run_pipeline(config: &PipelineConfig) -> Result<PipelineReport> {
    config.validate()?;
    let start = Instant::now();

    let conversion = convert_dataset(config)?;
    let records = load_json(&config.json_path)
        .with_context(|| format!("Failed to read back {:?}", config.json_path))?;

    let trained = train_adapter(config, &records)?;
    tracing::info!(
        "Training finished: {} steps, mean loss {:.4}",
        trained.result.global_step,
        trained.result.train_loss
    );

    let generator = TextGenerator::from_parts(trained.model, trained.tokenizer);
    let generations = inspect(&generator, &config.prompts, &config.sampling)?;

    tracing::info!("Pipeline finished in {:.2?}", start.elapsed());
    Ok(PipelineReport {
        conversion,
        lora_stats: trained.lora_stats,
        training: trained.result,
        generations,
    })
}
