//! Command-line interface
//!
//! Provides CLI commands for convert, train, generate, and run. Argument
//! groups are shared between commands and turned into the library config
//! structs here.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::data::{ConverterConfig, DatasetConverter};
use crate::generation::{GeneratorConfig, SamplingParams, TextGenerator, DEFAULT_PROMPTS};
use crate::pipeline::{self, PipelineConfig, PipelineReport};
use crate::training::hub::DEFAULT_TOKEN_ENV;
use crate::training::{LoraConfig, TokenizeConfig, TrainingConfig};

pub const DEFAULT_CSV: &str = "Womens Clothing E-Commerce Reviews.csv";
pub const DEFAULT_JSON: &str = "sentiment_instructions.json";
pub const DEFAULT_MODEL: &str = "mistralai/Mistral-7B-Instruct-v0.1";
pub const DEFAULT_OUTPUT_DIR: &str = "./qlora_sentiment";

/// Base model selection
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// HuggingFace model ID or local directory
    #[arg(short, long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Device: auto, cpu, cuda, or metal
    #[arg(long, default_value = "auto")]
    pub device: String,

    /// Environment variable holding the HuggingFace token
    #[arg(long, default_value = DEFAULT_TOKEN_ENV)]
    pub hf_token_env: String,

    /// Base weight format: q4_0, q4_1, q4k, or q8_0
    #[arg(long, default_value = "q4_0")]
    pub quant: String,

    /// Hub download cache (defaults to the hf-hub cache)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

impl ModelArgs {
    /// Generator settings for this base model
    pub fn generator_config(&self, adapter: Option<PathBuf>, dtype: &str) -> Result<GeneratorConfig> {
        Ok(GeneratorConfig {
            model_id: self.model.clone(),
            adapter_path: adapter,
            device: self.device.parse()?,
            dtype: dtype.to_string(),
            quant: self.quant.parse()?,
            token_env: self.hf_token_env.clone(),
            cache_dir: self.cache_dir.clone(),
        })
    }
}

/// Tokenization, adapter and optimization settings
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Output directory for checkpoints and the final adapter
    #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,

    /// Number of epochs
    #[arg(long, default_value_t = 3)]
    pub epochs: usize,

    /// Per-device batch size
    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,

    /// Learning rate
    #[arg(long, default_value_t = 5e-5)]
    pub learning_rate: f64,

    /// Fixed sequence length for prompts and labels
    #[arg(long, default_value_t = 128)]
    pub max_length: usize,

    /// LoRA rank
    #[arg(long, default_value_t = 8)]
    pub lora_rank: usize,

    /// LoRA alpha
    #[arg(long, default_value_t = 32.0)]
    pub lora_alpha: f32,

    /// LoRA dropout
    #[arg(long, default_value_t = 0.1)]
    pub lora_dropout: f32,

    /// Projections to adapt, comma separated
    #[arg(long, value_delimiter = ',', default_value = "q_proj,v_proj")]
    pub target_modules: Vec<String>,

    /// Gradient accumulation steps
    #[arg(long, default_value_t = 1)]
    pub gradient_accumulation: usize,

    /// Warmup ratio (fraction of total steps)
    #[arg(long, default_value_t = 0.0)]
    pub warmup_ratio: f64,

    /// Log every N steps
    #[arg(long, default_value_t = 10)]
    pub logging_steps: usize,

    /// Save checkpoint every N steps (0 to disable)
    #[arg(long, default_value_t = 100)]
    pub save_steps: usize,

    /// Optimizer: paged_adamw or adamw
    #[arg(long, default_value = "paged_adamw")]
    pub optimizer: String,

    /// LR schedule: linear, cosine, or constant
    #[arg(long, default_value = "linear")]
    pub scheduler: String,

    /// Shuffling seed
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Keep activations in f32
    #[arg(long)]
    pub no_fp16: bool,

    /// Append logged metrics to <output_dir>/metrics.jsonl
    #[arg(long)]
    pub report_metrics: bool,
}

/// Sampling settings for the inspection prompts
#[derive(Args, Debug, Clone)]
pub struct SamplingArgs {
    /// Maximum new tokens per prompt
    #[arg(long, default_value_t = 50)]
    pub max_new_tokens: usize,

    /// Sampling temperature (0 for greedy)
    #[arg(long, default_value_t = 0.7)]
    pub temperature: f64,

    /// Nucleus sampling threshold
    #[arg(long)]
    pub top_p: Option<f64>,

    /// Sampling seed (random when omitted)
    #[arg(long)]
    pub sampling_seed: Option<u64>,
}

impl TrainArgs {
    pub fn training_config(&self) -> Result<TrainingConfig> {
        Ok(TrainingConfig {
            output_dir: self.output_dir.clone(),
            per_device_batch_size: self.batch_size,
            num_epochs: self.epochs,
            learning_rate: self.learning_rate,
            warmup_ratio: self.warmup_ratio,
            gradient_accumulation_steps: self.gradient_accumulation,
            logging_steps: self.logging_steps,
            save_steps: self.save_steps,
            fp16: !self.no_fp16,
            optimizer: self.optimizer.parse()?,
            scheduler: self.scheduler.parse()?,
            seed: self.seed,
            report_metrics: self.report_metrics,
            ..Default::default()
        })
    }

    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig::new(self.lora_rank, self.lora_alpha)
            .with_dropout(self.lora_dropout)
            .with_target_modules(self.target_modules.clone())
    }
}

impl Default for SamplingArgs {
    fn default() -> Self {
        let params = SamplingParams::default();
        Self {
            max_new_tokens: params.max_new_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            sampling_seed: params.seed,
        }
    }
}

impl SamplingArgs {
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.sampling_seed,
            ..Default::default()
        }
    }
}

/// Assemble a pipeline config from parsed arguments
pub fn pipeline_config(
    csv: PathBuf,
    json: PathBuf,
    model: &ModelArgs,
    train: &TrainArgs,
    sampling: &SamplingArgs,
) -> Result<PipelineConfig> {
    let config = PipelineConfig {
        csv_path: csv,
        json_path: json,
        model_id: model.model.clone(),
        token_env: model.hf_token_env.clone(),
        cache_dir: model.cache_dir.clone(),
        device: model.device.parse()?,
        quant: model.quant.parse()?,
        tokenize: TokenizeConfig::default().with_max_length(train.max_length),
        lora: train.lora_config(),
        training: train.training_config()?,
        sampling: sampling.sampling_params(),
        ..Default::default()
    };
    config.validate()?;
    Ok(config)
}

/// Execute the convert command
pub async fn convert(csv: PathBuf, json: PathBuf, max_records: usize) -> Result<()> {
    tracing::info!("Converting reviews");
    tracing::info!("  Input: {:?}", csv);
    tracing::info!("  Output: {:?}", json);

    let converter = DatasetConverter::new(ConverterConfig::default().with_max_records(max_records));
    let stats = converter.convert_file(&csv, &json)?;

    println!("\nConversion Summary:");
    println!("  Rows read: {}", stats.rows_read);
    println!("  Rows without text: {}", stats.rows_dropped);
    println!("  Records written: {}", stats.records_written);
    println!("  Positive / negative: {} / {}", stats.positive, stats.negative);
    println!("  Output file: {:?}", json);

    Ok(())
}

/// Execute the train command on an existing instruction JSON file
pub async fn train(config: PipelineConfig) -> Result<()> {
    tracing::info!("Starting QLoRA fine-tuning");
    tracing::info!("  Data: {:?}", config.json_path);
    tracing::info!("  Model: {}", config.model_id);
    tracing::info!("  Output: {:?}", config.training.output_dir);

    let trained = tokio::task::spawn_blocking(move || {
        let records = crate::data::load_json(&config.json_path)?;
        pipeline::train_adapter(&config, &records)
    })
    .await
    .context("Training task panicked")??;

    println!("\nTraining Summary:");
    println!("  {}", trained.lora_stats);
    println!("  Steps: {}", trained.result.global_step);
    println!("  Mean loss: {:.4}", trained.result.train_loss);
    println!("  Adapter: {:?}", trained.result.adapter_path);
    if let Some(checkpoint) = &trained.result.checkpoint_path {
        println!("  Last checkpoint: {:?}", checkpoint);
    }

    Ok(())
}

/// Execute the generate command
pub async fn generate(
    config: GeneratorConfig,
    prompts: Vec<String>,
    params: SamplingParams,
) -> Result<()> {
    let prompts = if prompts.is_empty() {
        DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect()
    } else {
        prompts
    };

    let generations = tokio::task::spawn_blocking(move || {
        let generator = TextGenerator::new(config)?;
        pipeline::inspect(&generator, &prompts, &params)
    })
    .await
    .context("Generation task panicked")??;

    for generation in &generations {
        println!("{}\n", generation.text());
    }

    Ok(())
}

/// Execute the full pipeline
pub async fn run(config: PipelineConfig) -> Result<()> {
    tracing::info!("Running full pipeline");
    tracing::info!("  CSV: {:?}", config.csv_path);
    tracing::info!("  Model: {}", config.model_id);

    let report = tokio::task::spawn_blocking(move || pipeline::run_pipeline(&config))
        .await
        .context("Pipeline task panicked")??;

    print_report(&report);
    Ok(())
}

fn print_report(report: &PipelineReport) {
    println!("\nPipeline Summary:");
    println!("  Dataset: {}", report.conversion);
    println!("  {}", report.lora_stats);
    println!("  Steps: {}", report.training.global_step);
    println!("  Mean loss: {:.4}", report.training.train_loss);
    println!("  Adapter: {:?}", report.training.adapter_path);

    println!("\nGenerations:");
    for generation in &report.generations {
        println!("{}\n", generation.text());
    }
}
