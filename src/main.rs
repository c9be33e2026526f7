use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qlora_sentiment::cli::{self, ModelArgs, SamplingArgs, TrainArgs, DEFAULT_CSV, DEFAULT_JSON};

#[derive(Parser)]
#[command(name = "qlora-sentiment")]
#[command(about = "QLoRA fine-tuning of a quantized causal LM for review sentiment", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert the review CSV into instruction JSON
    Convert {
        /// Review export with "Review Text" and "Rating" columns
        #[arg(short, long, default_value = DEFAULT_CSV)]
        csv: PathBuf,

        /// Output JSON file
        #[arg(short, long, default_value = DEFAULT_JSON)]
        json: PathBuf,

        /// Keep at most this many records
        #[arg(long, default_value_t = 500)]
        max_records: usize,
    },

    /// Fine-tune LoRA adapters on instruction JSON
    Train {
        /// Instruction JSON produced by `convert`
        #[arg(short, long, default_value = DEFAULT_JSON)]
        json: PathBuf,

        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        train: TrainArgs,
    },

    /// Sample prompts from the base model or a trained adapter
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        /// Adapter directory (the training output dir or a checkpoint)
        #[arg(short, long)]
        adapter: Option<PathBuf>,

        /// Prompt to complete; repeat for several (defaults to the two review prompts)
        #[arg(short, long)]
        prompt: Vec<String>,

        /// Activation dtype: f32, f16, or bf16
        #[arg(long, default_value = "f16")]
        dtype: String,

        #[command(flatten)]
        sampling: SamplingArgs,
    },

    /// Convert, train, and sample in one run
    Run {
        /// Review export with "Review Text" and "Rating" columns
        #[arg(short, long, default_value = DEFAULT_CSV)]
        csv: PathBuf,

        /// Intermediate JSON file
        #[arg(short, long, default_value = DEFAULT_JSON)]
        json: PathBuf,

        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        train: TrainArgs,

        #[command(flatten)]
        sampling: SamplingArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qlora_sentiment=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            csv,
            json,
            max_records,
        } => {
            cli::convert(csv, json, max_records).await?;
        }

        Commands::Train { json, model, train } => {
            let config = cli::pipeline_config(
                PathBuf::from(DEFAULT_CSV),
                json,
                &model,
                &train,
                &SamplingArgs::default(),
            )?;
            cli::train(config).await?;
        }

        Commands::Generate {
            model,
            adapter,
            prompt,
            dtype,
            sampling,
        } => {
            let config = model.generator_config(adapter, &dtype)?;
            cli::generate(config, prompt, sampling.sampling_params()).await?;
        }

        Commands::Run {
            csv,
            json,
            model,
            train,
            sampling,
        } => {
            let config = cli::pipeline_config(csv, json, &model, &train, &sampling)?;
            cli::run(config).await?;
        }
    }

    Ok(())
}
