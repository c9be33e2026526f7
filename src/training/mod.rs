//! QLoRA fine-tuning with Candle
//!
//! For GPU support:
//! ```bash
//! cargo build --features cuda    # NVIDIA GPU
//! cargo build --features metal   # Apple GPU
//! ```
//!
//! # Modules
//!
//! - `device` - CPU/CUDA/Metal device selection
//! - `hub` - HuggingFace Hub integration
//! - `quant` - 4-bit quantized linear layers
//! - `models` - Quantized Mistral decoder and tokenizer
//! - `lora` - LoRA adapter implementation
//! - `loss` - Causal LM loss
//! - `optimizer` - Paged AdamW and LR schedules
//! - `dataset` - Tokenization and batching
//! - `checkpoint` - Adapter / optimizer checkpoints
//! - `trainer` - Training loop

pub mod checkpoint;
pub mod dataset;
pub mod device;
pub mod hub;
pub mod lora;
pub mod loss;
pub mod models;
pub mod optimizer;
pub mod quant;
pub mod trainer;

// Re-exports
pub use checkpoint::{load_adapter, save_checkpoint, AdapterConfig, TrainerState};
pub use dataset::{TokenizeConfig, TokenizedDataset, TokenizedRecord, TrainBatch};
pub use device::{select_device, DevicePreference};
pub use hub::{HubApi, HubConfig, ModelLoader, ModelPath};
pub use lora::{LoraBias, LoraConfig, LoraStats};
pub use models::{load_model, LoadConfig, MistralConfig, QuantizedMistral, TokenizerWrapper};
pub use optimizer::{OptimizerKind, PagedAdamW, SchedulerKind};
pub use quant::{QuantType, QuantizedLinear};
pub use trainer::{Trainer, TrainingConfig, TrainingMetrics, TrainingPhase, TrainingResult};
