//! # qlora-sentiment
//!
//! QLoRA fine-tuning of a causal language model for review sentiment
//! classification, built on Candle.
//!
//! ## Overview
//!
//! A product-review CSV is turned into instruction records, tokenized to a
//! fixed length, and used to train low-rank adapters on top of a frozen
//! base model whose projections are quantized to 4 bits. The trained model
//! is then sampled on a pair of hand-written prompts.
//!
//! ## Architecture
//!
//! - `data` - CSV to instruction JSON conversion
//! - `training` - Quantized model, LoRA adapters, optimizer and trainer
//! - `generation` - KV-cached sampling from the adapted model
//! - `pipeline` - The five stages run end to end
//! - `cli` - Command-line interface

pub mod cli;
pub mod data;
pub mod generation;
pub mod pipeline;
pub mod training;

// Re-export commonly used types
pub use anyhow::{Error, Result};
