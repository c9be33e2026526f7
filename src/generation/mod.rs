//! Text generation for inspecting a fine-tuned model
//!
//! A trait-based seam over decoder models, with one Candle implementation
//! over the quantized Mistral decoder.

pub mod candle;
pub mod config;

pub use candle::{Generation, StopReason, TextGenerator};
pub use config::{GeneratorConfig, SamplingParams};

use anyhow::Result;

/// The two review prompts sampled after training
pub const DEFAULT_PROMPTS: [&str; 2] = [
    "Classify the sentiment of this review: 'I love how soft and flattering this shirt feels!'\nSentiment:",
    "Classify the sentiment of this review: 'I dislike how soft and flattering this shirt feels!'\nSentiment:",
];

/// Trait for text generation models
pub trait Generator: Send + Sync {
    /// Generate text for a prompt
    ///
    /// # Returns
    /// * The prompt followed by the generated continuation
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String>;

    /// Get the model name/identifier
    fn model_name(&self) -> &str;

    /// Get maximum context length (in tokens)
    fn max_context_length(&self) -> usize;

    /// Count tokens in text, special tokens excluded
    fn count_tokens(&self, text: &str) -> Result<usize>;
}
