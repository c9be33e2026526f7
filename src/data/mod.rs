//! Review data and instruction records
//!
//! Turns a tabular review export into instruction-tuning records:
//!
//! ```text
//! Review Text,Rating          {"instruction": "Classify the sentiment of this review: '...'",
//! "Loved it, fits great!",5 -> "input": "",
//!                              "output": "positive"}
//! ```

use serde::{Deserialize, Serialize};

pub mod converter;

pub use converter::{load_json, save_json, ConversionStats, ConverterConfig, DatasetConverter};

/// Prompt prefix used for every instruction
pub const INSTRUCTION_PREFIX: &str = "Classify the sentiment of this review:";

/// A single row of the source CSV
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRecord {
    /// Review body; `None` when the CSV field is empty
    pub review_text: Option<String>,
    /// Star rating (1-5); `None` when the CSV field is empty
    pub rating: Option<f64>,
}

/// Binary sentiment label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
}

impl Sentiment {
    /// Label a rating. A missing rating never reaches the threshold.
    pub fn from_rating(rating: Option<f64>, threshold: f64) -> Self {
        match rating {
            Some(r) if r >= threshold => Self::Positive,
            _ => Self::Negative,
        }
    }

    /// Label text as written into the `output` field
    pub fn label(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Instruction-tuning record
///
/// `input` is the conventional context slot of instruction datasets. The
/// converter always leaves it empty; the tokenizer pipeline still appends it
/// to the prompt so records with context train the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub instruction: String,
    #[serde(default)]
    pub input: String,
    pub output: String,
}

impl InstructionRecord {
    /// Build a record from a review, or `None` when the review text is missing
    pub fn from_review(review: &ReviewRecord, threshold: f64) -> Option<Self> {
        let text = review.review_text.as_deref()?;
        let sentiment = Sentiment::from_rating(review.rating, threshold);
        Some(Self {
            instruction: format!("{} '{}'", INSTRUCTION_PREFIX, text),
            input: String::new(),
            output: sentiment.label().to_string(),
        })
    }

    /// Prompt fed to the model: instruction and input joined by one space
    pub fn prompt(&self) -> String {
        format!("{} {}", self.instruction, self.input)
    }
}
