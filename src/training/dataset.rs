//! Tokenized instruction dataset and batching for training
//!
//! Prompts (`instruction + " " + input`) and target labels are tokenized
//! independently to the same fixed length, so every record contributes
//! three aligned sequences of exactly `max_length` ids.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::InstructionRecord;
use crate::training::models::TokenizerWrapper;

/// Tokenization configuration
#[derive(Debug, Clone)]
pub struct TokenizeConfig {
    /// Every sequence is truncated / padded to this length
    pub max_length: usize,
    /// Records tokenized per call into the tokenizer
    pub batch_size: usize,
}

impl Default for TokenizeConfig {
    fn default() -> Self {
        Self {
            max_length: 128,
            batch_size: 16,
        }
    }
}

impl TokenizeConfig {
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// One record's model inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedRecord {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<u32>,
}

/// A batch of records as `[batch, max_length]` u32 tensors
#[derive(Debug, Clone)]
pub struct TrainBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub labels: Tensor,
}

impl TrainBatch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }
}

/// Columnar tokenized dataset, aligned by record index
#[derive(Debug, Clone)]
pub struct TokenizedDataset {
    input_ids: Vec<Vec<u32>>,
    attention_mask: Vec<Vec<u32>>,
    labels: Vec<Vec<u32>>,
    max_length: usize,
}

impl TokenizedDataset {
    /// Tokenize instruction records in chunks of `config.batch_size`
    pub fn from_records(
        records: &[InstructionRecord],
        tokenizer: &TokenizerWrapper,
        config: &TokenizeConfig,
    ) -> Result<Self> {
        if config.max_length == 0 {
            anyhow::bail!("max_length must be greater than 0");
        }
        let chunk_size = config.batch_size.max(1);

        let mut dataset = Self {
            input_ids: Vec::with_capacity(records.len()),
            attention_mask: Vec::with_capacity(records.len()),
            labels: Vec::with_capacity(records.len()),
            max_length: config.max_length,
        };

        for chunk in records.chunks(chunk_size) {
            let prompts: Vec<String> = chunk.iter().map(|r| r.prompt()).collect();
            let outputs: Vec<String> = chunk.iter().map(|r| r.output.clone()).collect();

            let inputs = tokenizer.encode_fixed(&prompts, config.max_length)?;
            let targets = tokenizer.encode_fixed(&outputs, config.max_length)?;

            for (input, target) in inputs.into_iter().zip(targets) {
                dataset.input_ids.push(input.input_ids);
                dataset.attention_mask.push(input.attention_mask);
                dataset.labels.push(target.input_ids);
            }
        }

        tracing::info!(
            "Tokenized {} records to length {}",
            dataset.len(),
            dataset.max_length
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn get(&self, idx: usize) -> Option<TokenizedRecord> {
        Some(TokenizedRecord {
            input_ids: self.input_ids.get(idx)?.clone(),
            attention_mask: self.attention_mask.get(idx)?.clone(),
            labels: self.labels.get(idx)?.clone(),
        })
    }

    /// Record order for one epoch, shuffled deterministically from `seed`
    pub fn epoch_order(&self, seed: u64, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);
        order
    }

    /// Stack the given records into a batch on `device`
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<TrainBatch> {
        if indices.is_empty() {
            anyhow::bail!("Cannot build an empty batch");
        }
        let stack = |column: &[Vec<u32>]| -> Result<Tensor> {
            let mut flat = Vec::with_capacity(indices.len() * self.max_length);
            for &idx in indices {
                let row = column
                    .get(idx)
                    .ok_or_else(|| anyhow::anyhow!("Record index {} out of range", idx))?;
                flat.extend_from_slice(row);
            }
            Ok(Tensor::from_vec(flat, (indices.len(), self.max_length), device)?)
        };

        Ok(TrainBatch {
            input_ids: stack(&self.input_ids)?,
            attention_mask: stack(&self.attention_mask)?,
            labels: stack(&self.labels)?,
        })
    }

    /// Batches over `order`; the last batch may be short
    pub fn batches<'a>(
        &'a self,
        order: &'a [usize],
        batch_size: usize,
        device: &'a Device,
    ) -> impl Iterator<Item = Result<TrainBatch>> + 'a {
        order
            .chunks(batch_size.max(1))
            .map(move |indices| self.batch(indices, device))
    }

    /// Number of batches per epoch
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::models::tokenizer::tests::test_tokenizer;
    use tempfile::TempDir;

    fn record(text: &str, output: &str) -> InstructionRecord {
        InstructionRecord {
            instruction: format!("Classify the sentiment of this review: '{}'", text),
            input: String::new(),
            output: output.to_string(),
        }
    }

    fn sample_records() -> Vec<InstructionRecord> {
        vec![
            record("Loved it, fits great!", "positive"),
            record("Terrible quality, returned it", "negative"),
            record("", "negative"),
            record(&"great ".repeat(300), "positive"),
            record("fits", "positive"),
        ]
    }

    #[test]
    fn test_every_sequence_has_max_length() {
        let dir = TempDir::new().unwrap();
        let tokenizer = test_tokenizer(dir.path());
        let dataset =
            TokenizedDataset::from_records(&sample_records(), &tokenizer, &TokenizeConfig::default()).unwrap();

        assert_eq!(dataset.len(), 5);
        for idx in 0..dataset.len() {
            let rec = dataset.get(idx).unwrap();
            assert_eq!(rec.input_ids.len(), 128);
            assert_eq!(rec.attention_mask.len(), 128);
            assert_eq!(rec.labels.len(), 128);
        }

        // the 300-word review is truncated with no padding left
        let long = dataset.get(3).unwrap();
        assert!(long.attention_mask.iter().all(|&m| m == 1));
        // label "positive" is <s> positive, then EOS padding
        let short = dataset.get(0).unwrap();
        assert_eq!(&short.labels[..3], &[1, 17, 2]);
        assert!(dataset.get(5).is_none());
    }

    #[test]
    fn test_chunking_does_not_change_result() {
        let dir = TempDir::new().unwrap();
        let tokenizer = test_tokenizer(dir.path());
        let records = sample_records();

        let chunked = TokenizedDataset::from_records(&records, &tokenizer, &TokenizeConfig::default().with_batch_size(2))
            .unwrap();
        let single = TokenizedDataset::from_records(&records, &tokenizer, &TokenizeConfig::default().with_batch_size(1))
            .unwrap();

        for idx in 0..records.len() {
            assert_eq!(chunked.get(idx), single.get(idx));
        }
    }

    #[test]
    fn test_input_field_is_appended_to_prompt() {
        let dir = TempDir::new().unwrap();
        let tokenizer = test_tokenizer(dir.path());
        let config = TokenizeConfig::default().with_max_length(16);

        let mut with_input = record("fits", "positive");
        with_input.input = "great".to_string();
        let without = record("fits great", "positive");

        let a = TokenizedDataset::from_records(&[with_input], &tokenizer, &config).unwrap();
        let b = TokenizedDataset::from_records(&[without], &tokenizer, &config).unwrap();
        // "... 'fits' great" vs "... 'fits great'": same tokens, different order
        let count = |ids: &[u32]| ids.iter().filter(|&&id| id != 2).count();
        assert_eq!(count(&a.get(0).unwrap().input_ids), count(&b.get(0).unwrap().input_ids));
        assert_ne!(a.get(0).unwrap().input_ids, b.get(0).unwrap().input_ids);
    }

    #[test]
    fn test_epoch_order_is_seeded_permutation() {
        let dir = TempDir::new().unwrap();
        let tokenizer = test_tokenizer(dir.path());
        let dataset =
            TokenizedDataset::from_records(&sample_records(), &tokenizer, &TokenizeConfig::default()).unwrap();

        let a = dataset.epoch_order(42, 0);
        assert_eq!(a, dataset.epoch_order(42, 0));
        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_batches() {
        let dir = TempDir::new().unwrap();
        let tokenizer = test_tokenizer(dir.path());
        let dataset = TokenizedDataset::from_records(
            &sample_records(),
            &tokenizer,
            &TokenizeConfig::default().with_max_length(32),
        )
        .unwrap();
        let device = Device::Cpu;

        let order: Vec<usize> = (0..dataset.len()).collect();
        let batches: Vec<TrainBatch> = dataset
            .batches(&order, 2, &device)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(dataset.num_batches(2), 3);
        assert_eq!(batches[0].input_ids.dims(), &[2, 32]);
        assert_eq!(batches[2].batch_size(), 1);

        let row: Vec<u32> = batches[1].labels.get(0).unwrap().to_vec1().unwrap();
        assert_eq!(row, dataset.get(2).unwrap().labels);

        assert!(dataset.batch(&[], &device).is_err());
        assert!(dataset.batch(&[9], &device).is_err());
    }
}
