//! KV-cached sampling over the quantized Mistral decoder
//!
//! Works with the bare base model or with trained adapters attached, either
//! handed over in memory by the trainer or loaded from an adapter directory.

use anyhow::{Context, Result};
use candle_core::Tensor;
use candle_nn::VarMap;
use candle_transformers::generation::{LogitsProcessor, Sampling};

use super::{Generator, GeneratorConfig, SamplingParams};
use crate::training::checkpoint::{load_adapter, load_adapter_config};
use crate::training::device::parse_dtype;
use crate::training::models::Cache;
use crate::training::{
    load_model, select_device, LoadConfig, ModelLoader, QuantizedMistral,
    TokenizerWrapper,
};

/// Why decoding stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Eos,
    MaxTokens,
    ContextFull,
}

/// Result of one generation call
#[derive(Debug, Clone)]
pub struct Generation {
    pub prompt: String,
    pub completion: String,
    /// Sampled token ids, EOS included when it was produced
    pub token_ids: Vec<u32>,
    pub stop_reason: StopReason,
}

impl Generation {
    /// Prompt followed by the completion
    pub fn text(&self) -> String {
        format!("{}{}", self.prompt, self.completion)
    }
}

/// Text generator over a (possibly adapted) quantized Mistral
pub struct TextGenerator {
    model: QuantizedMistral,
    tokenizer: TokenizerWrapper,
    eos_token_id: Option<u32>,
}

impl TextGenerator {
    /// Load the base model and, if configured, a trained adapter
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        let device = select_device(config.device)?;
        let dtype = parse_dtype(&config.dtype)?;

        let adapter_config = config
            .adapter_path
            .as_ref()
            .map(load_adapter_config)
            .transpose()
            .context("Failed to read adapter config")?;

        let quant = adapter_config.as_ref().map_or(config.quant, |a| a.quant);
        if let Some(adapter) = &adapter_config {
            if adapter.base_model_name_or_path != config.model_id {
                tracing::warn!(
                    "Adapter was trained on {} but base model is {}",
                    adapter.base_model_name_or_path,
                    config.model_id
                );
            }
        }

        tracing::info!("Loading generator model: {}", config.model_id);
        tracing::info!("  Dtype: {}", config.dtype);
        tracing::info!("  Quantization: {}", quant);

        let loader = ModelLoader::with_config(&config.hub_config())?;
        let load_cfg = LoadConfig::default().with_dtype(dtype).with_quant(quant);
        let (mut model, tokenizer) = load_model(&config.model_id, &loader, &device, &load_cfg)?;

        if let (Some(path), Some(adapter)) = (&config.adapter_path, &adapter_config) {
            let mut var_map = VarMap::new();
            model.inject_lora(&adapter.lora, &var_map)?;
            load_adapter(path, &mut var_map)?;
        }

        Ok(Self::from_parts(model, tokenizer))
    }

    /// Wrap an already loaded model, e.g. straight after training
    pub fn from_parts(model: QuantizedMistral, tokenizer: TokenizerWrapper) -> Self {
        let eos_token_id = tokenizer.eos_token_id().or(model.config().eos_token_id);
        Self {
            model,
            tokenizer,
            eos_token_id,
        }
    }

    pub fn model(&self) -> &QuantizedMistral {
        &self.model
    }

    pub fn tokenizer(&self) -> &TokenizerWrapper {
        &self.tokenizer
    }

    /// Sample a completion for `prompt`
    pub fn complete(&self, prompt: &str, params: &SamplingParams) -> Result<Generation> {
        let prompt_tokens = self.tokenizer.encode(prompt, true)?.input_ids;
        if prompt_tokens.is_empty() {
            anyhow::bail!("Empty prompt after tokenization");
        }

        let max_context = self.max_context_length();
        if prompt_tokens.len() >= max_context {
            anyhow::bail!(
                "Prompt is {} tokens, the model context is {}",
                prompt_tokens.len(),
                max_context
            );
        }

        let seed = params.seed.unwrap_or_else(rand::random);
        let mut logits_processor = LogitsProcessor::from_sampling(seed, sampling(params));
        let mut cache = Cache::new(self.model.num_layers());
        let device = self.model.device();

        let mut all_tokens = prompt_tokens.clone();
        let mut stop_reason = StopReason::MaxTokens;

        let mut pos = 0;
        for _ in 0..params.max_new_tokens {
            if all_tokens.len() >= max_context {
                stop_reason = StopReason::ContextFull;
                break;
            }

            let context_size = if pos == 0 { all_tokens.len() } else { 1 };
            let start_pos = all_tokens.len() - context_size;
            let input = Tensor::new(&all_tokens[start_pos..], device)?.unsqueeze(0)?;

            let logits = self.model.forward(&input, None, Some(&mut cache), false)?;
            let logits = logits.squeeze(0)?.get(context_size - 1)?;

            let logits = if params.repetition_penalty != 1.0 {
                let start = all_tokens.len().saturating_sub(params.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repetition_penalty,
                    &all_tokens[start..],
                )?
            } else {
                logits
            };

            let next_token = logits_processor.sample(&logits)?;
            all_tokens.push(next_token);
            pos += context_size;

            if Some(next_token) == self.eos_token_id {
                tracing::debug!("Generation stopped: EOS token");
                stop_reason = StopReason::Eos;
                break;
            }
        }

        let completion = self.decode_completion(&prompt_tokens, &all_tokens)?;
        Ok(Generation {
            prompt: prompt.to_string(),
            completion,
            token_ids: all_tokens[prompt_tokens.len()..].to_vec(),
            stop_reason,
        })
    }

    /// Text added after the prompt
    ///
    /// Decodes the whole sequence and drops the decoded prompt so that
    /// word-boundary spaces the tokenizer attaches to the first new token
    /// are kept.
    fn decode_completion(&self, prompt_tokens: &[u32], all_tokens: &[u32]) -> Result<String> {
        let full = self.tokenizer.decode(all_tokens, true)?;
        let prompt_text = self.tokenizer.decode(prompt_tokens, true)?;
        match full.strip_prefix(prompt_text.as_str()) {
            Some(rest) => Ok(rest.to_string()),
            None => self.tokenizer.decode(&all_tokens[prompt_tokens.len()..], true),
        }
    }
}

fn sampling(params: &SamplingParams) -> Sampling {
    let temperature = params.temperature;
    if temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    match (params.top_k, params.top_p) {
        (None, None) => Sampling::All { temperature },
        (Some(k), None) => Sampling::TopK { k, temperature },
        (None, Some(p)) => Sampling::TopP { p, temperature },
        (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
    }
}

impl Generator for TextGenerator {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String> {
        Ok(self.complete(prompt, params)?.text())
    }

    fn model_name(&self) -> &str {
        self.model.model_id()
    }

    fn max_context_length(&self) -> usize {
        self.model.config().max_position_embeddings
    }

    fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(self.tokenizer.encode(text, false)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::load_json;
    use crate::pipeline::tests::offline_config;
    use crate::pipeline::{convert_dataset, train_adapter};
    use crate::training::lora::LoraConfig;
    use crate::training::DevicePreference;
    use crate::training::models::mistral::tests::tiny_model;
    use crate::training::models::tokenizer::tests::test_tokenizer;
    use candle_core::{DType, Device};
    use tempfile::TempDir;

    const PROMPT: &str = "classify the sentiment of this review : loved it";

    fn generator(dir: &TempDir) -> TextGenerator {
        TextGenerator::from_parts(tiny_model(&Device::Cpu), test_tokenizer(dir.path()))
    }

    #[test]
    fn test_greedy_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let generator = generator(&dir);
        let params = SamplingParams::greedy().with_max_new_tokens(8);

        let a = generator.generate(PROMPT, &params).unwrap();
        let b = generator.generate(PROMPT, &params).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with(PROMPT));
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let dir = TempDir::new().unwrap();
        let generator = generator(&dir);
        let params = SamplingParams::default().with_max_new_tokens(10).with_seed(1234);

        let a = generator.complete(PROMPT, &params).unwrap();
        let b = generator.complete(PROMPT, &params).unwrap();
        assert_eq!(a.token_ids, b.token_ids);
    }

    #[test]
    fn test_respects_max_new_tokens() {
        let dir = TempDir::new().unwrap();
        let generator = generator(&dir);

        let out = generator
            .complete(PROMPT, &SamplingParams::default().with_max_new_tokens(5).with_seed(3))
            .unwrap();
        assert!(out.token_ids.len() <= 5);
        if out.token_ids.len() < 5 {
            assert_eq!(out.stop_reason, StopReason::Eos);
            assert_eq!(out.token_ids.last(), Some(&2));
        } else {
            assert!(matches!(out.stop_reason, StopReason::MaxTokens | StopReason::Eos));
        }

        let none = generator
            .complete(PROMPT, &SamplingParams::greedy().with_max_new_tokens(0))
            .unwrap();
        assert!(none.token_ids.is_empty());
        assert_eq!(none.text(), PROMPT);
    }

    #[test]
    fn test_cached_decoding_matches_full_recompute() {
        let dir = TempDir::new().unwrap();
        let generator = generator(&dir);
        let steps = 6;
        let out = generator
            .complete(PROMPT, &SamplingParams::greedy().with_max_new_tokens(steps))
            .unwrap();

        let device = Device::Cpu;
        let mut tokens = generator.tokenizer().encode(PROMPT, true).unwrap().input_ids;
        let mut expected = Vec::new();
        for _ in 0..out.token_ids.len() {
            let input = Tensor::new(&tokens[..], &device).unwrap().unsqueeze(0).unwrap();
            let logits = generator.model().forward(&input, None, None, false).unwrap();
            let last = logits.squeeze(0).unwrap().get(tokens.len() - 1).unwrap();
            let next = last.argmax(0).unwrap().to_scalar::<u32>().unwrap();
            expected.push(next);
            tokens.push(next);
        }
        assert_eq!(out.token_ids, expected);
    }

    #[test]
    fn test_generates_with_adapters_attached() {
        let dir = TempDir::new().unwrap();
        let mut model = tiny_model(&Device::Cpu);
        let var_map = VarMap::new();
        model.inject_lora(&LoraConfig::default(), &var_map).unwrap();

        let generator = TextGenerator::from_parts(model, test_tokenizer(dir.path()));
        let out = generator
            .complete(PROMPT, &SamplingParams::greedy().with_max_new_tokens(4))
            .unwrap();
        assert!(out.text().starts_with(PROMPT));
        assert_eq!(generator.model().load_config().dtype, DType::F32);
    }

    #[test]
    fn test_prompt_longer_than_context_is_error() {
        let dir = TempDir::new().unwrap();
        let generator = generator(&dir);
        let long = vec!["great"; 300].join(" ");
        assert!(generator.complete(&long, &SamplingParams::greedy()).is_err());
    }

    #[test]
    fn test_generator_trait_accessors() {
        let dir = TempDir::new().unwrap();
        let generator = generator(&dir);
        assert_eq!(generator.model_name(), "local");
        assert_eq!(generator.max_context_length(), 256);
        assert_eq!(generator.count_tokens("loved it").unwrap(), 2);
    }

    #[test]
    fn test_loaded_adapter_matches_trained_model() {
        let dir = TempDir::new().unwrap();
        let config = offline_config(&dir);
        convert_dataset(&config).unwrap();
        let records = load_json(&config.json_path).unwrap();
        let trained = train_adapter(&config, &records).unwrap();
        let in_memory = TextGenerator::from_parts(trained.model, trained.tokenizer);

        let loaded = TextGenerator::new(
            GeneratorConfig::new(&config.model_id)
                .with_adapter(&config.training.output_dir)
                .with_device(DevicePreference::Cpu)
                .with_dtype("f32"),
        )
        .unwrap();
        assert!(loaded.model().lora_config().is_some());
        assert_eq!(loaded.model().load_config().quant, config.quant);

        let ids = loaded.tokenizer().encode(PROMPT, true).unwrap().input_ids;
        let input = Tensor::new(&ids[..], &Device::Cpu).unwrap().unsqueeze(0).unwrap();
        let expected = in_memory.model().forward(&input, None, None, false).unwrap();
        let actual = loaded.model().forward(&input, None, None, false).unwrap();
        let diff = (expected - actual)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "logits differ by {}", diff);

        let params = SamplingParams::greedy().with_max_new_tokens(6);
        assert_eq!(
            in_memory.complete(PROMPT, &params).unwrap().token_ids,
            loaded.complete(PROMPT, &params).unwrap().token_ids
        );
    }
}
