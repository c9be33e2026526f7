//! Model wrappers: the quantized Mistral decoder and its tokenizer

pub mod mistral;
pub mod tokenizer;

pub use mistral::{AdaptedLinear, Cache, LoadConfig, MistralConfig, QuantizedMistral};
pub use tokenizer::{EncodedInput, TokenizerWrapper};

use anyhow::Result;
use candle_core::Device;

use super::hub::ModelLoader;

/// Resolve a model id or local path and load both model and tokenizer
pub fn load_model(
    model_id_or_path: &str,
    loader: &ModelLoader,
    device: &Device,
    load_cfg: &LoadConfig,
) -> Result<(QuantizedMistral, TokenizerWrapper)> {
    let model_path = loader.load_model_path(model_id_or_path)?;
    let tokenizer = TokenizerWrapper::from_model_path(&model_path)?;
    let model = QuantizedMistral::from_model_path(&model_path, device, load_cfg)?;

    tracing::info!(
        "Loaded {} on {} ({} params)",
        model_path.model_id,
        super::device::device_name(device),
        model.num_params()
    );
    Ok((model, tokenizer))
}
