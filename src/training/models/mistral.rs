//! Mistral decoder with 4-bit quantized projections and LoRA adapters
//!
//! Layout and tensor names follow the Hugging Face `MistralForCausalLM`
//! checkpoints (`model.layers.{i}.self_attn.q_proj.weight`, ...). Every
//! attention and MLP projection is quantized at load time; embeddings,
//! norms and the LM head stay in the compute dtype.
//!
//! All pieces between the projections (norm, rotary embedding, attention,
//! activation) are written with differentiable tensor ops so that gradients
//! reach the adapters in every layer.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::training::hub::ModelPath;
use crate::training::lora::{LoraAdapter, LoraConfig, LoraStats};
use crate::training::quant::{QuantType, QuantizedLinear};

fn default_max_position_embeddings() -> usize {
    32768
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10_000.0
}

/// Architecture hyperparameters read from `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MistralConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub sliding_window: Option<usize>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

impl MistralConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse model config: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Per-head dimension
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            anyhow::bail!("Model config must have at least one attention head");
        }
        if self.head_dim.is_none() && self.hidden_size % self.num_attention_heads != 0 {
            anyhow::bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            );
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            anyhow::bail!(
                "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                self.num_attention_heads,
                self.num_key_value_heads
            );
        }
        Ok(())
    }
}

/// How the base checkpoint is materialized
#[derive(Debug, Clone, Copy)]
pub struct LoadConfig {
    /// Activation / non-quantized weight dtype
    pub dtype: DType,
    /// Projection weight format
    pub quant: QuantType,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            dtype: DType::F16,
            quant: QuantType::Q4_0,
        }
    }
}

impl LoadConfig {
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_quant(mut self, quant: QuantType) -> Self {
        self.quant = quant;
        self
    }
}

/// Quantized projection with an optional adapter
#[derive(Debug, Clone)]
pub struct AdaptedLinear {
    base: QuantizedLinear,
    lora: Option<LoraAdapter>,
}

impl AdaptedLinear {
    fn load(in_dim: usize, out_dim: usize, vb: VarBuilder, quant: QuantType) -> Result<Self> {
        let weight = vb
            .to_dtype(DType::F32)
            .get((out_dim, in_dim), "weight")
            .with_context(|| format!("Failed to load {}.weight", vb.prefix()))?;
        Ok(Self {
            base: QuantizedLinear::from_weight(&weight, None, quant)?,
            lora: None,
        })
    }

    pub fn base(&self) -> &QuantizedLinear {
        &self.base
    }

    pub fn lora(&self) -> Option<&LoraAdapter> {
        self.lora.as_ref()
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.base.forward(x)?;
        match &self.lora {
            Some(lora) => Ok((out + lora.forward(x, train)?.to_dtype(x.dtype())?)?),
            None => Ok(out),
        }
    }
}

/// Root-mean-square norm computed in f32
#[derive(Debug, Clone)]
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get(size, "weight")?,
            eps,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let rms = (x.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        let normed = x.broadcast_div(&rms)?.to_dtype(dtype)?;
        Ok(normed.broadcast_mul(&self.weight)?)
    }
}

#[derive(Debug, Clone)]
struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(cfg: &MistralConfig, device: &Device) -> Result<Self> {
        let dim = cfg.head_dim();
        let max_seq_len = cfg.max_position_embeddings;
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1f32 / cfg.rope_theta.powf(i as f64 / dim as f64) as f32)
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok(Self {
            sin: emb.sin()?,
            cos: emb.cos()?,
        })
    }

    /// Rotate `[batch, heads, seq, head_dim]` f32 queries and keys
    fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;
        let rotate = |x: &Tensor| -> Result<Tensor> {
            let rotated = (x.broadcast_mul(&cos)? + rotate_half(x)?.broadcast_mul(&sin)?)?;
            Ok(rotated)
        };
        Ok((rotate(q)?, rotate(k)?))
    }
}

fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: AdaptedLinear,
    k_proj: AdaptedLinear,
    v_proj: AdaptedLinear,
    o_proj: AdaptedLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rotary: Arc<RotaryEmbedding>,
}

impl Attention {
    fn load(cfg: &MistralConfig, rotary: Arc<RotaryEmbedding>, vb: VarBuilder, quant: QuantType) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let head_dim = cfg.head_dim();
        let q_dim = cfg.num_attention_heads * head_dim;
        let kv_dim = cfg.num_key_value_heads * head_dim;
        Ok(Self {
            q_proj: AdaptedLinear::load(hidden, q_dim, vb.pp("q_proj"), quant)?,
            k_proj: AdaptedLinear::load(hidden, kv_dim, vb.pp("k_proj"), quant)?,
            v_proj: AdaptedLinear::load(hidden, kv_dim, vb.pp("v_proj"), quant)?,
            o_proj: AdaptedLinear::load(q_dim, hidden, vb.pp("o_proj"), quant)?,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads,
            head_dim,
            rotary,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
        offset: usize,
        train: bool,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;
        let dtype = x.dtype();

        let split_heads = |t: Tensor, heads: usize| -> Result<Tensor> {
            Ok(t.reshape((b, seq_len, heads, self.head_dim))?
                .transpose(1, 2)?
                .to_dtype(DType::F32)?
                .contiguous()?)
        };
        let q = split_heads(self.q_proj.forward(x, train)?, self.num_heads)?;
        let k = split_heads(self.k_proj.forward(x, train)?, self.num_kv_heads)?;
        let v = split_heads(self.v_proj.forward(x, train)?, self.num_kv_heads)?;

        let (q, k) = self.rotary.apply(&q, &k, offset)?;

        let (k, v) = match cache {
            Some(slot) => {
                let (k, v) = match slot.take() {
                    Some((prev_k, prev_v)) => (
                        Tensor::cat(&[&prev_k, &k], 2)?,
                        Tensor::cat(&[&prev_v, &v], 2)?,
                    ),
                    None => (k, v),
                };
                *slot = Some((k.clone(), v.clone()));
                (k, v)
            }
            None => (k, v),
        };

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, self.num_heads * self.head_dim))?
            .to_dtype(dtype)?;

        self.o_proj.forward(&out, train)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: AdaptedLinear,
    up_proj: AdaptedLinear,
    down_proj: AdaptedLinear,
}

impl Mlp {
    fn load(cfg: &MistralConfig, vb: VarBuilder, quant: QuantType) -> Result<Self> {
        let (hidden, inter) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            gate_proj: AdaptedLinear::load(hidden, inter, vb.pp("gate_proj"), quant)?,
            up_proj: AdaptedLinear::load(hidden, inter, vb.pp("up_proj"), quant)?,
            down_proj: AdaptedLinear::load(inter, hidden, vb.pp("down_proj"), quant)?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x, train)?.silu()?;
        let up = self.up_proj.forward(x, train)?;
        self.down_proj.forward(&(gate * up)?, train)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(cfg: &MistralConfig, rotary: Arc<RotaryEmbedding>, vb: VarBuilder, quant: QuantType) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(cfg, rotary, vb.pp("self_attn"), quant)?,
            mlp: Mlp::load(cfg, vb.pp("mlp"), quant)?,
            input_layernorm: RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RmsNorm::load(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
        offset: usize,
        train: bool,
    ) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, mask, cache, offset, train)?;
        let x = (residual + h)?;
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h, train)?;
        Ok((x + h)?)
    }

    /// Submodule path and projection for a target name
    fn projection_mut(&mut self, name: &str) -> Option<(&'static str, &mut AdaptedLinear)> {
        match name {
            "q_proj" => Some(("self_attn", &mut self.self_attn.q_proj)),
            "k_proj" => Some(("self_attn", &mut self.self_attn.k_proj)),
            "v_proj" => Some(("self_attn", &mut self.self_attn.v_proj)),
            "o_proj" => Some(("self_attn", &mut self.self_attn.o_proj)),
            "gate_proj" => Some(("mlp", &mut self.mlp.gate_proj)),
            "up_proj" => Some(("mlp", &mut self.mlp.up_proj)),
            "down_proj" => Some(("mlp", &mut self.mlp.down_proj)),
            _ => None,
        }
    }

    fn projections(&self) -> [&AdaptedLinear; 7] {
        [
            &self.self_attn.q_proj,
            &self.self_attn.k_proj,
            &self.self_attn.v_proj,
            &self.self_attn.o_proj,
            &self.mlp.gate_proj,
            &self.mlp.up_proj,
            &self.mlp.down_proj,
        ]
    }
}

/// Per-layer key/value cache for incremental decoding
#[derive(Debug, Clone)]
pub struct Cache {
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl Cache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
        }
    }

    /// Number of positions already cached
    pub fn seq_len(&self) -> usize {
        self.layers
            .first()
            .and_then(|slot| slot.as_ref())
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.layers.iter_mut().for_each(|slot| *slot = None);
    }
}

/// Causal language model with quantized projections
#[derive(Debug, Clone)]
pub struct QuantizedMistral {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    config: MistralConfig,
    load_config: LoadConfig,
    lora_config: Option<LoraConfig>,
    model_id: String,
    device: Device,
}

impl QuantizedMistral {
    /// Build from a var builder over a `MistralForCausalLM` checkpoint
    pub fn load(vb: VarBuilder, cfg: &MistralConfig, load_cfg: &LoadConfig) -> Result<Self> {
        cfg.validate()?;
        let vb = vb.to_dtype(load_cfg.dtype);
        let device = vb.device().clone();
        let vb_m = vb.pp("model");

        let embed_weight = vb_m
            .pp("embed_tokens")
            .get((cfg.vocab_size, cfg.hidden_size), "weight")
            .context("Failed to load embed_tokens")?;
        let embed_tokens = Embedding::new(embed_weight.clone(), cfg.hidden_size);

        let rotary = Arc::new(RotaryEmbedding::new(cfg, &device)?);
        let vb_l = vb_m.pp("layers");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(DecoderLayer::load(cfg, rotary.clone(), vb_l.pp(i), load_cfg.quant)?);
            tracing::debug!("Quantized layer {}/{}", i + 1, cfg.num_hidden_layers);
        }

        let norm = RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;
        let lm_head_weight = if cfg.tie_word_embeddings {
            embed_weight
        } else {
            vb.pp("lm_head")
                .get((cfg.vocab_size, cfg.hidden_size), "weight")
                .context("Failed to load lm_head")?
        };

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head: Linear::new(lm_head_weight, None),
            config: cfg.clone(),
            load_config: *load_cfg,
            lora_config: None,
            model_id: "local".to_string(),
            device,
        })
    }

    /// Load config and safetensors weights from a resolved model directory
    pub fn from_model_path(model_path: &ModelPath, device: &Device, load_cfg: &LoadConfig) -> Result<Self> {
        model_path.validate()?;
        let config = MistralConfig::from_file(&model_path.config_file)?;

        tracing::info!(
            "Loading {} ({} layers, hidden {}, {} heads / {} kv heads) as {} with {:?} activations",
            model_path.model_id,
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_key_value_heads,
            load_cfg.quant,
            load_cfg.dtype
        );

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&model_path.weights_files, load_cfg.dtype, device)
                .context("Failed to memory-map model weights")?
        };
        let mut model = Self::load(vb, &config, load_cfg)?;
        model.model_id = model_path.model_id.clone();
        Ok(model)
    }

    /// Hub id or directory name the weights came from
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn config(&self) -> &MistralConfig {
        &self.config
    }

    pub fn load_config(&self) -> &LoadConfig {
        &self.load_config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Adapter configuration, once injected
    pub fn lora_config(&self) -> Option<&LoraConfig> {
        self.lora_config.as_ref()
    }

    /// Look up one projection by layer index and name
    pub fn projection(&self, layer: usize, name: &str) -> Option<&AdaptedLinear> {
        let layer = self.layers.get(layer)?;
        let idx = crate::training::lora::KNOWN_PROJECTIONS
            .iter()
            .position(|p| *p == name)?;
        Some(layer.projections()[idx])
    }

    /// Wrap the configured projections with fresh adapters stored in `varmap`
    pub fn inject_lora(&mut self, config: &LoraConfig, varmap: &VarMap) -> Result<LoraStats> {
        config.validate()?;
        if self.lora_config.is_some() {
            anyhow::bail!("LoRA adapters are already injected into this model");
        }

        let vb = VarBuilder::from_varmap(varmap, DType::F32, &self.device);
        let mut trainable = 0;
        let mut wrapped = 0;

        for (i, layer) in self.layers.iter_mut().enumerate() {
            for name in &config.target_modules {
                let (parent, proj) = layer
                    .projection_mut(name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown LoRA target module '{}'", name))?;
                let prefix = format!("model.layers.{}.{}.{}", i, parent, name);
                let adapter = LoraAdapter::new(
                    proj.base.in_features(),
                    proj.base.out_features(),
                    config,
                    vb.pp(prefix),
                )?;
                trainable += adapter.num_params();
                wrapped += 1;
                proj.lora = Some(adapter);
            }
        }

        self.lora_config = Some(config.clone());
        let stats = LoraStats::new(self.num_params(), trainable, wrapped);
        tracing::info!("{}", stats);
        Ok(stats)
    }

    /// Parameter count including any adapters
    pub fn num_params(&self) -> usize {
        let cfg = &self.config;
        let embed = cfg.vocab_size * cfg.hidden_size;
        let head = if cfg.tie_word_embeddings { 0 } else { embed };
        let norms = cfg.hidden_size * (2 * self.layers.len() + 1);
        let projections: usize = self
            .layers
            .iter()
            .flat_map(|layer| layer.projections())
            .map(|p| p.base.num_params() + p.lora.as_ref().map_or(0, |l| l.num_params()))
            .sum();
        embed + head + norms + projections
    }

    /// Additive attention bias `[batch, 1, seq, offset + seq]`
    fn attention_bias(
        &self,
        batch: usize,
        seq_len: usize,
        offset: usize,
        attention_mask: Option<&Tensor>,
    ) -> Result<Option<Tensor>> {
        let window = self.config.sliding_window;
        // A single new token sees every cached key unless the window has slid
        if seq_len == 1 && attention_mask.is_none() && window.map_or(true, |w| offset < w) {
            return Ok(None);
        }

        let kv_len = offset + seq_len;
        let causal: Vec<f32> = (0..seq_len)
            .flat_map(|i| {
                let pos = offset + i;
                (0..kv_len).map(move |j| {
                    // Each query attends to itself and the previous w - 1 keys
                    let outside_window = window.is_some_and(|w| j + w <= pos);
                    if j > pos || outside_window {
                        f32::NEG_INFINITY
                    } else {
                        0.0
                    }
                })
            })
            .collect();
        let causal = Tensor::from_vec(causal, (1, 1, seq_len, kv_len), &self.device)?;

        let bias = match attention_mask {
            Some(mask) => {
                let padding = ((1.0 - mask.to_dtype(DType::F32)?)? * f64::from(f32::MIN))?
                    .reshape((batch, 1, 1, kv_len))?;
                causal.broadcast_add(&padding)?
            }
            None => causal.broadcast_as((batch, 1, seq_len, kv_len))?,
        };
        Ok(Some(bias))
    }

    /// Forward pass returning f32 logits `[batch, seq, vocab]`
    ///
    /// `attention_mask` is `[batch, offset + seq]` with 1 for real tokens.
    /// With a cache, only the new positions are passed in `input_ids`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        mut cache: Option<&mut Cache>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let offset = cache.as_ref().map_or(0, |c| c.seq_len());
        let bias = self.attention_bias(batch, seq_len, offset, attention_mask)?;

        let mut h = self.embed_tokens.forward(input_ids)?;
        for (i, layer) in self.layers.iter().enumerate() {
            let slot = cache.as_deref_mut().and_then(|c| c.layers.get_mut(i));
            h = layer.forward(&h, bias.as_ref(), slot, offset, train)?;
        }

        let h = self.norm.forward(&h)?;
        Ok(self.lm_head.forward(&h)?.to_dtype(DType::F32)?)
    }
}
