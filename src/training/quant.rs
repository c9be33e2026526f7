//! 4-bit quantized linear layers
//!
//! Base model projections are stored as GGML block-quantized tensors
//! (`Q4_0` by default). The forward pass runs candle's quantized matmul
//! kernel directly on the packed weights. Gradients with respect to the
//! *input* are still needed so that adapters in earlier layers can learn;
//! the backward pass dequantizes the weight transiently instead of keeping a
//! full-precision copy alive in the autograd graph.

use anyhow::Result;
use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{
    CpuStorage, CudaStorage, CustomOp1, DType, Layout, MetalStorage, Module, Shape, Tensor,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Quantized weight format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuantType {
    /// 4-bit, one f16 scale per 32 weights
    #[default]
    Q4_0,
    /// 4-bit, scale and minimum per 32 weights
    Q4_1,
    /// 4-bit k-quant, super-blocks of 256 weights
    Q4K,
    /// 8-bit, one scale per 32 weights
    Q8_0,
}

impl QuantType {
    pub fn ggml_dtype(&self) -> GgmlDType {
        match self {
            Self::Q4_0 => GgmlDType::Q4_0,
            Self::Q4_1 => GgmlDType::Q4_1,
            Self::Q4K => GgmlDType::Q4K,
            Self::Q8_0 => GgmlDType::Q8_0,
        }
    }

    /// Number of weights sharing one block of scales
    pub fn block_size(&self) -> usize {
        self.ggml_dtype().block_size()
    }
}

impl std::str::FromStr for QuantType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "q4_0" | "q4" | "4bit" => Ok(Self::Q4_0),
            "q4_1" => Ok(Self::Q4_1),
            "q4k" | "q4_k" => Ok(Self::Q4K),
            "q8_0" | "q8" | "8bit" => Ok(Self::Q8_0),
            _ => Err(anyhow::anyhow!(
                "Invalid quantization type: {}. Valid options: q4_0, q4_1, q4k, q8_0",
                s
            )),
        }
    }
}

impl std::fmt::Display for QuantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Q4_0 => write!(f, "q4_0"),
            Self::Q4_1 => write!(f, "q4_1"),
            Self::Q4K => write!(f, "q4k"),
            Self::Q8_0 => write!(f, "q8_0"),
        }
    }
}

/// `x @ W^T` against a quantized `W`, differentiable with respect to `x`
struct QuantMatMul {
    weight: Arc<QTensor>,
}

impl CustomOp1 for QuantMatMul {
    fn name(&self) -> &'static str {
        "quant-matmul"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> candle_core::Result<(CpuStorage, Shape)> {
        self.weight.cpu_fwd(storage, layout)
    }

    fn cuda_fwd(&self, storage: &CudaStorage, layout: &Layout) -> candle_core::Result<(CudaStorage, Shape)> {
        self.weight.cuda_fwd(storage, layout)
    }

    fn metal_fwd(&self, storage: &MetalStorage, layout: &Layout) -> candle_core::Result<(MetalStorage, Shape)> {
        self.weight.metal_fwd(storage, layout)
    }

    fn bwd(&self, _arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> candle_core::Result<Option<Tensor>> {
        let w = self
            .weight
            .dequantize(grad_res.device())?
            .to_dtype(grad_res.dtype())?;
        Ok(Some(grad_res.broadcast_matmul(&w)?))
    }
}

/// Frozen linear layer with a block-quantized weight
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    weight: Arc<QTensor>,
    bias: Option<Tensor>,
    quant_type: QuantType,
    in_features: usize,
    out_features: usize,
}

impl QuantizedLinear {
    /// Quantize a `[out_features, in_features]` weight
    ///
    /// The quantized weight lives on the same device as `weight`.
    pub fn from_weight(weight: &Tensor, bias: Option<Tensor>, quant_type: QuantType) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        let block_size = quant_type.block_size();
        if in_features % block_size != 0 {
            anyhow::bail!(
                "Cannot quantize weight of shape ({}, {}) to {}: input dim must be a multiple of {}",
                out_features,
                in_features,
                quant_type,
                block_size
            );
        }

        let qtensor = QTensor::quantize(&weight.to_dtype(DType::F32)?, quant_type.ggml_dtype())?;

        Ok(Self {
            weight: Arc::new(qtensor),
            bias,
            quant_type,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn quant_type(&self) -> QuantType {
        self.quant_type
    }

    /// Shared handle to the packed weight
    pub fn qweight(&self) -> &Arc<QTensor> {
        &self.weight
    }

    /// Full-precision copy of the weight (f32), for inspection
    pub fn dequantized_weight(&self) -> Result<Tensor> {
        Ok(self.weight.dequantize(&self.weight.device())?)
    }

    /// Number of weights (and bias terms) this layer represents
    pub fn num_params(&self) -> usize {
        self.in_features * self.out_features + self.bias.as_ref().map_or(0, |b| b.elem_count())
    }

    /// Bytes held by the packed weight
    pub fn storage_bytes(&self) -> usize {
        self.weight.storage_size_in_bytes()
    }
}

impl Module for QuantizedLinear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let dtype = xs.dtype();
        let ys = xs.to_dtype(DType::F32)?.contiguous()?.apply_op1(QuantMatMul {
            weight: self.weight.clone(),
        })?;
        let ys = match &self.bias {
            Some(bias) => ys.broadcast_add(&bias.to_dtype(DType::F32)?)?,
            None => ys,
        };
        ys.to_dtype(dtype)
    }
}
