//! A CPU linear layer over float and weight-only quantized weights.
//!
//! All weight tensors are stored in an `[OutFeatures, InFeatures]` layout, for
//! float and quantized data alike. `matmul` dispatches on the weight data and
//! always computes `y = x @ W^T + b`.
//!
//! A layer moves through the weight-only quantization lifecycle in two steps:
//! `prepare_woq` attaches a `WoqConfig`, and `WoqPacker::convert` replaces the
//! float weight with a `WoqContext`. Between the two, the layer claims WOQ but
//! holds no quantized context.

use std::sync::Arc;

use half::{bf16, f16};
use ndarray::{Array1, Array2, ArrayD, ArrayView2, ArrayViewD};

use crate::cpu::kernels::gemm::{gemm_epilogue, FloatWeights};
use crate::cpu::kernels::woq::woq_gemm;
use crate::error::{FusionError, FusionResult};
use crate::quantize::{QuantizedWeight, WoqConfig, WoqLowpMode};
use crate::tensor::{flatten_leading, restore_leading, DType};

/// The quantized execution context held by a converted layer.
#[derive(Debug, Clone)]
pub struct WoqContext {
    pub weight: QuantizedWeight,
    pub bias: Option<Array1<f32>>,
    pub lowp_mode: WoqLowpMode,
    /// 1 for ordinary layers, N for a layer merged from N siblings.
    pub num_concats: usize,
}

impl WoqContext {
    pub fn out_features(&self) -> usize {
        self.weight.out_features()
    }

    pub fn in_features(&self) -> usize {
        self.weight.in_features()
    }

    pub fn dtype(&self) -> DType {
        self.weight.dtype()
    }
}

/// An enum holding the actual weight data for a linear layer.
/// This allows for type-safe dispatch to different compute kernels.
#[derive(Debug, Clone)]
pub enum LinearData {
    F32(Array2<f32>),
    F16(Array2<f16>),
    BF16(Array2<bf16>),
    Woq(Arc<WoqContext>), // Arc for cheap cloning of converted layers
}

impl LinearData {
    pub fn dtype(&self) -> DType {
        match self {
            LinearData::F32(_) => DType::F32,
            LinearData::F16(_) => DType::F16,
            LinearData::BF16(_) => DType::BF16,
            LinearData::Woq(ctx) => ctx.dtype(),
        }
    }

    /// `[out_features, in_features]`
    pub fn shape(&self) -> [usize; 2] {
        match self {
            LinearData::F32(w) => [w.nrows(), w.ncols()],
            LinearData::F16(w) => [w.nrows(), w.ncols()],
            LinearData::BF16(w) => [w.nrows(), w.ncols()],
            LinearData::Woq(ctx) => ctx.weight.shape(),
        }
    }

    /// Borrows float weights for the GEMM kernels. `None` for quantized data.
    pub fn float_weights(&self) -> Option<FloatWeights<'_>> {
        match self {
            LinearData::F32(w) => Some(FloatWeights::F32(w.view())),
            LinearData::F16(w) => Some(FloatWeights::F16(w.view())),
            LinearData::BF16(w) => Some(FloatWeights::BF16(w.view())),
            LinearData::Woq(_) => None,
        }
    }
}

/// A CPU-based linear transformation layer (y = xW^T + b).
#[derive(Debug, Clone)]
pub struct LinearLayer {
    pub data: LinearData,
    /// Float-layer bias. Converted layers keep theirs in the `WoqContext`.
    pub bias: Option<Array1<f32>>,
    /// Set once the layer is prepared for weight-only quantization.
    pub woq_config: Option<WoqConfig>,
    pub num_concats: usize,
}

impl LinearLayer {
    /// Creates a layer, checking that the bias matches `out_features`.
    pub fn new(data: LinearData, bias: Option<Array1<f32>>) -> FusionResult<Self> {
        let [out_features, _] = data.shape();
        if let Some(b) = &bias {
            if b.len() != out_features {
                return Err(FusionError::shape("LinearLayer bias", out_features, b.len()));
            }
        }
        let (bias, num_concats) = match &data {
            LinearData::Woq(_) if bias.is_some() => {
                return Err(FusionError::InvalidConfig(
                    "a converted layer keeps its bias in the quantized context".to_string(),
                ));
            }
            LinearData::Woq(ctx) => (None, ctx.num_concats),
            _ => (bias, 1),
        };
        Ok(Self {
            data,
            bias,
            woq_config: None,
            num_concats,
        })
    }

    /// Creates a new F32 `LinearLayer` from a weight matrix and an optional bias.
    ///
    /// This is a convenience constructor for tests and for building layers in code.
    /// It assumes the weight matrix is in the `[OutFeatures, InFeatures]` layout.
    pub fn new_f32(weights: Array2<f32>, bias: impl Into<Option<Array1<f32>>>) -> Self {
        Self::float(LinearData::F32(weights), bias.into())
    }

    /// Creates a new F16 `LinearLayer` from a weight matrix and an optional bias.
    pub fn new_f16(weights: Array2<f16>, bias: impl Into<Option<Array1<f32>>>) -> Self {
        Self::float(LinearData::F16(weights), bias.into())
    }

    /// Creates a new BF16 `LinearLayer` from a weight matrix and an optional bias.
    pub fn new_bf16(weights: Array2<bf16>, bias: impl Into<Option<Array1<f32>>>) -> Self {
        Self::float(LinearData::BF16(weights), bias.into())
    }

    fn float(data: LinearData, bias: Option<Array1<f32>>) -> Self {
        debug_assert!(
            bias.as_ref().map_or(true, |b| b.len() == data.shape()[0]),
            "bias length must equal out_features"
        );
        Self {
            data,
            bias,
            woq_config: None,
            num_concats: 1,
        }
    }

    /// Computes `y = x @ W^T + b`, dispatching to the kernel for the weight data.
    ///
    /// `input` must already be `[tokens, in_features]`. Public callers go
    /// through [`LinearLayer::forward`], which checks the width.
    #[inline]
    pub(crate) fn matmul(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        debug_assert_eq!(input.ncols(), self.in_features());
        match &self.data {
            LinearData::F32(w) => self.add_bias(input.dot(&w.t())),
            LinearData::F16(w) => self.add_bias(gemm_epilogue(
                input,
                FloatWeights::F16(w.view()),
                |_, _, acc| acc,
            )),
            LinearData::BF16(w) => self.add_bias(gemm_epilogue(
                input,
                FloatWeights::BF16(w.view()),
                |_, _, acc| acc,
            )),
            LinearData::Woq(ctx) => woq_gemm(input, ctx, |_, _, acc| acc),
        }
    }

    fn add_bias(&self, mut result: Array2<f32>) -> Array2<f32> {
        if let Some(b) = &self.bias {
            result.outer_iter_mut().for_each(|mut row| row += b);
        }
        result
    }

    /// Applies the layer to an `[..., in_features]` tensor.
    pub fn forward(&self, input: &ArrayViewD<f32>) -> FusionResult<ArrayD<f32>> {
        let (flat, leading) = flatten_leading(input, self.in_features(), "LinearLayer::forward")?;
        let output = self.matmul(&flat.view());
        restore_leading(output, &leading)
    }

    /// Materializes the weight as F32, dequantizing converted layers.
    pub fn to_f32_weight(&self) -> Array2<f32> {
        match &self.data {
            LinearData::F32(w) => w.clone(),
            LinearData::F16(w) => w.mapv(|v| v.to_f32()),
            LinearData::BF16(w) => w.mapv(|v| v.to_f32()),
            LinearData::Woq(ctx) => ctx.weight.dequantize(),
        }
    }

    /// Marks the layer for weight-only quantization with `config`.
    pub fn prepare_woq(&mut self, config: WoqConfig) {
        log::debug!(
            "Preparing [{}, {}] {:?} layer for weight-only quantization ({})",
            self.out_features(),
            self.in_features(),
            self.dtype(),
            config
        );
        self.woq_config = Some(config);
    }

    /// Builder-style variant of [`LinearLayer::prepare_woq`].
    pub fn with_woq_config(mut self, config: WoqConfig) -> Self {
        self.prepare_woq(config);
        self
    }

    /// `true` once the layer is prepared for or converted to weight-only quantization.
    pub fn is_weight_only_quantized(&self) -> bool {
        self.woq_config.is_some() || matches!(self.data, LinearData::Woq(_))
    }

    /// The quantized execution context, present only after conversion.
    pub fn quant_context(&self) -> Option<&WoqContext> {
        match &self.data {
            LinearData::Woq(ctx) => Some(ctx.as_ref()),
            _ => None,
        }
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        match &self.data {
            LinearData::Woq(ctx) => ctx.bias.as_ref(),
            _ => self.bias.as_ref(),
        }
    }

    pub fn has_bias(&self) -> bool {
        self.bias().is_some()
    }

    pub fn num_concats(&self) -> usize {
        self.num_concats
    }

    pub fn shape(&self) -> [usize; 2] {
        self.data.shape()
    }

    pub fn out_features(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn in_features(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }
}

impl From<Array2<f32>> for LinearLayer {
    fn from(weights: Array2<f32>) -> Self {
        LinearLayer::new_f32(weights, None)
    }
}

impl From<Array2<f16>> for LinearLayer {
    fn from(weights: Array2<f16>) -> Self {
        LinearLayer::new_f16(weights, None)
    }
}

impl From<Array2<bf16>> for LinearLayer {
    fn from(weights: Array2<bf16>) -> Self {
        LinearLayer::new_bf16(weights, None)
    }
}
