//! Fused linear kernels behind a fixed argument contract.
//!
//! The dispatch layer only knows the two kernel traits:
//!
//! - **`TppKernels`**: fused GEMM + epilogue over float weights. Each
//!   primitive takes `(input, [extra...], weight, bias_or_empty, [scale,] out_features)`.
//! - **`WoqKernels`**: fused GEMM + epilogue over a weight-only quantized
//!   context. Each primitive takes `(input, context, [others])`.
//!
//! Inputs arrive flattened to `[tokens, features]`. An empty bias means
//! "no bias". Kernel failures are opaque `anyhow` errors.
//!
//! # Example
//!
//! ```ignore
//! use kjarni_fusion::cpu::kernels::{CpuTppKernels, TppKernels};
//!
//! let out = CpuTppKernels.linear_add(
//!     &x.view(), &residual.view(), &layer.data, &bias.view(), 1.0, layer.out_features(),
//! )?;
//! ```

pub mod gemm;
pub mod tpp;
pub mod woq;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::activations::GeluApproximation;
use crate::fusion::FusionPattern;
use crate::linear_layer::{LinearData, WoqContext};
use crate::tensor::DType;

pub use tpp::CpuTppKernels;
pub use woq::CpuWoqKernels;

/// Specialized fused primitives over float weights.
pub trait TppKernels: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a fused primitive exists for `pattern` on weights of `dtype`.
    fn supports(&self, pattern: FusionPattern, dtype: DType) -> bool;

    fn linear_silu(
        &self,
        input: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        out_features: usize,
    ) -> Result<Array2<f32>>;

    fn linear_relu(
        &self,
        input: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        out_features: usize,
    ) -> Result<Array2<f32>>;

    fn linear_gelu(
        &self,
        input: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        out_features: usize,
        approximation: GeluApproximation,
    ) -> Result<Array2<f32>>;

    /// `linear(input) * other`
    fn linear_mul(
        &self,
        input: &ArrayView2<f32>,
        other: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        out_features: usize,
    ) -> Result<Array2<f32>>;

    /// `linear(input) + scale * other`
    fn linear_add(
        &self,
        input: &ArrayView2<f32>,
        other: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        scale: f32,
        out_features: usize,
    ) -> Result<Array2<f32>>;

    /// `linear(input) + scale * first + scale * second`
    #[allow(clippy::too_many_arguments)]
    fn linear_add_add(
        &self,
        input: &ArrayView2<f32>,
        first: &ArrayView2<f32>,
        second: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        scale: f32,
        out_features: usize,
    ) -> Result<Array2<f32>>;
}

/// Quantized fused primitives over a weight-only quantized context.
pub trait WoqKernels: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, pattern: FusionPattern) -> bool;

    fn woq_linear(&self, input: &ArrayView2<f32>, context: &WoqContext) -> Result<Array2<f32>>;

    /// `linear(input) + others[0]`
    fn woq_linear_add(
        &self,
        input: &ArrayView2<f32>,
        context: &WoqContext,
        others: &[ArrayView2<f32>],
    ) -> Result<Array2<f32>>;

    /// `linear(input) + others[0] + others[1]`
    fn woq_linear_add_add(
        &self,
        input: &ArrayView2<f32>,
        context: &WoqContext,
        others: &[ArrayView2<f32>],
    ) -> Result<Array2<f32>>;

    fn woq_linear_gelu(
        &self,
        input: &ArrayView2<f32>,
        context: &WoqContext,
        approximation: GeluApproximation,
    ) -> Result<Array2<f32>>;
}

/// The kernel implementations a fused operator dispatches to.
#[derive(Clone)]
pub struct KernelSet {
    pub tpp: Arc<dyn TppKernels>,
    pub woq: Arc<dyn WoqKernels>,
}

impl KernelSet {
    pub fn new(tpp: Arc<dyn TppKernels>, woq: Arc<dyn WoqKernels>) -> Self {
        Self { tpp, woq }
    }

    /// The portable CPU implementations.
    pub fn cpu() -> Self {
        Self::new(Arc::new(CpuTppKernels), Arc::new(CpuWoqKernels))
    }
}

impl Default for KernelSet {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Debug for KernelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelSet")
            .field("tpp", &self.tpp.name())
            .field("woq", &self.woq.name())
            .finish()
    }
}
