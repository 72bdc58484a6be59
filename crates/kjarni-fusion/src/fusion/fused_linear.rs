//! A linear layer fused with its elementwise tail.
//!
//! # Example
//!
//! ```ignore
//! use kjarni_fusion::{FusedLinearOp, FusionFlags, FusionPattern};
//!
//! let op = FusedLinearOp::new(layer, FusionPattern::AddAdd, FusionFlags::tpp())?;
//! let y = op.forward(&x.view(), &[residual.view(), skip.view()])?;
//! ```

use ndarray::{Array1, Array2, ArrayD, ArrayView2, ArrayViewD, CowArray, Ix2};

use crate::activations::GeluApproximation;
use crate::cpu::kernels::KernelSet;
use crate::error::{FusionError, FusionResult};
use crate::fusion::pattern::{ExecutionMode, FusionFlags, FusionPattern};
use crate::fusion::reference::{check_operands, compose_fallback};
use crate::linear_layer::LinearLayer;
use crate::tensor::{flatten_leading, restore_leading};

/// Scale passed to the fused add primitives.
const ADD_SCALE: f32 = 1.0;

/// Executes `pattern` on top of `linear` in a mode fixed at construction.
#[derive(Debug, Clone)]
pub struct FusedLinearOp {
    linear: LinearLayer,
    pattern: FusionPattern,
    flags: FusionFlags,
    mode: ExecutionMode,
    kernels: KernelSet,
}

impl FusedLinearOp {
    pub fn new(linear: LinearLayer, pattern: FusionPattern, flags: FusionFlags) -> FusionResult<Self> {
        Self::with_kernels(linear, pattern, flags, KernelSet::default())
    }

    pub fn with_kernels(
        linear: LinearLayer,
        pattern: FusionPattern,
        flags: FusionFlags,
        kernels: KernelSet,
    ) -> FusionResult<Self> {
        if pattern == FusionPattern::Concat {
            return Err(FusionError::UnsupportedPattern(
                "concat is executed by ConcatLinearMerger".to_string(),
            ));
        }

        let mode = ExecutionMode::select(pattern, flags, &linear, &kernels);
        if flags.woq && linear.is_weight_only_quantized() && linear.quant_context().is_none() {
            log::warn!(
                "Linear {} is prepared for weight-only quantization but not converted; composing",
                pattern
            );
        }
        log::debug!(
            "Linear {} [{}, {}] {:?}: {} ({:?})",
            pattern,
            linear.out_features(),
            linear.in_features(),
            linear.dtype(),
            mode,
            kernels
        );

        Ok(Self {
            linear,
            pattern,
            flags,
            mode,
            kernels,
        })
    }

    /// Runs the operator. `operands` holds the tensors after the linear input,
    /// each shaped like the linear output.
    pub fn forward(
        &self,
        input: &ArrayViewD<f32>,
        operands: &[ArrayViewD<f32>],
    ) -> FusionResult<ArrayD<f32>> {
        match self.mode {
            ExecutionMode::SpecializedFused => {
                check_operands(&self.linear, self.pattern, input, operands)?;
                self.forward_specialized(input, operands)
            }
            ExecutionMode::QuantizedFused => {
                check_operands(&self.linear, self.pattern, input, operands)?;
                self.forward_quantized(input, operands)
            }
            ExecutionMode::FallbackCompose => {
                compose_fallback(&self.linear, self.pattern, input, operands)
            }
        }
    }

    fn forward_specialized(
        &self,
        input: &ArrayViewD<f32>,
        operands: &[ArrayViewD<f32>],
    ) -> FusionResult<ArrayD<f32>> {
        let dtype = self.linear.dtype();
        let out_features = self.linear.out_features();

        // Cast to the compute type; `mapv` also yields a contiguous buffer.
        let (x, leading) = flatten_leading(input, self.linear.in_features(), "fused linear input")?;
        let x = x.mapv(|v| dtype.round(v));
        let extras = operands
            .iter()
            .map(|op| {
                let (flat, _) = flatten_leading(op, out_features, "fused linear operand")?;
                Ok(flat.mapv(|v| dtype.round(v)))
            })
            .collect::<FusionResult<Vec<Array2<f32>>>>()?;

        let empty = Array1::<f32>::zeros(0);
        let bias = match self.linear.bias() {
            Some(b) => b.view(),
            None => empty.view(),
        };
        let weight = &self.linear.data;
        let tpp = &self.kernels.tpp;
        let x = x.view();

        let out = match self.pattern {
            FusionPattern::Silu => tpp.linear_silu(&x, weight, &bias, out_features)?,
            FusionPattern::Relu => tpp.linear_relu(&x, weight, &bias, out_features)?,
            FusionPattern::Gelu | FusionPattern::NewGelu => {
                let approximation = self.gelu_approximation()?;
                tpp.linear_gelu(&x, weight, &bias, out_features, approximation)?
            }
            FusionPattern::Mul => {
                tpp.linear_mul(&x, &extras[0].view(), weight, &bias, out_features)?
            }
            FusionPattern::Add => tpp.linear_add(
                &x,
                &extras[0].view(),
                weight,
                &bias,
                ADD_SCALE,
                out_features,
            )?,
            FusionPattern::AddAdd => tpp.linear_add_add(
                &x,
                &extras[0].view(),
                &extras[1].view(),
                weight,
                &bias,
                ADD_SCALE,
                out_features,
            )?,
            FusionPattern::Concat => return Err(self.unsupported()),
        };
        restore_leading(out, &leading)
    }

    fn forward_quantized(
        &self,
        input: &ArrayViewD<f32>,
        operands: &[ArrayViewD<f32>],
    ) -> FusionResult<ArrayD<f32>> {
        let context = self
            .linear
            .quant_context()
            .ok_or(FusionError::MissingQuantizationContext { layer: 0 })?;
        let out_features = self.linear.out_features();

        let (x, leading) = flatten_leading(input, self.linear.in_features(), "fused linear input")?;
        let others = operands
            .iter()
            .map(|op| Ok(flatten_leading(op, out_features, "fused linear operand")?.0))
            .collect::<FusionResult<Vec<CowArray<'_, f32, Ix2>>>>()?;
        let others: Vec<ArrayView2<f32>> = others.iter().map(|o| o.view()).collect();
        let woq = &self.kernels.woq;
        let x = x.view();

        let out = match self.pattern {
            FusionPattern::Add => woq.woq_linear_add(&x, context, &others)?,
            FusionPattern::AddAdd => woq.woq_linear_add_add(&x, context, &others)?,
            FusionPattern::Gelu | FusionPattern::NewGelu => {
                woq.woq_linear_gelu(&x, context, self.gelu_approximation()?)?
            }
            _ => return Err(self.unsupported()),
        };
        restore_leading(out, &leading)
    }

    fn gelu_approximation(&self) -> FusionResult<GeluApproximation> {
        self.pattern
            .gelu_approximation()
            .ok_or_else(|| self.unsupported())
    }

    fn unsupported(&self) -> FusionError {
        FusionError::UnsupportedPattern(format!("{} in mode {}", self.pattern, self.mode))
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn pattern(&self) -> FusionPattern {
        self.pattern
    }

    pub fn flags(&self) -> FusionFlags {
        self.flags
    }

    pub fn linear(&self) -> &LinearLayer {
        &self.linear
    }
}
