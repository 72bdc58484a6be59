//! Fused linear + epilogue kernels over float weights.
//!
//! Every primitive computes `input @ weight.T + bias` and applies its epilogue
//! to each accumulator before the store:
//!
//! ```text
//! linear_silu     output = SiLU(x @ W.T + b)
//! linear_relu     output = ReLU(x @ W.T + b)
//! linear_gelu     output = GELU(x @ W.T + b)     (erf or tanh form)
//! linear_mul      output = (x @ W.T + b) * other
//! linear_add      output = (x @ W.T + b) + scale * other
//! linear_add_add  output = (x @ W.T + b) + scale * first + scale * second
//! ```
//!
//! Results are rounded through the weight dtype, so F16/BF16 layers return
//! values representable in their compute type.

use anyhow::{anyhow, Result};
use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::activations::{gelu_new_scalar, gelu_scalar, relu_scalar, silu_scalar, GeluApproximation};
use crate::cpu::kernels::gemm::{gemm_epilogue, FloatWeights};
use crate::cpu::kernels::TppKernels;
use crate::fusion::FusionPattern;
use crate::linear_layer::LinearData;
use crate::tensor::DType;

/// Portable CPU implementation of the specialized fused primitives.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTppKernels;

/// Validated arguments shared by every primitive.
struct Gemm<'a> {
    input: ArrayView2<'a, f32>,
    weights: FloatWeights<'a>,
    bias: Option<ArrayView1<'a, f32>>,
    dtype: DType,
}

impl<'a> Gemm<'a> {
    fn new(
        input: &'a ArrayView2<'_, f32>,
        weight: &'a LinearData,
        bias: &'a ArrayView1<'_, f32>,
        out_features: usize,
    ) -> Result<Self> {
        let weights = weight
            .float_weights()
            .ok_or_else(|| anyhow!("tpp kernels need float weights, got {:?}", weight.dtype()))?;

        if weights.out_features() != out_features {
            return Err(anyhow!(
                "out_features {} != weight rows {}",
                out_features,
                weights.out_features()
            ));
        }
        if input.ncols() != weights.in_features() {
            return Err(anyhow!(
                "input has {} features, weight expects {}",
                input.ncols(),
                weights.in_features()
            ));
        }
        // An empty bias means "no bias".
        let bias = match bias.len() {
            0 => None,
            n if n == out_features => Some(bias.view()),
            n => {
                return Err(anyhow!("bias length {} != out_features {}", n, out_features));
            }
        };

        Ok(Self {
            input: input.view(),
            weights,
            bias,
            dtype: weight.dtype(),
        })
    }

    fn expect_operand(&self, name: &str, operand: &ArrayView2<f32>) -> Result<()> {
        let expected = (self.input.nrows(), self.weights.out_features());
        if operand.dim() != expected {
            return Err(anyhow!(
                "{} shape {:?} does not match linear output {:?}",
                name,
                operand.dim(),
                expected
            ));
        }
        Ok(())
    }

    fn run<F>(&self, epilogue: F) -> Array2<f32>
    where
        F: Fn(usize, usize, f32) -> f32 + Sync,
    {
        let bias = self.bias.as_ref();
        let dtype = self.dtype;
        gemm_epilogue(&self.input, self.weights, |t, j, acc| {
            let y = match bias {
                Some(b) => acc + b[j],
                None => acc,
            };
            dtype.round(epilogue(t, j, y))
        })
    }
}

impl TppKernels for CpuTppKernels {
    fn name(&self) -> &'static str {
        "cpu-tpp"
    }

    fn supports(&self, pattern: FusionPattern, dtype: DType) -> bool {
        pattern != FusionPattern::Concat && matches!(dtype, DType::F32 | DType::F16 | DType::BF16)
    }

    fn linear_silu(
        &self,
        input: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        out_features: usize,
    ) -> Result<Array2<f32>> {
        let gemm = Gemm::new(input, weight, bias, out_features)?;
        Ok(gemm.run(|_, _, y| silu_scalar(y)))
    }

    fn linear_relu(
        &self,
        input: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        out_features: usize,
    ) -> Result<Array2<f32>> {
        let gemm = Gemm::new(input, weight, bias, out_features)?;
        Ok(gemm.run(|_, _, y| relu_scalar(y)))
    }

    fn linear_gelu(
        &self,
        input: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        out_features: usize,
        approximation: GeluApproximation,
    ) -> Result<Array2<f32>> {
        let gemm = Gemm::new(input, weight, bias, out_features)?;
        Ok(match approximation {
            GeluApproximation::None => gemm.run(|_, _, y| gelu_scalar(y)),
            GeluApproximation::Tanh => gemm.run(|_, _, y| gelu_new_scalar(y)),
        })
    }

    fn linear_mul(
        &self,
        input: &ArrayView2<f32>,
        other: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        out_features: usize,
    ) -> Result<Array2<f32>> {
        let gemm = Gemm::new(input, weight, bias, out_features)?;
        gemm.expect_operand("other", other)?;
        Ok(gemm.run(|t, j, y| y * other[[t, j]]))
    }

    fn linear_add(
        &self,
        input: &ArrayView2<f32>,
        other: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        scale: f32,
        out_features: usize,
    ) -> Result<Array2<f32>> {
        let gemm = Gemm::new(input, weight, bias, out_features)?;
        gemm.expect_operand("other", other)?;
        Ok(gemm.run(|t, j, y| y + scale * other[[t, j]]))
    }

    fn linear_add_add(
        &self,
        input: &ArrayView2<f32>,
        first: &ArrayView2<f32>,
        second: &ArrayView2<f32>,
        weight: &LinearData,
        bias: &ArrayView1<f32>,
        scale: f32,
        out_features: usize,
    ) -> Result<Array2<f32>> {
        let gemm = Gemm::new(input, weight, bias, out_features)?;
        gemm.expect_operand("first", first)?;
        gemm.expect_operand("second", second)?;
        Ok(gemm.run(|t, j, y| y + scale * first[[t, j]] + scale * second[[t, j]]))
    }
}
