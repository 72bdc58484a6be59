//! Dequantize-on-the-fly GEMM over weight-only quantized weights.
//!
//! When every output row has a single scale and zero point, the zero point is
//! folded out of the inner loop:
//!
//! ```text
//! y[t, n] = scale[n] * (sum_i x[t, i] * q[n, i] - zp[n] * sum_i x[t, i])
//! ```
//!
//! Other layouts dequantize the row first. Each output channel decodes its
//! weight row exactly once and then serves every token.
//!
//! # Low-precision modes
//!
//! - `None`: f32 activations.
//! - `Fp16` / `Bf16`: activations and the GEMM result are rounded through the
//!   half type; the epilogue runs in f32 on the rounded result.
//! - `Int8`: activations are quantized per token (symmetric, 127 levels) and
//!   accumulated against the weight codes in integers.

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, ArrayView2, CowArray, Ix2};
use rayon::prelude::*;

use crate::activations::{apply_activation, GeluApproximation};
use crate::cpu::kernels::WoqKernels;
use crate::fusion::FusionPattern;
use crate::linear_layer::WoqContext;
use crate::quantize::WoqLowpMode;

/// Activations prepared once per call for the configured low-precision mode.
enum PreparedInput<'a> {
    Float {
        x: CowArray<'a, f32, Ix2>,
        row_sums: Array1<f32>,
    },
    Int8 {
        codes: Array2<i32>,
        scales: Array1<f32>,
        code_sums: Array1<i64>,
    },
}

impl<'a> PreparedInput<'a> {
    fn new(input: &ArrayView2<'a, f32>, mode: WoqLowpMode) -> Self {
        match mode {
            WoqLowpMode::Int8 => {
                let tokens = input.nrows();
                let mut codes = Array2::<i32>::zeros(input.dim());
                let mut scales = Array1::<f32>::zeros(tokens);
                let mut code_sums = Array1::<i64>::zeros(tokens);
                for (t, row) in input.outer_iter().enumerate() {
                    let absmax = row.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
                    let scale = if absmax > 0.0 { absmax / 127.0 } else { 1.0 };
                    let mut sum = 0i64;
                    for (q, &v) in codes.row_mut(t).iter_mut().zip(row.iter()) {
                        *q = ((v / scale).round() as i32).clamp(-127, 127);
                        sum += *q as i64;
                    }
                    scales[t] = scale;
                    code_sums[t] = sum;
                }
                PreparedInput::Int8 {
                    codes,
                    scales,
                    code_sums,
                }
            }
            WoqLowpMode::None => Self::float(CowArray::from(input.clone())),
            WoqLowpMode::Fp16 | WoqLowpMode::Bf16 => {
                let dtype = mode.compute_dtype();
                Self::float(CowArray::from(input.mapv(|v| dtype.round(v))))
            }
        }
    }

    fn float(x: CowArray<'a, f32, Ix2>) -> Self {
        let row_sums = x.outer_iter().map(|row| row.sum()).collect();
        PreparedInput::Float { x, row_sums }
    }

    fn tokens(&self) -> usize {
        match self {
            PreparedInput::Float { x, .. } => x.nrows(),
            PreparedInput::Int8 { codes, .. } => codes.nrows(),
        }
    }
}

/// Computes one output column (all tokens) for output channel `n`.
fn woq_column(prepared: &PreparedInput<'_>, ctx: &WoqContext, n: usize) -> Vec<f32> {
    let weight = &ctx.weight;
    let k = weight.in_features();
    let mut column = vec![0.0f32; prepared.tokens()];

    match weight.row_params(n) {
        Some((scale, zp)) => {
            let mut q = vec![0i32; k];
            weight.codes_row_into(n, &mut q);
            match prepared {
                PreparedInput::Float { x, row_sums } => {
                    for (t, out) in column.iter_mut().enumerate() {
                        let mut acc = 0.0f32;
                        for (&a, &b) in x.row(t).iter().zip(q.iter()) {
                            acc += a * b as f32;
                        }
                        *out = scale * (acc - zp * row_sums[t]);
                    }
                }
                PreparedInput::Int8 {
                    codes,
                    scales,
                    code_sums,
                } => {
                    for (t, out) in column.iter_mut().enumerate() {
                        let mut acc = 0i64;
                        for (&a, &b) in codes.row(t).iter().zip(q.iter()) {
                            acc += (a * b) as i64;
                        }
                        *out = scales[t] * scale * (acc as f32 - zp * code_sums[t] as f32);
                    }
                }
            }
        }
        None => {
            let mut w = vec![0.0f32; k];
            weight.dequantize_row_into(n, &mut w);
            match prepared {
                PreparedInput::Float { x, .. } => {
                    for (t, out) in column.iter_mut().enumerate() {
                        *out = x.row(t).iter().zip(w.iter()).map(|(a, b)| a * b).sum();
                    }
                }
                PreparedInput::Int8 { codes, scales, .. } => {
                    for (t, out) in column.iter_mut().enumerate() {
                        let acc: f32 = codes
                            .row(t)
                            .iter()
                            .zip(w.iter())
                            .map(|(&a, b)| a as f32 * b)
                            .sum();
                        *out = scales[t] * acc;
                    }
                }
            }
        }
    }
    column
}

/// `[tokens, in] x W^T + b`, then `epilogue(t, n, y)` on every element.
///
/// The bias and the low-precision rounding are applied before the epilogue,
/// so a plain call followed by elementwise ops matches a fused call exactly.
pub(crate) fn woq_gemm<F>(input: &ArrayView2<f32>, ctx: &WoqContext, epilogue: F) -> Array2<f32>
where
    F: Fn(usize, usize, f32) -> f32 + Sync,
{
    let n = ctx.out_features();
    let prepared = PreparedInput::new(input, ctx.lowp_mode);
    let compute = ctx.lowp_mode.compute_dtype();

    let columns: Vec<Vec<f32>> = (0..n)
        .into_par_iter()
        .map(|j| woq_column(&prepared, ctx, j))
        .collect();

    let mut output = Array2::<f32>::zeros((input.nrows(), n));
    for (j, column) in columns.into_iter().enumerate() {
        let b = ctx.bias.as_ref().map_or(0.0, |b| b[j]);
        for (t, acc) in column.into_iter().enumerate() {
            output[[t, j]] = epilogue(t, j, compute.round(acc + b));
        }
    }
    output
}

fn check_operand(name: &str, operand: &ArrayView2<f32>, expected: (usize, usize)) -> Result<()> {
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

fn check_input(input: &ArrayView2<f32>, ctx: &WoqContext) -> Result<()> {
    if input.ncols() != ctx.in_features() {
        return Err(anyhow!(
            "input has {} features, quantized weight expects {}",
            input.ncols(),
            ctx.in_features()
        ));
    }
    Ok(())
}

/// Portable CPU implementation of the quantized fused primitives.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuWoqKernels;

impl WoqKernels for CpuWoqKernels {
    fn name(&self) -> &'static str {
        "cpu-woq"
    }

    fn supports(&self, pattern: FusionPattern) -> bool {
        pattern.has_quantized_variant()
    }

    fn woq_linear(&self, input: &ArrayView2<f32>, context: &WoqContext) -> Result<Array2<f32>> {
        check_input(input, context)?;
        Ok(woq_gemm(input, context, |_, _, y| y))
    }

    fn woq_linear_add(
        &self,
        input: &ArrayView2<f32>,
        context: &WoqContext,
        others: &[ArrayView2<f32>],
    ) -> Result<Array2<f32>> {
        check_input(input, context)?;
        let [other] = others else {
            return Err(anyhow!("woq_linear_add takes 1 operand, got {}", others.len()));
        };
        check_operand("operand", other, (input.nrows(), context.out_features()))?;
        Ok(woq_gemm(input, context, |t, n, y| y + other[[t, n]]))
    }

    fn woq_linear_add_add(
        &self,
        input: &ArrayView2<f32>,
        context: &WoqContext,
        others: &[ArrayView2<f32>],
    ) -> Result<Array2<f32>> {
        check_input(input, context)?;
        let [first, second] = others else {
            return Err(anyhow!("woq_linear_add_add takes 2 operands, got {}", others.len()));
        };
        let expected = (input.nrows(), context.out_features());
        check_operand("first operand", first, expected)?;
        check_operand("second operand", second, expected)?;
        Ok(woq_gemm(input, context, |t, n, y| {
            y + first[[t, n]] + second[[t, n]]
        }))
    }

    fn woq_linear_gelu(
        &self,
        input: &ArrayView2<f32>,
        context: &WoqContext,
        approximation: GeluApproximation,
    ) -> Result<Array2<f32>> {
        check_input(input, context)?;
        let mut out = woq_gemm(input, context, |_, _, y| y);
        apply_activation(&mut out, approximation.activation());
        Ok(out)
    }
}
