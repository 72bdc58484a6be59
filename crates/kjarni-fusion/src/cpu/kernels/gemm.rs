//! Row-parallel float GEMM with a fused per-element epilogue.
//!
//! ```text
//! output[t, j] = epilogue(t, j, dot(input[t, :], weight[j, :]))
//! ```
//!
//! Weights stay in `[OutFeatures, InFeatures]` layout and are upcast to f32
//! one element at a time, so F16 and BF16 weights never materialize an F32 copy.

use half::{bf16, f16};
use ndarray::{parallel::prelude::*, Array2, ArrayView1, ArrayView2, Axis};

/// Borrowed float weights in `[OutFeatures, InFeatures]` layout.
#[derive(Debug, Clone, Copy)]
pub enum FloatWeights<'a> {
    F32(ArrayView2<'a, f32>),
    F16(ArrayView2<'a, f16>),
    BF16(ArrayView2<'a, bf16>),
}

impl FloatWeights<'_> {
    pub fn out_features(&self) -> usize {
        match self {
            FloatWeights::F32(w) => w.nrows(),
            FloatWeights::F16(w) => w.nrows(),
            FloatWeights::BF16(w) => w.nrows(),
        }
    }

    pub fn in_features(&self) -> usize {
        match self {
            FloatWeights::F32(w) => w.ncols(),
            FloatWeights::F16(w) => w.ncols(),
            FloatWeights::BF16(w) => w.ncols(),
        }
    }

    #[inline]
    fn dot_row(&self, row: usize, x: &ArrayView1<f32>) -> f32 {
        match self {
            FloatWeights::F32(w) => w.row(row).dot(x),
            FloatWeights::F16(w) => dot_mixed(x, w.row(row), |v| v.to_f32()),
            FloatWeights::BF16(w) => dot_mixed(x, w.row(row), |v| v.to_f32()),
        }
    }
}

#[inline]
fn dot_mixed<T: Copy>(x: &ArrayView1<f32>, w: ArrayView1<T>, upcast: impl Fn(T) -> f32) -> f32 {
    let mut sum = 0.0f32;
    for (&a, &b) in x.iter().zip(w.iter()) {
        sum += a * upcast(b);
    }
    sum
}

/// `[tokens, in] x [out, in]^T -> [tokens, out]`, applying `epilogue` before each store.
///
/// Tokens are processed in parallel; every output row is owned by one task.
pub(crate) fn gemm_epilogue<F>(input: &ArrayView2<f32>, weights: FloatWeights<'_>, epilogue: F) -> Array2<f32>
where
    F: Fn(usize, usize, f32) -> f32 + Sync,
{
    let tokens = input.nrows();
    let n = weights.out_features();
    let mut output = Array2::<f32>::zeros((tokens, n));

    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(input.axis_iter(Axis(0)).into_par_iter())
        .enumerate()
        .for_each(|(t, (mut out_row, x))| {
            for (j, out) in out_row.iter_mut().enumerate() {
                *out = epilogue(t, j, weights.dot_row(j, &x));
            }
        });

    output
}
