//! Activation functions used by fused epilogues and the reference composition.

use std::str::FromStr;

use libm::{erff, expf, tanhf};
use ndarray::{parallel::prelude::*, ArrayBase, DataMut, Dimension};
use serde::{Deserialize, Serialize};

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

const SQRT_2_INV: f32 = 0.7071067811865475;
const SQRT_2_OVER_PI: f32 = 0.7978845608;
const GELU_COEFF: f32 = 0.044715;

/// Supported activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Exact, error-function based GELU.
    Gelu,
    /// Tanh approximation of GELU.
    #[serde(alias = "gelu_new", alias = "gelu_tanh")]
    GeluNew,
    Relu,
    #[serde(alias = "swish")]
    SilU,
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_tanh" | "new_gelu" => Ok(Activation::GeluNew),
            "relu" => Ok(Activation::Relu),
            "silu" | "swish" => Ok(Activation::SilU),
            _ => Err(format!("unknown activation function: {}", s)),
        }
    }
}

/// How a GELU kernel evaluates the Gaussian CDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeluApproximation {
    /// `0.5 * x * (1 + erf(x / sqrt(2)))`
    #[default]
    None,
    /// `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 x^3)))`
    Tanh,
}

impl GeluApproximation {
    pub fn activation(self) -> Activation {
        match self {
            GeluApproximation::None => Activation::Gelu,
            GeluApproximation::Tanh => Activation::GeluNew,
        }
    }
}

#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + erff(x * SQRT_2_INV))
}

#[inline(always)]
pub fn gelu_new_scalar(x: f32) -> f32 {
    let x_cubed = x * x * x;
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x_cubed);
    0.5 * x * (1.0 + tanhf(inner))
}

#[inline(always)]
pub fn relu_scalar(x: f32) -> f32 {
    x.max(0.0)
}

#[inline(always)]
pub fn silu_scalar(x: f32) -> f32 {
    if x <= -20.0 {
        0.0
    } else if x >= 20.0 {
        x
    } else {
        x / (1.0 + expf(-x))
    }
}

impl Activation {
    /// Evaluates the activation for a single value.
    #[inline(always)]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Gelu => gelu_scalar(x),
            Activation::GeluNew => gelu_new_scalar(x),
            Activation::Relu => relu_scalar(x),
            Activation::SilU => silu_scalar(x),
        }
    }
}

/// Applies an activation in-place to an array of any rank.
pub fn apply_activation<S, D>(arr: &mut ArrayBase<S, D>, activation: Activation)
where
    S: DataMut<Elem = f32>,
    D: Dimension,
{
    let use_parallel = arr.len() >= PARALLEL_THRESHOLD;
    if let Some(slice) = arr.as_slice_mut() {
        if use_parallel {
            slice.par_iter_mut().for_each(|x| *x = activation.apply(*x));
        } else {
            slice.iter_mut().for_each(|x| *x = activation.apply(*x));
        }
    } else if use_parallel {
        arr.par_mapv_inplace(|x| activation.apply(x));
    } else {
        arr.mapv_inplace(|x| activation.apply(x));
    }
}
