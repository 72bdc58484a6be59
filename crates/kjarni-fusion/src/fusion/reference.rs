//! Reference semantics: the linear layer composed with plain elementwise ops.
//!
//! `compose_fallback` is the ground truth for every pattern. `FusedLinearOp`
//! runs this same function in `FallbackCompose` mode.

use ndarray::{ArrayD, ArrayViewD};

use crate::activations::{apply_activation, Activation};
use crate::error::{FusionError, FusionResult};
use crate::fusion::concat::ConcatGroup;
use crate::fusion::pattern::FusionPattern;
use crate::linear_layer::LinearLayer;

/// Checks operand count and shapes; returns the expected output shape.
pub(crate) fn check_operands(
    layer: &LinearLayer,
    pattern: FusionPattern,
    input: &ArrayViewD<f32>,
    operands: &[ArrayViewD<f32>],
) -> FusionResult<Vec<usize>> {
    if operands.len() != pattern.num_operands() {
        return Err(FusionError::shape(
            format!("{} operands", pattern),
            pattern.num_operands(),
            operands.len(),
        ));
    }
    let shape = input.shape();
    if shape.last() != Some(&layer.in_features()) {
        return Err(FusionError::shape(
            format!("{} input", pattern),
            format!("[.., {}]", layer.in_features()),
            shape,
        ));
    }
    let mut out_shape = shape[..shape.len() - 1].to_vec();
    out_shape.push(layer.out_features());
    for (i, op) in operands.iter().enumerate() {
        if op.shape() != out_shape.as_slice() {
            return Err(FusionError::shape(
                format!("{} operand {}", pattern, i),
                &out_shape,
                op.shape(),
            ));
        }
    }
    Ok(out_shape)
}

/// `linear(input)` followed by the pattern's elementwise tail.
pub fn compose_fallback(
    layer: &LinearLayer,
    pattern: FusionPattern,
    input: &ArrayViewD<f32>,
    operands: &[ArrayViewD<f32>],
) -> FusionResult<ArrayD<f32>> {
    if pattern == FusionPattern::Concat {
        return Err(FusionError::UnsupportedPattern(
            "concat has no single-output composition".to_string(),
        ));
    }
    check_operands(layer, pattern, input, operands)?;

    let mut y = layer.forward(input)?;
    match pattern {
        FusionPattern::Silu => apply_activation(&mut y, Activation::SilU),
        FusionPattern::Relu => apply_activation(&mut y, Activation::Relu),
        FusionPattern::Gelu => apply_activation(&mut y, Activation::Gelu),
        FusionPattern::NewGelu => apply_activation(&mut y, Activation::GeluNew),
        FusionPattern::Mul => y *= &operands[0],
        FusionPattern::Add => y += &operands[0],
        FusionPattern::AddAdd => {
            y += &operands[0];
            y += &operands[1];
        }
        FusionPattern::Concat => {}
    }
    Ok(y)
}

/// Always-composed counterpart of `FusedLinearOp`.
#[derive(Debug, Clone)]
pub struct ReferenceLinearOp {
    linear: LinearLayer,
    pattern: FusionPattern,
}

impl ReferenceLinearOp {
    pub fn new(linear: LinearLayer, pattern: FusionPattern) -> FusionResult<Self> {
        if pattern == FusionPattern::Concat {
            return Err(FusionError::UnsupportedPattern(
                "use ReferenceConcatLinear for concat".to_string(),
            ));
        }
        Ok(Self { linear, pattern })
    }

    pub fn forward(
        &self,
        input: &ArrayViewD<f32>,
        operands: &[ArrayViewD<f32>],
    ) -> FusionResult<ArrayD<f32>> {
        compose_fallback(&self.linear, self.pattern, input, operands)
    }

    pub fn pattern(&self) -> FusionPattern {
        self.pattern
    }

    pub fn linear(&self) -> &LinearLayer {
        &self.linear
    }
}

/// Runs every member of a concat group independently.
#[derive(Debug, Clone)]
pub struct ReferenceConcatLinear {
    layers: Vec<LinearLayer>,
}

impl ReferenceConcatLinear {
    pub fn new(group: ConcatGroup) -> Self {
        Self {
            layers: group.into_layers(),
        }
    }

    pub fn forward(&self, input: &ArrayViewD<f32>) -> FusionResult<Vec<ArrayD<f32>>> {
        self.layers.iter().map(|l| l.forward(input)).collect()
    }

    pub fn num_concats(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[LinearLayer] {
        &self.layers
    }
}
