//! Fusion patterns, capability flags, and execution-mode selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::activations::GeluApproximation;
use crate::cpu::kernels::KernelSet;
use crate::linear_layer::LinearLayer;

/// The elementwise tail fused onto a linear layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionPattern {
    Silu,
    Relu,
    /// Exact, erf-based GELU.
    Gelu,
    /// Tanh-approximated GELU.
    NewGelu,
    Mul,
    Add,
    AddAdd,
    /// Sibling projections sharing one input; see `ConcatLinearMerger`.
    Concat,
}

impl FusionPattern {
    pub const ALL: [FusionPattern; 8] = [
        FusionPattern::Silu,
        FusionPattern::Relu,
        FusionPattern::Gelu,
        FusionPattern::NewGelu,
        FusionPattern::Mul,
        FusionPattern::Add,
        FusionPattern::AddAdd,
        FusionPattern::Concat,
    ];

    /// Number of tensor arguments, including the linear input.
    pub fn arity(self) -> usize {
        match self {
            FusionPattern::Silu
            | FusionPattern::Relu
            | FusionPattern::Gelu
            | FusionPattern::NewGelu
            | FusionPattern::Concat => 1,
            FusionPattern::Mul | FusionPattern::Add => 2,
            FusionPattern::AddAdd => 3,
        }
    }

    /// Number of operands besides the linear input.
    pub fn num_operands(self) -> usize {
        self.arity() - 1
    }

    /// Patterns with a quantized fused primitive.
    pub fn has_quantized_variant(self) -> bool {
        matches!(
            self,
            FusionPattern::Add | FusionPattern::AddAdd | FusionPattern::Gelu | FusionPattern::NewGelu
        )
    }

    /// The GELU form for the two GELU patterns.
    pub fn gelu_approximation(self) -> Option<GeluApproximation> {
        match self {
            FusionPattern::Gelu => Some(GeluApproximation::None),
            FusionPattern::NewGelu => Some(GeluApproximation::Tanh),
            _ => None,
        }
    }
}

impl fmt::Display for FusionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FusionPattern::Silu => "silu",
            FusionPattern::Relu => "relu",
            FusionPattern::Gelu => "gelu",
            FusionPattern::NewGelu => "new_gelu",
            FusionPattern::Mul => "mul",
            FusionPattern::Add => "add",
            FusionPattern::AddAdd => "add_add",
            FusionPattern::Concat => "concat",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for FusionPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "silu" | "swish" => Ok(FusionPattern::Silu),
            "relu" => Ok(FusionPattern::Relu),
            "gelu" => Ok(FusionPattern::Gelu),
            "new_gelu" | "newgelu" | "gelu_new" | "gelu_tanh" => Ok(FusionPattern::NewGelu),
            "mul" => Ok(FusionPattern::Mul),
            "add" => Ok(FusionPattern::Add),
            "add_add" | "addadd" => Ok(FusionPattern::AddAdd),
            "concat" => Ok(FusionPattern::Concat),
            _ => Err(format!("unknown fusion pattern: {}", s)),
        }
    }
}

/// The declared capability pair: specialized fused kernels, weight-only quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionFlags {
    pub tpp: bool,
    pub woq: bool,
}

impl FusionFlags {
    pub fn new(tpp: bool, woq: bool) -> Self {
        Self { tpp, woq }
    }

    pub fn tpp() -> Self {
        Self::new(true, false)
    }

    pub fn woq() -> Self {
        Self::new(false, true)
    }
}

/// How a fused operator executes. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    SpecializedFused,
    QuantizedFused,
    FallbackCompose,
}

impl ExecutionMode {
    /// Picks the first applicable mode, in priority order:
    ///
    /// 1. specialized fused kernels, if `tpp` is set and they support the pattern on this dtype;
    /// 2. quantized fused kernels, if `woq` is set, the layer holds a quantized
    ///    context and a quantized primitive exists for the pattern;
    /// 3. composition of the linear layer with elementwise ops.
    pub fn select(
        pattern: FusionPattern,
        flags: FusionFlags,
        layer: &LinearLayer,
        kernels: &KernelSet,
    ) -> Self {
        if flags.tpp && kernels.tpp.supports(pattern, layer.dtype()) {
            ExecutionMode::SpecializedFused
        } else if flags.woq && layer.quant_context().is_some() && kernels.woq.supports(pattern) {
            ExecutionMode::QuantizedFused
        } else {
            ExecutionMode::FallbackCompose
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::SpecializedFused => write!(f, "specialized-fused"),
            ExecutionMode::QuantizedFused => write!(f, "quantized-fused"),
            ExecutionMode::FallbackCompose => write!(f, "fallback-compose"),
        }
    }
}
