//! Kjarni Fusion: fused linear-operator dispatch and weight-only quantization.
//!
//! This crate decides, per linear layer, whether to run a specialized fused
//! kernel, a quantized fused kernel, or a composition of the layer with plain
//! elementwise ops, and manages the int8 / 4-bit weight representations the
//! quantized path executes against.

pub mod activations;
pub mod cpu;
pub mod error;
pub mod fusion;
pub mod linear_layer;
pub mod quantize;
pub mod tensor;

pub use crate::{
    cpu::kernels::{CpuTppKernels, CpuWoqKernels, KernelSet, TppKernels, WoqKernels},
    error::{FusionError, FusionResult},
    fusion::{
        ConcatGroup, ConcatLinearMerger, ExecutionMode, FusedLinearOp, FusionFlags,
        FusionPattern, ReferenceConcatLinear, ReferenceLinearOp,
    },
    linear_layer::{LinearData, LinearLayer, WoqContext},
    quantize::{QuantizedWeight, WoqConfig, WoqLowpMode, WoqPacker, WoqWeightDType},
    tensor::DType,
};

#[cfg(test)]
pub mod tests;
