//! Fused linear-operator dispatch.
//!
//! - **`FusedLinearOp`**: a linear layer plus an elementwise tail, executed
//!   through specialized fused kernels, quantized fused kernels, or a plain
//!   composition, depending on the mode chosen at construction.
//! - **`ReferenceLinearOp`** / **`ReferenceConcatLinear`**: the composed
//!   ground truth.
//! - **`ConcatLinearMerger`**: sibling projections sharing an input, merged
//!   into one quantized GEMM when every member allows it.

pub mod concat;
pub mod fused_linear;
pub mod pattern;
pub mod reference;

pub use concat::{ConcatGroup, ConcatLinearMerger};
pub use fused_linear::FusedLinearOp;
pub use pattern::{ExecutionMode, FusionFlags, FusionPattern};
pub use reference::{compose_fallback, ReferenceConcatLinear, ReferenceLinearOp};

#[cfg(test)]
mod tests;
