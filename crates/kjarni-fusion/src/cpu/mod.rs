//! CPU implementations of the fused linear kernels.

pub mod kernels;

pub use kernels::{CpuTppKernels, CpuWoqKernels, KernelSet, TppKernels, WoqKernels};
