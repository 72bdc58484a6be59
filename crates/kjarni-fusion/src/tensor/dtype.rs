use half::{bf16, f16};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// Standard 32-bit float
    F32,
    /// 16-bit float (IEEE 754 half-precision)
    F16,
    /// 16-bit brain float (more range, less precision than F16)
    BF16,
    /// 8-bit signed, per-channel affine with integer zero points
    QInt8,
    /// 4-bit unsigned, two values per byte, per-channel affine with float zero points
    QUInt4x2,
}

impl DType {
    /// Rounds an f32 value through this dtype's precision.
    ///
    /// Used to emulate "cast to compute type" for activations, which are always
    /// carried as f32 arrays. Quantized dtypes compute in f32, so they are a no-op.
    #[inline(always)]
    pub fn round(&self, x: f32) -> f32 {
        match self {
            DType::F16 => f16::from_f32(x).to_f32(),
            DType::BF16 => bf16::from_f32(x).to_f32(),
            _ => x,
        }
    }
}
