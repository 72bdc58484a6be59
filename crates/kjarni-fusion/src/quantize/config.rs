//! Weight-only quantization configuration.
//!
//! A `WoqConfig` is passed explicitly to the packer; there is no global
//! qconfig registry keyed by dtype and low-precision mode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};
use crate::tensor::DType;

/// Storage format for quantized weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WoqWeightDType {
    /// int8, per-channel affine, integer zero points.
    #[default]
    #[serde(alias = "qint8")]
    Int8,
    /// 4-bit, per-channel affine, float zero points, two values per byte.
    #[serde(alias = "int4", alias = "quint4x2")]
    UInt4x2,
}

impl WoqWeightDType {
    pub fn dtype(self) -> DType {
        match self {
            WoqWeightDType::Int8 => DType::QInt8,
            WoqWeightDType::UInt4x2 => DType::QUInt4x2,
        }
    }

    pub fn from_dtype(dtype: DType) -> FusionResult<Self> {
        match dtype {
            DType::QInt8 => Ok(WoqWeightDType::Int8),
            DType::QUInt4x2 => Ok(WoqWeightDType::UInt4x2),
            other => Err(FusionError::UnsupportedDType {
                dtype: other,
                operation: "weight-only quantization".to_string(),
            }),
        }
    }
}

impl FromStr for WoqWeightDType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "int8" | "qint8" => Ok(WoqWeightDType::Int8),
            "int4" | "uint4x2" | "quint4x2" => Ok(WoqWeightDType::UInt4x2),
            _ => Err(format!("unknown weight dtype: {}", s)),
        }
    }
}

/// Lowest precision used for the activation side of a WOQ GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WoqLowpMode {
    /// Compute in f32.
    #[default]
    None,
    Fp16,
    Bf16,
    /// Dynamically quantize activations to int8. Only defined for 4-bit weights.
    Int8,
}

impl WoqLowpMode {
    /// The float type GEMM results are rounded through.
    ///
    /// Int8 activations accumulate in integers and rescale into f32.
    pub fn compute_dtype(self) -> DType {
        match self {
            WoqLowpMode::None | WoqLowpMode::Int8 => DType::F32,
            WoqLowpMode::Fp16 => DType::F16,
            WoqLowpMode::Bf16 => DType::BF16,
        }
    }
}

impl FromStr for WoqLowpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "0" => Ok(WoqLowpMode::None),
            "fp16" | "1" => Ok(WoqLowpMode::Fp16),
            "bf16" | "2" => Ok(WoqLowpMode::Bf16),
            "int8" | "3" => Ok(WoqLowpMode::Int8),
            _ => Err(format!("unknown lowp mode: {}", s)),
        }
    }
}

impl fmt::Display for WoqLowpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WoqLowpMode::None => write!(f, "none"),
            WoqLowpMode::Fp16 => write!(f, "fp16"),
            WoqLowpMode::Bf16 => write!(f, "bf16"),
            WoqLowpMode::Int8 => write!(f, "int8"),
        }
    }
}

/// Configuration for weight-only quantization of a linear layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WoqConfig {
    pub weight_dtype: WoqWeightDType,
    pub lowp_mode: WoqLowpMode,
}

impl WoqConfig {
    pub fn new(weight_dtype: WoqWeightDType, lowp_mode: WoqLowpMode) -> Self {
        Self {
            weight_dtype,
            lowp_mode,
        }
    }

    pub fn int8() -> Self {
        Self::new(WoqWeightDType::Int8, WoqLowpMode::None)
    }

    pub fn int4() -> Self {
        Self::new(WoqWeightDType::UInt4x2, WoqLowpMode::None)
    }

    pub fn with_lowp_mode(mut self, lowp_mode: WoqLowpMode) -> Self {
        self.lowp_mode = lowp_mode;
        self
    }

    /// The low-precision mode the kernels will actually use.
    ///
    /// Int8 activation compute needs 4-bit weights; int8 weights fall back to bf16.
    pub fn effective_lowp_mode(&self) -> WoqLowpMode {
        match (self.lowp_mode, self.weight_dtype) {
            (WoqLowpMode::Int8, WoqWeightDType::Int8) => {
                log::debug!("lowp_mode int8 is not defined for int8 weights, using bf16");
                WoqLowpMode::Bf16
            }
            (mode, _) => mode,
        }
    }
}

impl fmt::Display for WoqConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WoqConfig {{ weight_dtype: {:?}, lowp_mode: {} }}",
            self.weight_dtype, self.lowp_mode
        )
    }
}
