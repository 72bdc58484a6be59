//! Packing F32 weights into weight-only quantized form and back.
//!
//! # Quantization Algorithm
//!
//! Both formats use per-output-channel affine quantization:
//!
//! 1. Observe or receive a scale `s` and zero point `z` for every row.
//! 2. Quantize each value: `q = clamp(round(x / s + z), qmin, qmax)`.
//! 3. Store `q` as int8 (`[-128, 127]`, integer `z`) or as 4-bit codes
//!    (`[0, 15]`, float `z`) packed two per byte.
//!
//! Dequantization recovers approximate values: `x' = (q - z) * s`, with
//! `|x - x'| <= s / 2` for every `x` inside the observed range.
//!
//! # Example
//!
//! ```ignore
//! use kjarni_fusion::quantize::{WoqConfig, WoqPacker};
//!
//! let packer = WoqPacker::new(WoqConfig::int4());
//! let qweight = packer.quantize(&weights.view())?;
//! let restored = WoqPacker::unpack(&qweight);
//! ```

use std::sync::Arc;

use ndarray::{Array2, ArrayView2};

use crate::error::{FusionError, FusionResult};
use crate::linear_layer::{LinearData, LinearLayer, WoqContext};
use crate::quantize::config::{WoqConfig, WoqWeightDType};
use crate::quantize::int4::pack_nibbles;
use crate::quantize::observer::PerChannelMinMaxObserver;
use crate::quantize::qweight::{PackedWeight, QParams, QScheme, QuantizedWeight, ZeroPoints};

/// Packs and unpacks weight-only quantized weights for one `WoqConfig`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WoqPacker {
    config: WoqConfig,
}

impl WoqPacker {
    pub fn new(config: WoqConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WoqConfig {
        &self.config
    }

    /// Observes fresh per-channel parameters for `weight` in the configured dtype.
    pub fn observe(&self, weight: &ArrayView2<f32>) -> QParams {
        PerChannelMinMaxObserver::new(self.config.weight_dtype).calculate_qparams(weight)
    }

    /// Observes and packs in one step.
    pub fn quantize(&self, weight: &ArrayView2<f32>) -> FusionResult<QuantizedWeight> {
        let qparams = self.observe(weight);
        Self::pack(
            weight,
            self.config.weight_dtype,
            &qparams.scales,
            &qparams.zero_points,
        )
    }

    /// Quantizes `weight` with caller-supplied per-channel parameters.
    ///
    /// The zero-point representation must match the target: integer for int8,
    /// float for 4-bit.
    pub fn pack(
        weight: &ArrayView2<f32>,
        target: WoqWeightDType,
        scales: &ndarray::Array1<f32>,
        zero_points: &ZeroPoints,
    ) -> FusionResult<QuantizedWeight> {
        let (rows, cols) = weight.dim();
        if scales.len() != rows || zero_points.len() != rows {
            return Err(FusionError::shape(
                "WoqPacker::pack per-channel parameters",
                rows,
                (scales.len(), zero_points.len()),
            ));
        }
        if let Some(bad) = scales.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(FusionError::UnsupportedQuantizationScheme(format!(
                "scale {} is not a positive finite number",
                bad
            )));
        }

        match (target, zero_points) {
            (WoqWeightDType::Int8, ZeroPoints::Int(zp)) => {
                let mut codes = Array2::<i8>::zeros((rows, cols));
                for ((r, c), q) in codes.indexed_iter_mut() {
                    let inv = 1.0 / scales[r];
                    let v = (weight[[r, c]] * inv).round() + zp[r] as f32;
                    *q = v.clamp(-128.0, 127.0) as i8;
                }
                QuantizedWeight::new(
                    PackedWeight::Int8(codes),
                    [rows, cols],
                    scales.clone(),
                    zero_points.clone(),
                    QScheme::PerChannelAffine,
                    0,
                )
            }
            (WoqWeightDType::UInt4x2, ZeroPoints::Float(zp)) => {
                let mut codes = Array2::<u8>::zeros((rows, cols));
                for ((r, c), q) in codes.indexed_iter_mut() {
                    let inv = 1.0 / scales[r];
                    let v = (weight[[r, c]] * inv + zp[r]).round();
                    *q = v.clamp(0.0, 15.0) as u8;
                }
                QuantizedWeight::new(
                    PackedWeight::UInt4x2(pack_nibbles(&codes.view())),
                    [rows, cols],
                    scales.clone(),
                    zero_points.clone(),
                    QScheme::PerChannelAffineFloatQParams,
                    0,
                )
            }
            (WoqWeightDType::Int8, ZeroPoints::Float(_)) => {
                Err(FusionError::UnsupportedQuantizationScheme(
                    "int8 weights require integer zero points".to_string(),
                ))
            }
            (WoqWeightDType::UInt4x2, ZeroPoints::Int(_)) => {
                Err(FusionError::UnsupportedQuantizationScheme(
                    "4-bit weights require float zero points".to_string(),
                ))
            }
        }
    }

    /// Dequantizes a packed weight back to F32.
    pub fn unpack(weight: &QuantizedWeight) -> Array2<f32> {
        weight.dequantize()
    }

    /// Converts a float layer into a weight-only quantized layer.
    ///
    /// The bias is kept in F32. The resulting context uses this packer's
    /// effective low-precision mode.
    pub fn convert(&self, layer: &LinearLayer) -> FusionResult<LinearLayer> {
        let weight = match &layer.data {
            LinearData::Woq(_) => {
                return Err(FusionError::UnsupportedDType {
                    dtype: layer.dtype(),
                    operation: "WoqPacker::convert (already quantized)".to_string(),
                });
            }
            _ => layer.to_f32_weight(),
        };
        log::debug!(
            "Quantizing [{}, {}] {:?} weight with {}",
            weight.nrows(),
            weight.ncols(),
            layer.dtype(),
            self.config
        );
        let qweight = self.quantize(&weight.view())?;
        Ok(self.wrap(qweight, layer.bias().cloned(), layer.num_concats()))
    }

    /// Converts a float layer using caller-supplied 4-bit or int8 parameters.
    pub fn from_float_weight_and_qparams(
        &self,
        weight: &ArrayView2<f32>,
        bias: Option<ndarray::Array1<f32>>,
        qparams: &QParams,
    ) -> FusionResult<LinearLayer> {
        let qweight = Self::pack(
            weight,
            self.config.weight_dtype,
            &qparams.scales,
            &qparams.zero_points,
        )?;
        Ok(self.wrap(qweight, bias, 1))
    }

    /// Wraps an already packed weight into a layer holding a quantized context.
    pub fn wrap(
        &self,
        weight: QuantizedWeight,
        bias: Option<ndarray::Array1<f32>>,
        num_concats: usize,
    ) -> LinearLayer {
        // The quantized kernels own the bias epilogue, so it lives in the context only.
        let context = WoqContext {
            weight,
            bias,
            lowp_mode: self.config.effective_lowp_mode(),
            num_concats,
        };
        LinearLayer {
            data: LinearData::Woq(Arc::new(context)),
            bias: None,
            woq_config: Some(self.config),
            num_concats,
        }
    }
}
