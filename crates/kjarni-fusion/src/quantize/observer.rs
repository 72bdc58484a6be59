//! Per-channel min/max calibration for weight-only quantization.

use ndarray::{Array1, ArrayView2, Axis};

use crate::quantize::config::WoqWeightDType;
use crate::quantize::qweight::{QParams, ZeroPoints};

/// Observes the per-output-channel range of a weight and derives affine parameters.
///
/// Channels are rows (axis 0) of an `[out_features, in_features]` weight.
#[derive(Debug, Clone, Copy)]
pub struct PerChannelMinMaxObserver {
    dtype: WoqWeightDType,
    eps: f32,
}

impl PerChannelMinMaxObserver {
    pub fn new(dtype: WoqWeightDType) -> Self {
        Self {
            dtype,
            eps: f32::EPSILON,
        }
    }

    pub fn dtype(&self) -> WoqWeightDType {
        self.dtype
    }

    /// Computes scale and zero point for every row of `weight`.
    pub fn calculate_qparams(&self, weight: &ArrayView2<f32>) -> QParams {
        let rows = weight.nrows();
        let mut mins = Array1::<f32>::zeros(rows);
        let mut maxs = Array1::<f32>::zeros(rows);
        for (i, row) in weight.axis_iter(Axis(0)).enumerate() {
            let (lo, hi) = row
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
            // Empty rows observe nothing.
            mins[i] = if lo.is_finite() { lo } else { 0.0 };
            maxs[i] = if hi.is_finite() { hi } else { 0.0 };
        }

        match self.dtype {
            WoqWeightDType::Int8 => self.affine_int8(&mins, &maxs),
            WoqWeightDType::UInt4x2 => self.float_qparams_uint4(&mins, &maxs),
        }
    }

    fn affine_int8(&self, mins: &Array1<f32>, maxs: &Array1<f32>) -> QParams {
        let (qmin, qmax) = (-128i32, 127i32);
        let mut scales = Array1::<f32>::zeros(mins.len());
        let mut zero_points = Array1::<i32>::zeros(mins.len());
        for i in 0..mins.len() {
            // The representable range must include zero.
            let min_neg = mins[i].min(0.0);
            let max_pos = maxs[i].max(0.0);
            let scale = ((max_pos - min_neg) / (qmax - qmin) as f32).max(self.eps);
            let zp = qmin - (min_neg / scale).round() as i32;
            scales[i] = scale;
            zero_points[i] = zp.clamp(qmin, qmax);
        }
        QParams {
            scales,
            zero_points: ZeroPoints::Int(zero_points),
        }
    }

    fn float_qparams_uint4(&self, mins: &Array1<f32>, maxs: &Array1<f32>) -> QParams {
        let (qmin, qmax) = (0.0f32, 15.0f32);
        let mut scales = Array1::<f32>::zeros(mins.len());
        let mut zero_points = Array1::<f32>::zeros(mins.len());
        for i in 0..mins.len() {
            let range = maxs[i] - mins[i];
            let scale = if range > 0.0 {
                (range / (qmax - qmin)).max(self.eps)
            } else {
                1.0
            };
            scales[i] = scale;
            zero_points[i] = qmin - mins[i] / scale;
        }
        QParams {
            scales,
            zero_points: ZeroPoints::Float(zero_points),
        }
    }
}
