//! Quantized weight representation.
//!
//! A `QuantizedWeight` is the (packed tensor, scale vector, zero-point vector,
//! dtype tag) tuple a weight-only-quantized linear layer executes against.
//! Weights keep the `[OutFeatures, InFeatures]` layout used by `LinearLayer`.

use ndarray::{concatenate, Array1, Array2, ArrayView1, Axis};

use crate::error::{FusionError, FusionResult};
use crate::quantize::int4::{packed_row_bytes, unpack_nibbles, unpack_row_into};
use crate::tensor::DType;

/// How scale and zero point are shared across the weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QScheme {
    /// One scale and one integer zero point for the whole tensor.
    PerTensorAffine,
    /// One scale and one integer zero point per channel.
    PerChannelAffine,
    /// One scale and one float zero point per channel.
    PerChannelAffineFloatQParams,
}

impl QScheme {
    pub fn is_per_channel(&self) -> bool {
        !matches!(self, QScheme::PerTensorAffine)
    }
}

/// Zero points, stored in the representation their dtype requires.
#[derive(Debug, Clone, PartialEq)]
pub enum ZeroPoints {
    /// Used by int8 weights.
    Int(Array1<i32>),
    /// Used by 4-bit weights.
    Float(Array1<f32>),
}

impl ZeroPoints {
    pub fn len(&self) -> usize {
        match self {
            ZeroPoints::Int(z) => z.len(),
            ZeroPoints::Float(z) => z.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn get(&self, i: usize) -> f32 {
        match self {
            ZeroPoints::Int(z) => z[i] as f32,
            ZeroPoints::Float(z) => z[i],
        }
    }

    pub fn to_f32(&self) -> Array1<f32> {
        match self {
            ZeroPoints::Int(z) => z.mapv(|v| v as f32),
            ZeroPoints::Float(z) => z.clone(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ZeroPoints::Int(_) => "integer",
            ZeroPoints::Float(_) => "float",
        }
    }
}

/// Per-channel quantization parameters produced by an observer.
#[derive(Debug, Clone, PartialEq)]
pub struct QParams {
    pub scales: Array1<f32>,
    pub zero_points: ZeroPoints,
}

impl QParams {
    /// Concatenates parameters along the channel axis.
    ///
    /// Mixed integer/float zero points are converted to float.
    pub fn concat(parts: &[QParams]) -> FusionResult<QParams> {
        let scale_views: Vec<ArrayView1<f32>> = parts.iter().map(|p| p.scales.view()).collect();
        let scales = concatenate(Axis(0), &scale_views)?;

        let all_int = parts.iter().all(|p| matches!(p.zero_points, ZeroPoints::Int(_)));
        let zero_points = if all_int {
            let views: Vec<ArrayView1<i32>> = parts
                .iter()
                .filter_map(|p| match &p.zero_points {
                    ZeroPoints::Int(z) => Some(z.view()),
                    ZeroPoints::Float(_) => None,
                })
                .collect();
            ZeroPoints::Int(concatenate(Axis(0), &views)?)
        } else {
            let owned: Vec<Array1<f32>> = parts.iter().map(|p| p.zero_points.to_f32()).collect();
            let views: Vec<ArrayView1<f32>> = owned.iter().map(|z| z.view()).collect();
            ZeroPoints::Float(concatenate(Axis(0), &views)?)
        };
        Ok(QParams {
            scales,
            zero_points,
        })
    }
}

/// Integer codes of a quantized weight.
#[derive(Debug, Clone, PartialEq)]
pub enum PackedWeight {
    /// `[out, in]` signed codes.
    Int8(Array2<i8>),
    /// `[out, ceil(in / 2)]` bytes, two unsigned 4-bit codes per byte.
    UInt4x2(Array2<u8>),
}

impl PackedWeight {
    pub fn dtype(&self) -> DType {
        match self {
            PackedWeight::Int8(_) => DType::QInt8,
            PackedWeight::UInt4x2(_) => DType::QUInt4x2,
        }
    }
}

/// A weight-only quantized `[out_features, in_features]` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedWeight {
    packed: PackedWeight,
    scales: Array1<f32>,
    zero_points: ZeroPoints,
    scheme: QScheme,
    axis: usize,
    shape: [usize; 2],
}

impl QuantizedWeight {
    /// Builds a quantized weight, validating every layout invariant.
    pub fn new(
        packed: PackedWeight,
        shape: [usize; 2],
        scales: Array1<f32>,
        zero_points: ZeroPoints,
        scheme: QScheme,
        axis: usize,
    ) -> FusionResult<Self> {
        let [rows, cols] = shape;
        let packed_dim = match &packed {
            PackedWeight::Int8(w) => (w.dim(), (rows, cols)),
            PackedWeight::UInt4x2(w) => (w.dim(), (rows, packed_row_bytes(cols))),
        };
        if packed_dim.0 != packed_dim.1 {
            return Err(FusionError::shape(
                "QuantizedWeight packed data",
                packed_dim.1,
                packed_dim.0,
            ));
        }

        match (&packed, &zero_points) {
            (PackedWeight::Int8(_), ZeroPoints::Int(_))
            | (PackedWeight::UInt4x2(_), ZeroPoints::Float(_)) => {}
            (p, z) => {
                return Err(FusionError::UnsupportedQuantizationScheme(format!(
                    "{:?} weights cannot use {} zero points",
                    p.dtype(),
                    z.kind()
                )));
            }
        }

        match (&packed, scheme) {
            (PackedWeight::Int8(_), QScheme::PerTensorAffine | QScheme::PerChannelAffine)
            | (PackedWeight::UInt4x2(_), QScheme::PerChannelAffineFloatQParams) => {}
            (p, s) => {
                return Err(FusionError::UnsupportedQuantizationScheme(format!(
                    "{:?} weights cannot use scheme {:?}",
                    p.dtype(),
                    s
                )));
            }
        }

        let expected_params = if scheme.is_per_channel() {
            if axis > 1 {
                return Err(FusionError::UnsupportedQuantizationScheme(format!(
                    "channel axis {} out of range for a 2D weight",
                    axis
                )));
            }
            shape[axis]
        } else {
            1
        };
        if scales.len() != expected_params || zero_points.len() != expected_params {
            return Err(FusionError::shape(
                "QuantizedWeight scales/zero points",
                expected_params,
                (scales.len(), zero_points.len()),
            ));
        }
        if let Some(bad) = scales.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(FusionError::UnsupportedQuantizationScheme(format!(
                "scale {} is not a positive finite number",
                bad
            )));
        }

        Ok(Self {
            packed,
            scales,
            zero_points,
            scheme,
            axis,
            shape,
        })
    }

    pub fn dtype(&self) -> DType {
        self.packed.dtype()
    }

    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    pub fn out_features(&self) -> usize {
        self.shape[0]
    }

    pub fn in_features(&self) -> usize {
        self.shape[1]
    }

    pub fn packed(&self) -> &PackedWeight {
        &self.packed
    }

    pub fn scales(&self) -> &Array1<f32> {
        &self.scales
    }

    pub fn zero_points(&self) -> &ZeroPoints {
        &self.zero_points
    }

    pub fn scheme(&self) -> QScheme {
        self.scheme
    }

    /// Channel axis for per-channel schemes. Meaningless for per-tensor weights.
    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn qparams(&self) -> QParams {
        QParams {
            scales: self.scales.clone(),
            zero_points: self.zero_points.clone(),
        }
    }

    /// `true` when every output row has a single scale and zero point.
    pub fn params_follow_rows(&self) -> bool {
        !self.scheme.is_per_channel() || self.axis == 0
    }

    /// `(scale, zero_point)` shared by every element of `row`, if the params follow rows.
    #[inline]
    pub fn row_params(&self, row: usize) -> Option<(f32, f32)> {
        if !self.params_follow_rows() {
            return None;
        }
        let ch = self.channel(row, 0);
        Some((self.scales[ch], self.zero_points.get(ch)))
    }

    #[inline(always)]
    fn channel(&self, row: usize, col: usize) -> usize {
        match (self.scheme.is_per_channel(), self.axis) {
            (false, _) => 0,
            (true, 0) => row,
            (true, _) => col,
        }
    }

    /// Writes the integer codes of one output row into `out` (length `in_features`).
    pub fn codes_row_into(&self, row: usize, out: &mut [i32]) {
        match &self.packed {
            PackedWeight::Int8(w) => {
                for (slot, &q) in out.iter_mut().zip(w.row(row).iter()) {
                    *slot = q as i32;
                }
            }
            PackedWeight::UInt4x2(w) => {
                let mut codes = vec![0u8; self.shape[1]];
                let packed_row = w.row(row).to_vec();
                unpack_row_into(&packed_row, &mut codes);
                for (slot, &q) in out.iter_mut().zip(codes.iter()) {
                    *slot = q as i32;
                }
            }
        }
    }

    /// Dequantizes one output row into `out` (length `in_features`).
    pub fn dequantize_row_into(&self, row: usize, out: &mut [f32]) {
        let mut codes = vec![0i32; self.shape[1]];
        self.codes_row_into(row, &mut codes);
        for (col, (slot, &q)) in out.iter_mut().zip(codes.iter()).enumerate() {
            let ch = self.channel(row, col);
            *slot = (q as f32 - self.zero_points.get(ch)) * self.scales[ch];
        }
    }

    /// `(packed - zero_point) * scale`, broadcast along the channel axis.
    pub fn dequantize(&self) -> Array2<f32> {
        let codes: Array2<f32> = match &self.packed {
            PackedWeight::Int8(w) => w.mapv(|q| q as f32),
            PackedWeight::UInt4x2(w) => unpack_nibbles(&w.view(), self.shape[1]).mapv(|q| q as f32),
        };
        let mut out = codes;
        for ((row, col), v) in out.indexed_iter_mut() {
            let ch = self.channel(row, col);
            *v = (*v - self.zero_points.get(ch)) * self.scales[ch];
        }
        out
    }
}
