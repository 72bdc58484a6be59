//! Merging sibling linear layers that share one input.
//!
//! When every member of a group is weight-only quantized, the members are
//! dequantized, stacked row-wise into one `[sum(out_i), in]` weight and
//! re-quantized, so a single GEMM serves the whole group. The merged output is
//! split back along the trailing axis using each member's `out_features`.
//!
//! A merge either succeeds completely or leaves the members untouched.

use ndarray::{concatenate, Array1, Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewD, Axis, Slice};

use crate::cpu::kernels::KernelSet;
use crate::error::{FusionError, FusionResult};
use crate::fusion::pattern::FusionFlags;
use crate::linear_layer::LinearLayer;
use crate::quantize::{QParams, WoqConfig, WoqPacker, WoqWeightDType, ZeroPoints};
use crate::tensor::{flatten_leading, restore_leading};

/// An ordered, non-empty group of layers with a common `in_features`.
#[derive(Debug, Clone)]
pub struct ConcatGroup {
    layers: Vec<LinearLayer>,
}

impl ConcatGroup {
    pub fn new(layers: Vec<LinearLayer>) -> FusionResult<Self> {
        let first = layers
            .first()
            .ok_or_else(|| FusionError::InvalidConfig("concat group is empty".to_string()))?;
        let in_features = first.in_features();
        for (i, layer) in layers.iter().enumerate().skip(1) {
            if layer.in_features() != in_features {
                return Err(FusionError::shape(
                    format!("concat member {} in_features", i),
                    in_features,
                    layer.in_features(),
                ));
            }
        }
        Ok(Self { layers })
    }

    /// Builds a group from borrowed layers, cloning each one.
    pub fn from_refs(layers: &[&LinearLayer]) -> FusionResult<Self> {
        Self::new(layers.iter().map(|l| (*l).clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn in_features(&self) -> usize {
        self.layers[0].in_features()
    }

    pub fn out_features(&self) -> Vec<usize> {
        self.layers.iter().map(|l| l.out_features()).collect()
    }

    pub fn layers(&self) -> &[LinearLayer] {
        &self.layers
    }

    pub fn into_layers(self) -> Vec<LinearLayer> {
        self.layers
    }
}

#[derive(Debug, Clone)]
enum MergeState {
    Merged(LinearLayer),
    Separate(Vec<LinearLayer>),
}

/// Runs a concat group as one merged quantized GEMM when possible, or as
/// separate layers otherwise.
#[derive(Debug, Clone)]
pub struct ConcatLinearMerger {
    state: MergeState,
    out_features: Vec<usize>,
    in_features: usize,
    kernels: KernelSet,
}

impl ConcatLinearMerger {
    pub fn new(group: ConcatGroup, flags: FusionFlags) -> FusionResult<Self> {
        Self::with_kernels(group, flags, KernelSet::default())
    }

    pub fn with_kernels(
        group: ConcatGroup,
        flags: FusionFlags,
        kernels: KernelSet,
    ) -> FusionResult<Self> {
        let out_features = group.out_features();
        let in_features = group.in_features();

        let eligible = flags.woq && group.layers().iter().all(|l| l.is_weight_only_quantized());
        let state = if eligible {
            match merge_quantized(group.layers()) {
                Ok(merged) => {
                    log::info!(
                        "Merged {} linears into one [{}, {}] {:?} layer",
                        group.len(),
                        merged.out_features(),
                        in_features,
                        merged.dtype()
                    );
                    MergeState::Merged(merged)
                }
                Err(e) if e.is_recoverable_merge_failure() => {
                    log::warn!(
                        "Concat linear fusion failed: {}. Falling back to separate linears.",
                        e
                    );
                    MergeState::Separate(group.into_layers())
                }
                Err(e) => return Err(e),
            }
        } else {
            MergeState::Separate(group.into_layers())
        };

        Ok(Self {
            state,
            out_features,
            in_features,
            kernels,
        })
    }

    /// Returns one output per member, in order, each shaped `[*leading, out_i]`.
    pub fn forward(&self, input: &ArrayViewD<f32>) -> FusionResult<Vec<ArrayD<f32>>> {
        match &self.state {
            MergeState::Merged(linear) => {
                let (x, leading) = flatten_leading(input, self.in_features, "concat linear input")?;
                let merged = match linear.quant_context() {
                    Some(ctx) => self.kernels.woq.woq_linear(&x.view(), ctx)?,
                    None => linear.matmul(&x.view()),
                };
                self.split(&merged.view())
                    .into_iter()
                    .map(|part| restore_leading(part, &leading))
                    .collect()
            }
            MergeState::Separate(layers) => layers.iter().map(|l| l.forward(input)).collect(),
        }
    }

    fn split(&self, merged: &ArrayView2<f32>) -> Vec<Array2<f32>> {
        let mut start = 0;
        self.out_features
            .iter()
            .map(|&width| {
                let part = merged
                    .slice_axis(Axis(1), Slice::from(start..start + width))
                    .as_standard_layout()
                    .into_owned();
                start += width;
                part
            })
            .collect()
    }

    pub fn is_merged(&self) -> bool {
        matches!(self.state, MergeState::Merged(_))
    }

    pub fn num_concats(&self) -> usize {
        self.out_features.len()
    }

    /// Output width of each member.
    pub fn out_features(&self) -> &[usize] {
        &self.out_features
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn merged_layer(&self) -> Option<&LinearLayer> {
        match &self.state {
            MergeState::Merged(linear) => Some(linear),
            MergeState::Separate(_) => None,
        }
    }

    pub fn separate_layers(&self) -> Option<&[LinearLayer]> {
        match &self.state {
            MergeState::Merged(_) => None,
            MergeState::Separate(layers) => Some(layers),
        }
    }
}

/// Dequantizes, concatenates and re-quantizes every member.
///
/// The merged weight uses the first member's low-precision mode and the last
/// member's weight dtype. Nothing is kept from a failed attempt.
pub(crate) fn merge_quantized(layers: &[LinearLayer]) -> FusionResult<LinearLayer> {
    let mut weights = Vec::with_capacity(layers.len());
    let mut qparams = Vec::with_capacity(layers.len());
    let mut biases = Vec::with_capacity(layers.len());
    let mut lowp_mode = None;
    let mut weight_dtype = WoqWeightDType::default();

    for (i, layer) in layers.iter().enumerate() {
        let ctx = layer
            .quant_context()
            .ok_or(FusionError::MissingQuantizationContext { layer: i })?;
        let qw = &ctx.weight;
        if !qw.scheme().is_per_channel() || qw.axis() != 0 {
            return Err(FusionError::UnsupportedQuantizationScheme(format!(
                "member {} uses {:?} on axis {}",
                i,
                qw.scheme(),
                qw.axis()
            )));
        }
        weights.push(qw.dequantize());
        qparams.push(QParams {
            scales: qw.scales().clone(),
            zero_points: ZeroPoints::Float(qw.zero_points().to_f32()),
        });
        biases.push(ctx.bias.as_ref());
        lowp_mode.get_or_insert(ctx.lowp_mode);
        weight_dtype = WoqWeightDType::from_dtype(qw.dtype())?;
    }

    let views: Vec<ArrayView2<f32>> = weights.iter().map(|w| w.view()).collect();
    let weight = concatenate(Axis(0), &views)?;
    let source_params = QParams::concat(&qparams)?;
    let bias = if biases.iter().all(|b| b.is_some()) {
        let views: Vec<ArrayView1<f32>> = biases.iter().flatten().map(|b| b.view()).collect();
        Some(concatenate(Axis(0), &views)?)
    } else {
        None
    };

    let config = WoqConfig::new(weight_dtype, lowp_mode.unwrap_or_default());
    let packer = WoqPacker::new(config);
    let qweight = packer.quantize(&weight.view())?;
    log::debug!(
        "Re-quantized merged weight: max scale drift {:.3e} over {} channels",
        max_abs_diff(qweight.scales(), &source_params.scales),
        source_params.scales.len()
    );

    Ok(packer.wrap(qweight, bias, layers.len()))
}

fn max_abs_diff(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .fold(0.0f32, |m, (x, y)| m.max((x - y).abs()))
}
