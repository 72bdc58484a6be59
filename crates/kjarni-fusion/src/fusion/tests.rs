use std::sync::Arc;

use anyhow::Result;
use ndarray::{arr1, ArrayD};

use super::*;
use crate::activations::GeluApproximation;
use crate::cpu::kernels::{CpuTppKernels, CpuWoqKernels, KernelSet, WoqKernels};
use crate::error::FusionError;
use crate::linear_layer::{LinearLayer, WoqContext};
use crate::quantize::{
    PackedWeight, QScheme, QuantizedWeight, WoqConfig, WoqLowpMode, WoqPacker, ZeroPoints,
};
use crate::tensor::DType;
use crate::tests::common::{
    assert_all_close, f32_layer, generate_weights, init_logging, max_abs_diff, random_tensor,
    woq_layer,
};

fn operands_for(pattern: FusionPattern, shape: &[usize]) -> Vec<ArrayD<f32>> {
    (0..pattern.num_operands()).map(|_| random_tensor(shape)).collect()
}

fn views(operands: &[ArrayD<f32>]) -> Vec<ndarray::ArrayViewD<'_, f32>> {
    operands.iter().map(|o| o.view()).collect()
}

const SINGLE_OUTPUT_PATTERNS: [FusionPattern; 7] = [
    FusionPattern::Silu,
    FusionPattern::Relu,
    FusionPattern::Gelu,
    FusionPattern::NewGelu,
    FusionPattern::Mul,
    FusionPattern::Add,
    FusionPattern::AddAdd,
];

// =============================================================================
// Patterns and mode selection
// =============================================================================

#[test]
fn test_pattern_arity() {
    assert_eq!(FusionPattern::Silu.arity(), 1);
    assert_eq!(FusionPattern::NewGelu.arity(), 1);
    assert_eq!(FusionPattern::Mul.arity(), 2);
    assert_eq!(FusionPattern::Add.arity(), 2);
    assert_eq!(FusionPattern::AddAdd.arity(), 3);
    assert_eq!(FusionPattern::AddAdd.num_operands(), 2);
}

#[test]
fn test_pattern_names_round_trip() {
    for pattern in FusionPattern::ALL {
        assert_eq!(pattern.to_string().parse::<FusionPattern>(), Ok(pattern));
    }
    assert_eq!("gelu_tanh".parse::<FusionPattern>(), Ok(FusionPattern::NewGelu));
    assert!("linear".parse::<FusionPattern>().is_err());

    let json = serde_json::to_string(&FusionPattern::AddAdd).unwrap();
    assert_eq!(json, r#""add_add""#);
}

#[test]
fn test_flags_from_json() {
    let flags: FusionFlags = serde_json::from_str(r#"{"tpp": true}"#).unwrap();
    assert_eq!(flags, FusionFlags::tpp());
    assert_eq!(FusionFlags::default(), FusionFlags::new(false, false));
}

#[test]
fn test_mode_selection_priority() {
    let kernels = KernelSet::default();
    let float = f32_layer(8, 8, 0, false);
    let quantized = woq_layer(8, 8, 0, false, WoqConfig::int8());
    let both = FusionFlags::new(true, true);

    // Specialized kernels win whenever they support the dtype.
    assert_eq!(
        ExecutionMode::select(FusionPattern::Add, both, &float, &kernels),
        ExecutionMode::SpecializedFused
    );
    // Quantized weights are not float, so the quantized kernels take over.
    assert_eq!(
        ExecutionMode::select(FusionPattern::Add, both, &quantized, &kernels),
        ExecutionMode::QuantizedFused
    );
    // No quantized primitive for Silu.
    assert_eq!(
        ExecutionMode::select(FusionPattern::Silu, both, &quantized, &kernels),
        ExecutionMode::FallbackCompose
    );
    // WOQ requested but the layer is float.
    assert_eq!(
        ExecutionMode::select(FusionPattern::Gelu, FusionFlags::woq(), &float, &kernels),
        ExecutionMode::FallbackCompose
    );
    assert_eq!(
        ExecutionMode::select(FusionPattern::Gelu, FusionFlags::default(), &quantized, &kernels),
        ExecutionMode::FallbackCompose
    );
}

#[test]
fn test_prepared_layer_without_context_composes() -> Result<()> {
    init_logging();
    let layer = f32_layer(8, 16, 1, true).with_woq_config(WoqConfig::int8());
    let op = FusedLinearOp::new(layer.clone(), FusionPattern::Add, FusionFlags::woq())?;
    assert_eq!(op.mode(), ExecutionMode::FallbackCompose);

    let x = random_tensor(&[2, 16]);
    let y = random_tensor(&[2, 8]);
    let expected = ReferenceLinearOp::new(layer, FusionPattern::Add)?.forward(&x.view(), &[y.view()])?;
    assert_eq!(op.forward(&x.view(), &[y.view()])?, expected);
    Ok(())
}

#[test]
fn test_concat_is_rejected_by_single_output_ops() {
    let layer = f32_layer(4, 4, 0, false);
    let err = FusedLinearOp::new(layer.clone(), FusionPattern::Concat, FusionFlags::default())
        .unwrap_err();
    assert!(matches!(err, FusionError::UnsupportedPattern(_)));

    let err = ReferenceLinearOp::new(layer, FusionPattern::Concat).unwrap_err();
    assert!(matches!(err, FusionError::UnsupportedPattern(_)));
}

// =============================================================================
// FusedLinearOp vs ReferenceLinearOp
// =============================================================================

#[test]
fn test_fallback_matches_reference_bit_for_bit() -> Result<()> {
    let shape_in = [2, 3, 32];
    let shape_out = [2, 3, 24];
    for pattern in SINGLE_OUTPUT_PATTERNS {
        let layer = f32_layer(24, 32, 3, true);
        let fused = FusedLinearOp::new(layer.clone(), pattern, FusionFlags::default())?;
        let reference = ReferenceLinearOp::new(layer, pattern)?;
        assert_eq!(fused.mode(), ExecutionMode::FallbackCompose);

        let x = random_tensor(&shape_in);
        let operands = operands_for(pattern, &shape_out);
        let a = fused.forward(&x.view(), &views(&operands))?;
        let b = reference.forward(&x.view(), &views(&operands))?;
        assert_eq!(a.shape(), &shape_out);
        assert_eq!(a, b, "{} fallback differs from reference", pattern);
    }
    Ok(())
}

#[test]
fn test_fallback_on_quantized_layer_matches_reference() -> Result<()> {
    for pattern in SINGLE_OUTPUT_PATTERNS {
        let layer = woq_layer(16, 32, 5, true, WoqConfig::int4());
        let fused = FusedLinearOp::new(layer.clone(), pattern, FusionFlags::default())?;
        let reference = ReferenceLinearOp::new(layer, pattern)?;

        let x = random_tensor(&[4, 32]);
        let operands = operands_for(pattern, &[4, 16]);
        assert_eq!(
            fused.forward(&x.view(), &views(&operands))?,
            reference.forward(&x.view(), &views(&operands))?
        );
    }
    Ok(())
}

#[test]
fn test_specialized_matches_reference() -> Result<()> {
    for pattern in SINGLE_OUTPUT_PATTERNS {
        let layer = f32_layer(24, 32, 9, true);
        let fused = FusedLinearOp::new(layer.clone(), pattern, FusionFlags::tpp())?;
        assert_eq!(fused.mode(), ExecutionMode::SpecializedFused);
        let reference = ReferenceLinearOp::new(layer, pattern)?;

        let x = random_tensor(&[5, 32]);
        let operands = operands_for(pattern, &[5, 24]);
        let a = fused.forward(&x.view(), &views(&operands))?;
        let b = reference.forward(&x.view(), &views(&operands))?;
        assert_all_close(&a, &b, 1e-4);
    }
    Ok(())
}

#[test]
fn test_quantized_fused_matches_composition() -> Result<()> {
    for pattern in [
        FusionPattern::Add,
        FusionPattern::AddAdd,
        FusionPattern::Gelu,
        FusionPattern::NewGelu,
    ] {
        let layer = woq_layer(16, 32, 2, true, WoqConfig::int8());
        let fused = FusedLinearOp::new(layer.clone(), pattern, FusionFlags::woq())?;
        assert_eq!(fused.mode(), ExecutionMode::QuantizedFused);
        let reference = ReferenceLinearOp::new(layer, pattern)?;

        let x = random_tensor(&[2, 3, 32]);
        let operands = operands_for(pattern, &[2, 3, 16]);
        let a = fused.forward(&x.view(), &views(&operands))?;
        let b = reference.forward(&x.view(), &views(&operands))?;
        assert_eq!(a, b, "{} quantized fused differs from composition", pattern);
    }
    Ok(())
}

#[test]
fn test_gelu_and_new_gelu_differ() -> Result<()> {
    let layer = f32_layer(16, 16, 4, false);
    let x = random_tensor(&[8, 16]).mapv(|v| v * 4.0);

    for flags in [FusionFlags::default(), FusionFlags::tpp()] {
        let gelu = FusedLinearOp::new(layer.clone(), FusionPattern::Gelu, flags)?;
        let new_gelu = FusedLinearOp::new(layer.clone(), FusionPattern::NewGelu, flags)?;
        let a = gelu.forward(&x.view(), &[])?;
        let b = new_gelu.forward(&x.view(), &[])?;
        assert!(max_abs_diff(&a, &b) > 1e-5, "gelu variants must not alias");
    }
    Ok(())
}

#[test]
fn test_add_add_tpp_scenario() -> Result<()> {
    // [4, 64] input through a [64, 64] weight plus two [4, 64] operands.
    let layer = LinearLayer::new_f32(generate_weights(64, 64, 21), None);
    let x = random_tensor(&[4, 64]);
    let y = random_tensor(&[4, 64]);
    let z = random_tensor(&[4, 64]);

    let op = FusedLinearOp::new(layer.clone(), FusionPattern::AddAdd, FusionFlags::tpp())?;
    assert_eq!(op.mode(), ExecutionMode::SpecializedFused);
    let out = op.forward(&x.view(), &[y.view(), z.view()])?;

    let expected = layer.forward(&x.view())? + &y + &z;
    assert_all_close(&out, &expected, 1e-4);
    Ok(())
}

#[test]
fn test_bf16_specialized_within_compute_tolerance() -> Result<()> {
    let w = generate_weights(32, 32, 6).mapv(half::bf16::from_f32);
    let layer = LinearLayer::new_bf16(w, Some(crate::tests::common::generate_bias(32, 1)));
    let x = random_tensor(&[4, 32]);
    let y = random_tensor(&[4, 32]);

    let op = FusedLinearOp::new(layer.clone(), FusionPattern::Add, FusionFlags::tpp())?;
    let reference = ReferenceLinearOp::new(layer, FusionPattern::Add)?;
    let a = op.forward(&x.view(), &[y.view()])?;
    let b = reference.forward(&x.view(), &[y.view()])?;
    assert_all_close(&a, &b, 0.1);
    assert!(a.iter().all(|&v| DType::BF16.round(v) == v));
    Ok(())
}

#[test]
fn test_operand_errors_are_shape_mismatches() {
    for flags in [FusionFlags::default(), FusionFlags::tpp()] {
        let op = FusedLinearOp::new(f32_layer(8, 16, 0, false), FusionPattern::AddAdd, flags).unwrap();
        let x = random_tensor(&[2, 16]);
        let y = random_tensor(&[2, 8]);

        let err = op.forward(&x.view(), &[y.view()]).unwrap_err();
        assert!(matches!(err, FusionError::ShapeMismatch { .. }));

        let bad = random_tensor(&[2, 9]);
        let err = op.forward(&x.view(), &[y.view(), bad.view()]).unwrap_err();
        assert!(matches!(err, FusionError::ShapeMismatch { .. }));

        let narrow = random_tensor(&[2, 15]);
        let err = op.forward(&narrow.view(), &[y.view(), y.view()]).unwrap_err();
        assert!(matches!(err, FusionError::ShapeMismatch { .. }));
    }
}

/// Quantized kernels that always fail, to check error propagation.
struct FailingWoq;

impl WoqKernels for FailingWoq {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn supports(&self, _pattern: FusionPattern) -> bool {
        true
    }

    fn woq_linear(
        &self,
        _input: &ndarray::ArrayView2<f32>,
        _context: &WoqContext,
    ) -> anyhow::Result<ndarray::Array2<f32>> {
        Err(anyhow::anyhow!("device lost"))
    }

    fn woq_linear_add(
        &self,
        input: &ndarray::ArrayView2<f32>,
        context: &WoqContext,
        _others: &[ndarray::ArrayView2<f32>],
    ) -> anyhow::Result<ndarray::Array2<f32>> {
        self.woq_linear(input, context)
    }

    fn woq_linear_add_add(
        &self,
        input: &ndarray::ArrayView2<f32>,
        context: &WoqContext,
        _others: &[ndarray::ArrayView2<f32>],
    ) -> anyhow::Result<ndarray::Array2<f32>> {
        self.woq_linear(input, context)
    }

    fn woq_linear_gelu(
        &self,
        input: &ndarray::ArrayView2<f32>,
        context: &WoqContext,
        _approximation: GeluApproximation,
    ) -> anyhow::Result<ndarray::Array2<f32>> {
        self.woq_linear(input, context)
    }
}

#[test]
fn test_kernel_failure_propagates() {
    let kernels = KernelSet::new(Arc::new(CpuTppKernels), Arc::new(FailingWoq));
    let layer = woq_layer(8, 8, 0, false, WoqConfig::int8());
    let op = FusedLinearOp::with_kernels(layer, FusionPattern::Gelu, FusionFlags::woq(), kernels).unwrap();
    assert_eq!(op.mode(), ExecutionMode::QuantizedFused);

    let x = random_tensor(&[1, 8]);
    let err = op.forward(&x.view(), &[]).unwrap_err();
    assert!(matches!(err, FusionError::Kernel(_)));
}

// =============================================================================
// ConcatGroup / ConcatLinearMerger
// =============================================================================

#[test]
fn test_concat_group_validation() {
    let err = ConcatGroup::new(vec![]).unwrap_err();
    assert!(matches!(err, FusionError::InvalidConfig(_)));

    let err = ConcatGroup::new(vec![f32_layer(4, 8, 0, false), f32_layer(4, 6, 0, false)])
        .unwrap_err();
    assert!(matches!(err, FusionError::ShapeMismatch { .. }));

    let a = f32_layer(4, 8, 0, false);
    let b = f32_layer(6, 8, 1, false);
    let group = ConcatGroup::from_refs(&[&a, &b]).unwrap();
    assert_eq!(group.len(), 2);
    assert_eq!(group.out_features(), vec![4, 6]);
    assert_eq!(group.in_features(), 8);
}

#[test]
fn test_merger_three_int8_layers_scenario() -> Result<()> {
    init_logging();
    // 3 x [64 -> 64] no-bias int8 layers, batch 4.
    let layers: Vec<LinearLayer> = (0..3)
        .map(|i| woq_layer(64, 64, i * 97, false, WoqConfig::int8()))
        .collect();
    let group = ConcatGroup::new(layers)?;
    let reference = ReferenceConcatLinear::new(group.clone());
    let merger = ConcatLinearMerger::new(group, FusionFlags::woq())?;

    assert!(merger.is_merged());
    assert_eq!(merger.num_concats(), 3);
    let merged = merger.merged_layer().unwrap();
    assert_eq!(merged.shape(), [192, 64]);
    assert_eq!(merged.num_concats(), 3);
    assert_eq!(merged.dtype(), DType::QInt8);
    assert!(!merged.has_bias());

    let x = random_tensor(&[4, 64]);
    let outputs = merger.forward(&x.view())?;
    let expected = reference.forward(&x.view())?;
    assert_eq!(outputs.len(), 3);
    for (out, exp) in outputs.iter().zip(expected.iter()) {
        assert_eq!(out.shape(), &[4, 64]);
        assert_all_close(out, exp, 1e-2);
    }
    Ok(())
}

#[test]
fn test_merger_int4_with_bias_and_leading_dims() -> Result<()> {
    let layers: Vec<LinearLayer> = (0..3)
        .map(|i| woq_layer(32, 48, i + 1, true, WoqConfig::int4()))
        .collect();
    let group = ConcatGroup::new(layers)?;
    let reference = ReferenceConcatLinear::new(group.clone());
    let merger = ConcatLinearMerger::new(group, FusionFlags::woq())?;
    assert!(merger.is_merged());
    assert!(merger.merged_layer().unwrap().has_bias());

    let x = random_tensor(&[2, 3, 48]);
    let outputs = merger.forward(&x.view())?;
    for (out, exp) in outputs.iter().zip(reference.forward(&x.view())?.iter()) {
        assert_eq!(out.shape(), &[2, 3, 32]);
        assert_all_close(out, exp, 1e-2);
    }
    Ok(())
}

#[test]
fn test_merger_splits_unequal_widths() -> Result<()> {
    let widths = [8, 24, 16];
    let layers: Vec<LinearLayer> = widths
        .iter()
        .enumerate()
        .map(|(i, &w)| woq_layer(w, 32, i * 5, false, WoqConfig::int8()))
        .collect();
    let group = ConcatGroup::new(layers)?;
    let reference = ReferenceConcatLinear::new(group.clone());
    let merger = ConcatLinearMerger::new(group, FusionFlags::woq())?;
    assert!(merger.is_merged());
    assert_eq!(merger.out_features(), &widths);

    let x = random_tensor(&[3, 32]);
    let outputs = merger.forward(&x.view())?;
    for ((out, exp), &w) in outputs.iter().zip(reference.forward(&x.view())?.iter()).zip(&widths) {
        assert_eq!(out.shape(), &[3, w]);
        assert_all_close(out, exp, 1e-2);
    }
    Ok(())
}

#[test]
fn test_merger_partial_bias_drops_bias() -> Result<()> {
    let layers = vec![
        woq_layer(8, 16, 0, true, WoqConfig::int8()),
        woq_layer(8, 16, 1, false, WoqConfig::int8()),
    ];
    let merger = ConcatLinearMerger::new(ConcatGroup::new(layers)?, FusionFlags::woq())?;
    assert!(merger.is_merged());
    assert!(!merger.merged_layer().unwrap().has_bias());
    Ok(())
}

#[test]
fn test_merger_uses_last_dtype_and_first_lowp() -> Result<()> {
    let layers = vec![
        woq_layer(8, 16, 0, false, WoqConfig::int8().with_lowp_mode(WoqLowpMode::Fp16)),
        woq_layer(8, 16, 1, false, WoqConfig::int4()),
    ];
    let merger = ConcatLinearMerger::new(ConcatGroup::new(layers)?, FusionFlags::woq())?;
    let merged = merger.merged_layer().unwrap();
    assert_eq!(merged.dtype(), DType::QUInt4x2);
    assert_eq!(merged.quant_context().unwrap().lowp_mode, WoqLowpMode::Fp16);
    Ok(())
}

#[test]
fn test_merger_falls_back_without_context() -> Result<()> {
    init_logging();
    let layers = vec![
        woq_layer(16, 16, 0, false, WoqConfig::int8()),
        f32_layer(16, 16, 1, false).with_woq_config(WoqConfig::int8()),
        woq_layer(16, 16, 2, false, WoqConfig::int8()),
    ];
    let group = ConcatGroup::new(layers)?;
    let reference = ReferenceConcatLinear::new(group.clone());
    let merger = ConcatLinearMerger::new(group, FusionFlags::woq())?;

    assert!(!merger.is_merged());
    assert_eq!(merger.separate_layers().map(|l| l.len()), Some(3));

    let x = random_tensor(&[4, 16]);
    assert_eq!(merger.forward(&x.view())?, reference.forward(&x.view())?);
    Ok(())
}

#[test]
fn test_merger_falls_back_on_unsupported_scheme() -> Result<()> {
    let per_tensor = QuantizedWeight::new(
        PackedWeight::Int8(generate_weights(8, 16, 0).mapv(|v| (v * 100.0) as i8)),
        [8, 16],
        arr1(&[0.01]),
        ZeroPoints::Int(arr1(&[0])),
        QScheme::PerTensorAffine,
        0,
    )?;
    let odd = WoqPacker::new(WoqConfig::int8()).wrap(per_tensor, None, 1);
    let layers = vec![woq_layer(8, 16, 1, false, WoqConfig::int8()), odd];

    let merger = ConcatLinearMerger::new(ConcatGroup::new(layers)?, FusionFlags::woq())?;
    assert!(!merger.is_merged());
    Ok(())
}

#[test]
fn test_merger_falls_back_on_column_axis() -> Result<()> {
    let codes = generate_weights(8, 16, 3).mapv(|v| (v * 100.0) as i8);
    let column_wise = QuantizedWeight::new(
        PackedWeight::Int8(codes),
        [8, 16],
        ndarray::Array1::from_elem(16, 0.01),
        ZeroPoints::Int(ndarray::Array1::from_shape_fn(16, |i| i as i32 % 3 - 1)),
        QScheme::PerChannelAffine,
        1,
    )?;
    let odd = WoqPacker::new(WoqConfig::int8()).wrap(column_wise, None, 1);
    let layers = vec![woq_layer(8, 16, 1, false, WoqConfig::int8()), odd];
    let group = ConcatGroup::new(layers)?;
    let reference = ReferenceConcatLinear::new(group.clone());

    let merger = ConcatLinearMerger::new(group, FusionFlags::woq())?;
    assert!(!merger.is_merged());

    let x = random_tensor(&[3, 16]);
    assert_eq!(merger.forward(&x.view())?, reference.forward(&x.view())?);
    Ok(())
}

#[test]
fn test_merger_without_woq_keeps_layers() -> Result<()> {
    let layers = vec![
        woq_layer(8, 16, 0, false, WoqConfig::int8()),
        woq_layer(8, 16, 1, false, WoqConfig::int8()),
    ];
    let merger = ConcatLinearMerger::new(ConcatGroup::new(layers.clone())?, FusionFlags::tpp())?;
    assert!(!merger.is_merged());

    // Float members never merge, even with woq set.
    let floats = vec![f32_layer(8, 16, 0, false), f32_layer(8, 16, 1, false)];
    let merger = ConcatLinearMerger::new(ConcatGroup::new(floats)?, FusionFlags::woq())?;
    assert!(!merger.is_merged());

    let x = random_tensor(&[2, 16]);
    let outputs = merger.forward(&x.view())?;
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0], f32_layer(8, 16, 0, false).forward(&x.view())?);
    Ok(())
}

#[test]
fn test_merger_rejects_wrong_input_width() -> Result<()> {
    let layers = vec![
        woq_layer(8, 16, 0, false, WoqConfig::int8()),
        woq_layer(8, 16, 1, false, WoqConfig::int8()),
    ];
    let merger = ConcatLinearMerger::new(ConcatGroup::new(layers)?, FusionFlags::woq())?;
    let x = random_tensor(&[2, 12]);
    let err = merger.forward(&x.view()).unwrap_err();
    assert!(matches!(err, FusionError::ShapeMismatch { .. }));
    Ok(())
}

#[test]
fn test_merger_uses_kernel_set() -> Result<()> {
    let kernels = KernelSet::new(Arc::new(CpuTppKernels), Arc::new(FailingWoq));
    let layers = vec![
        woq_layer(8, 16, 0, false, WoqConfig::int8()),
        woq_layer(8, 16, 1, false, WoqConfig::int8()),
    ];
    let merger =
        ConcatLinearMerger::with_kernels(ConcatGroup::new(layers)?, FusionFlags::woq(), kernels)?;
    let x = random_tensor(&[2, 16]);
    assert!(matches!(merger.forward(&x.view()), Err(FusionError::Kernel(_))));

    let cpu = KernelSet::new(Arc::new(CpuTppKernels), Arc::new(CpuWoqKernels));
    assert!(cpu.woq.supports(FusionPattern::Add));
    Ok(())
}
