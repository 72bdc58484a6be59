// Shared helpers for unit tests across the crate.
#![allow(dead_code)]

use ndarray::{Array, Array1, Array2, ArrayD, Dimension, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::linear_layer::LinearLayer;
use crate::quantize::{WoqConfig, WoqPacker};

/// Routes `log` output through the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic pseudo-random values in `[-1, 1)`.
pub fn generate_weights(rows: usize, cols: usize, seed: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        let idx = i * cols + j + seed;
        ((idx * 17 + 13) % 1000) as f32 * 0.002 - 1.0
    })
}

pub fn generate_bias(len: usize, seed: usize) -> Array1<f32> {
    Array1::from_shape_fn(len, |i| ((i * 31 + seed * 7 + 3) % 100) as f32 * 0.01 - 0.5)
}

/// Uniform random tensor in `[-1, 1)` of any shape.
pub fn random_tensor(shape: &[usize]) -> ArrayD<f32> {
    Array::random(IxDyn(shape), Uniform::new(-1.0f32, 1.0))
}

pub fn f32_layer(out_features: usize, in_features: usize, seed: usize, bias: bool) -> LinearLayer {
    let b = bias.then(|| generate_bias(out_features, seed));
    LinearLayer::new_f32(generate_weights(out_features, in_features, seed), b)
}

/// A float layer converted with `config`.
pub fn woq_layer(
    out_features: usize,
    in_features: usize,
    seed: usize,
    bias: bool,
    config: WoqConfig,
) -> LinearLayer {
    let layer = f32_layer(out_features, in_features, seed, bias);
    WoqPacker::new(config).convert(&layer).unwrap()
}

pub fn max_abs_diff<D: Dimension>(a: &Array<f32, D>, b: &Array<f32, D>) -> f32 {
    assert_eq!(a.shape(), b.shape(), "Array shapes do not match");
    a.iter()
        .zip(b.iter())
        .fold(0.0f32, |max, (x, y)| max.max((x - y).abs()))
}

pub fn assert_all_close<D: Dimension>(a: &Array<f32, D>, b: &Array<f32, D>, tolerance: f32) {
    let max_diff = max_abs_diff(a, b);
    assert!(
        max_diff < tolerance,
        "Arrays are not close. Max difference: {}, Tolerance: {}",
        max_diff,
        tolerance
    );
}

/// Compare two slices with relative tolerance
pub fn assert_close(expected: &[f32], actual: &[f32], tolerance: f32, msg: &str) {
    assert_eq!(
        expected.len(),
        actual.len(),
        "{}: length mismatch {} vs {}",
        msg,
        expected.len(),
        actual.len()
    );

    for (i, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
        let diff = (e - a).abs();
        let rel_diff = if e.abs() > 1e-6 { diff / e.abs() } else { diff };

        assert!(
            rel_diff < tolerance || diff < 1e-6,
            "{}: mismatch at index {}: expected {}, got {}, diff={}, rel_diff={}",
            msg,
            i,
            e,
            a,
            diff,
            rel_diff
        );
    }
}
