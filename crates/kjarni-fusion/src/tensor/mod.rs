//! Element types and small tensor helpers shared by the CPU kernels.

pub mod dtype;

pub use dtype::DType;

use ndarray::{Array2, ArrayD, ArrayViewD, CowArray, Ix2, IxDyn};

use crate::error::{FusionError, FusionResult};

/// Views an `[..., features]` tensor as `[rows, features]`.
///
/// Standard-layout inputs are reshaped without copying; anything else is
/// gathered into a fresh contiguous buffer. Returns the leading dimensions so
/// the caller can restore the original rank.
pub fn flatten_leading<'a>(
    input: &ArrayViewD<'a, f32>,
    features: usize,
    context: &str,
) -> FusionResult<(CowArray<'a, f32, Ix2>, Vec<usize>)> {
    let shape = input.shape();
    if shape.last() != Some(&features) {
        return Err(FusionError::shape(
            context,
            format!("[.., {}]", features),
            shape,
        ));
    }
    let leading = shape[..shape.len() - 1].to_vec();
    let rows = leading.iter().product::<usize>();

    let flat = if input.is_standard_layout() {
        CowArray::from(input.clone().into_shape_with_order((rows, features))?)
    } else {
        CowArray::from(Array2::from_shape_vec(
            (rows, features),
            input.iter().copied().collect(),
        )?)
    };
    Ok((flat, leading))
}

/// Restores `[rows, features]` back to `[*leading, features]`.
pub fn restore_leading(output: Array2<f32>, leading: &[usize]) -> FusionResult<ArrayD<f32>> {
    let mut shape = leading.to_vec();
    shape.push(output.ncols());
    let output = output.as_standard_layout().into_owned();
    Ok(output.into_shape_with_order(IxDyn(&shape))?)
}
