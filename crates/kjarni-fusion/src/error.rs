//! Error types for fused linear dispatch and weight-only quantization.

use thiserror::Error;

use crate::tensor::DType;

/// Errors that can occur while building or running fused linear operators.
#[derive(Debug, Error)]
pub enum FusionError {
    /// Operand shapes are incompatible with the pattern arity or the layer's feature counts.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// A quantized weight uses a scheme, channel axis or zero-point type that cannot be
    /// concatenated or packed.
    #[error("Unsupported quantization scheme: {0}")]
    UnsupportedQuantizationScheme(String),

    /// A layer claims weight-only quantization but holds no quantized execution context.
    #[error("Layer {layer} is marked for weight-only quantization but has no quantized context")]
    MissingQuantizationContext { layer: usize },

    /// The element type is not valid for the requested operation.
    #[error("Unsupported dtype {dtype:?} for {operation}")]
    UnsupportedDType { dtype: DType, operation: String },

    /// The pattern cannot be executed by the requested component.
    #[error("Unsupported fusion pattern: {0}")]
    UnsupportedPattern(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An ndarray reshape failed.
    #[error("Layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),

    /// An opaque kernel failed.
    #[error("Kernel failed: {0}")]
    Kernel(#[from] anyhow::Error),
}

impl FusionError {
    /// Shorthand for building a [`FusionError::ShapeMismatch`].
    pub fn shape(
        context: impl Into<String>,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        FusionError::ShapeMismatch {
            context: context.into(),
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }

    /// Returns `true` for errors the concat merger recovers from by keeping separate layers.
    pub fn is_recoverable_merge_failure(&self) -> bool {
        matches!(
            self,
            FusionError::UnsupportedQuantizationScheme(_)
                | FusionError::MissingQuantizationContext { .. }
        )
    }
}

/// Result type for fusion operations.
pub type FusionResult<T> = Result<T, FusionError>;
