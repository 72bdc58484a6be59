//! The linear layer every fused operator wraps.

#[allow(clippy::module_inception)]
mod linear_layer;

pub use linear_layer::{LinearData, LinearLayer, WoqContext};
