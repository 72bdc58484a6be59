//! Weight-only quantization: configuration, calibration, packing.
//!
//! Supported formats (both per output channel, axis 0):
//!
//! | Weight dtype | Codes        | Zero points | Storage              |
//! |--------------|--------------|-------------|----------------------|
//! | `QInt8`      | `[-128,127]` | integer     | `[out, in]` i8       |
//! | `QUInt4x2`   | `[0,15]`     | float       | `[out, ceil(in/2)]` u8 |

pub mod config;
pub mod int4;
pub mod observer;
pub mod packer;
pub mod qweight;

pub use config::{WoqConfig, WoqLowpMode, WoqWeightDType};
pub use observer::PerChannelMinMaxObserver;
pub use packer::WoqPacker;
pub use qweight::{PackedWeight, QParams, QScheme, QuantizedWeight, ZeroPoints};
