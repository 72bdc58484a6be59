//! 4-bit code packing.
//!
//! Each row of `cols` codes is stored in `ceil(cols / 2)` bytes. Even columns
//! occupy the low nibble, odd columns the high nibble. An odd trailing column
//! leaves the high nibble of the last byte zero.

use ndarray::{Array2, ArrayView2};

/// Number of bytes needed to store one row of `cols` 4-bit codes.
#[inline]
pub fn packed_row_bytes(cols: usize) -> usize {
    cols.div_ceil(2)
}

/// Packs 4-bit codes (`0..=15`) two per byte.
///
/// Codes above 15 are masked to their low nibble; callers clamp before packing.
pub fn pack_nibbles(codes: &ArrayView2<u8>) -> Array2<u8> {
    let (rows, cols) = codes.dim();
    let row_bytes = packed_row_bytes(cols);
    let mut packed = Array2::<u8>::zeros((rows, row_bytes));

    for (src, mut dst) in codes.outer_iter().zip(packed.outer_iter_mut()) {
        for (j, &code) in src.iter().enumerate() {
            let nibble = code & 0x0F;
            if j % 2 == 0 {
                dst[j / 2] |= nibble;
            } else {
                dst[j / 2] |= nibble << 4;
            }
        }
    }
    packed
}

/// Unpacks one packed row into `out`, which must hold the logical column count.
#[inline]
pub fn unpack_row_into(packed_row: &[u8], out: &mut [u8]) {
    for (j, slot) in out.iter_mut().enumerate() {
        let byte = packed_row[j / 2];
        *slot = if j % 2 == 0 { byte & 0x0F } else { byte >> 4 };
    }
}

/// Inverse of [`pack_nibbles`].
pub fn unpack_nibbles(packed: &ArrayView2<u8>, cols: usize) -> Array2<u8> {
    let rows = packed.nrows();
    let mut codes = Array2::<u8>::zeros((rows, cols));
    for (src, mut dst) in packed.outer_iter().zip(codes.outer_iter_mut()) {
        let src = src.to_vec();
        if let Some(out) = dst.as_slice_mut() {
            unpack_row_into(&src, out);
        }
    }
    codes
}
