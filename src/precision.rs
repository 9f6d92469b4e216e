//! Split bfloat16 storage.
//!
//! An f32 is stored as two 16-bit halves: the upper half is a valid `bf16` that the
//! rest of the model can read directly, the lower half (the *trail*) keeps the
//! remaining mantissa bits so the optimizer can recover the exact f32 value.
//!
//! ```text
//!  f32 bits:  [ sign | exponent | mantissa hi ][ mantissa lo ]
//!              \_________ bf16 (stored) _____/ \__ trail ___/
//! ```

use half::bf16;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};

/// Splits an f32 into its bf16 upper half and the trailing 16 bits.
#[inline]
pub fn split(x: f32) -> (bf16, u16) {
    let bits = x.to_bits();
    (bf16::from_bits((bits >> 16) as u16), bits as u16)
}

/// Reassembles the f32 previously split by [`split`].
#[inline]
pub fn combine(high: bf16, low: u16) -> f32 {
    f32::from_bits(((high.to_bits() as u32) << 16) | low as u32)
}

/// Adds `alpha * grad` to a split value, updating both halves.
///
/// # Arguments
/// * `high` - The stored bf16 half.
/// * `low` - The trail half.
/// * `grad` - The value to add.
/// * `alpha` - The scale applied to `grad`.
#[inline]
pub fn packed_add(high: &mut bf16, low: &mut u16, grad: f32, alpha: f32) {
    let full = combine(*high, *low) + alpha * grad;
    (*high, *low) = split(full);
}

/// Splits a whole tensor.
///
/// # Arguments
/// * `full` - The full precision values.
///
/// # Returns
/// The stored bf16 tensor and its trail, both with the shape of `full`.
pub fn split_array(full: ArrayViewD<f32>) -> (ArrayD<bf16>, ArrayD<u16>) {
    let mut stored = ArrayD::from_elem(full.raw_dim(), bf16::ZERO);
    let mut trail = ArrayD::zeros(full.raw_dim());
    split_into(full, stored.view_mut(), trail.view_mut());
    (stored, trail)
}

/// Splits `full` in place into already allocated halves.
///
/// # Panics
/// If the three tensors don't share the same shape.
pub fn split_into(full: ArrayViewD<f32>, stored: ArrayViewMutD<bf16>, trail: ArrayViewMutD<u16>) {
    Zip::from(stored)
        .and(trail)
        .and(full)
        .par_for_each(|h, l, &x| (*h, *l) = split(x));
}

/// Reassembles a whole tensor from its halves.
///
/// # Panics
/// If `stored` and `trail` have different shapes.
pub fn combine_array(stored: ArrayViewD<bf16>, trail: ArrayViewD<u16>) -> ArrayD<f32> {
    Zip::from(stored)
        .and(trail)
        .par_map_collect(|&h, &l| combine(h, l))
}

/// Element-wise [`packed_add`] over whole tensors.
///
/// # Panics
/// If the three tensors don't share the same shape.
pub fn packed_add_array(
    stored: ArrayViewMutD<bf16>,
    trail: ArrayViewMutD<u16>,
    grad: ArrayViewD<f32>,
    alpha: f32,
) {
    Zip::from(stored)
        .and(trail)
        .and(grad)
        .par_for_each(|h, l, &g| packed_add(h, l, g, alpha));
}

/// Rounds every value to the nearest bf16, used to refresh shadow copies.
pub fn round_to_bf16(full: ArrayViewD<f32>, shadow: ArrayViewMutD<bf16>) {
    Zip::from(shadow)
        .and(full)
        .par_for_each(|s, &x| *s = bf16::from_f32(x));
}
