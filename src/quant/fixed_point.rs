//! Fixed-point rescaling
//!
//! A real scale `s` is encoded as `(multiplier, shift)` with
//! `s ≈ multiplier / 2^31 * 2^shift` and `multiplier ∈ [2^30, 2^31)`. Integer
//! kernels rescale accumulators with [`quantized_multiply`] and never touch
//! floating point at run time.

use crate::error::{ShlError, ShlResult};

/// Split `x` into `(frac, exp)` with `x = frac * 2^exp`, `frac ∈ [0.5, 1)`.
/// `x` must be finite and positive.
fn frexp(x: f64) -> (f64, i32) {
    let bits = x.to_bits();
    let exp_bits = ((bits >> 52) & 0x7ff) as i32;
    if exp_bits == 0 {
        // subnormal: scale into the normal range first
        let (frac, exp) = frexp(x * f64::from_bits(0x4350_0000_0000_0000)); // 2^54
        return (frac, exp - 54);
    }
    let frac = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (frac, exp_bits - 1022)
}

/// Encode `scale` as a Q31 multiplier and a power-of-two shift.
///
/// `scale == 0` encodes as `(0, 0)`, as does any scale below `2^-32` that
/// would need a shift under -31. Negative, NaN and infinite scales are
/// rejected.
pub fn quantize_multiplier(scale: f64) -> ShlResult<(i32, i32)> {
    if scale == 0.0 {
        return Ok((0, 0));
    }
    if !scale.is_finite() || scale < 0.0 {
        return Err(ShlError::InvalidScale(scale));
    }
    let (frac, mut shift) = frexp(scale);
    let mut q = (frac * (1i64 << 31) as f64).round() as i64;
    if q == 1i64 << 31 {
        q /= 2;
        shift += 1;
    }
    if shift < -31 {
        return Ok((0, 0));
    }
    Ok((q as i32, shift))
}

/// Real scale represented by `(multiplier, shift)`
pub fn multiplier_to_scale(multiplier: i32, shift: i32) -> f64 {
    multiplier as f64 / (1i64 << 31) as f64 * 2f64.powi(shift)
}

/// `round(a * b / 2^31)`, saturating the single overflow case
/// `i32::MIN * i32::MIN`.
pub fn high_mul_sat_round_double(a: i32, b: i32) -> i32 {
    if a == i32::MIN && b == i32::MIN {
        return i32::MAX;
    }
    let ab = a as i64 * b as i64;
    let nudge: i64 = if ab >= 0 { 1 << 30 } else { 1 - (1 << 30) };
    ((ab + nudge) / (1i64 << 31)) as i32
}

/// Divide by `2^exponent`, rounding half away from zero
pub fn round_div_pot(x: i32, exponent: i32) -> i32 {
    if exponent <= 0 {
        return x;
    }
    let exponent = exponent.min(31);
    let x = x as i64;
    let mask = (1i64 << exponent) - 1;
    let remainder = x & mask;
    let threshold = (mask >> 1) + i64::from(x < 0);
    ((x >> exponent) + i64::from(remainder > threshold)) as i32
}

/// `x * multiplier * 2^shift / 2^31` in integer arithmetic
pub fn quantized_multiply(x: i32, multiplier: i32, shift: i32) -> i32 {
    let left = shift.max(0);
    let right = (-shift).max(0);
    let shifted = (x as i64) << left.min(31);
    let shifted = shifted.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    round_div_pot(high_mul_sat_round_double(shifted, multiplier), right)
}
