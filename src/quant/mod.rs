//! Affine quantization codec
//!
//! `real = scale * (q - zero_point)`. Conversions saturate to the integer
//! range of the destination type and round half away from zero.

pub mod fixed_point;

pub use fixed_point::{
    high_mul_sat_round_double, multiplier_to_scale, quantize_multiplier, quantized_multiply,
    round_div_pot,
};

use crate::error::{ShlError, ShlResult};
use crate::tensor::{Buffer, DType, Element, Tensor};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Quantization record for one tensor or one output channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantInfo {
    pub zero_point: i32,
    pub scale: f32,
    pub multiplier: i32,
    pub shift: i32,
    pub min: f32,
    pub max: f32,
}

impl Default for QuantInfo {
    fn default() -> Self {
        QuantInfo {
            zero_point: 0,
            scale: 1.0,
            multiplier: 0,
            shift: 0,
            min: 0.0,
            max: 0.0,
        }
    }
}

impl QuantInfo {
    pub fn new(scale: f32, zero_point: i32) -> Self {
        QuantInfo {
            scale,
            zero_point,
            ..QuantInfo::default()
        }
    }

    /// Fill `multiplier`/`shift` from `scale`
    pub fn with_multiplier(mut self) -> ShlResult<Self> {
        let (m, s) = quantize_multiplier(self.scale as f64)?;
        self.multiplier = m;
        self.shift = s;
        Ok(self)
    }

    /// Asymmetric uint8 parameters covering `data`
    pub fn from_data_u8(data: &[f32]) -> ShlResult<Self> {
        let (min, max) = find_min_max(data);
        let (scale, zero_point) = scale_zp_u8(min, max);
        QuantInfo {
            zero_point,
            scale,
            min,
            max,
            ..QuantInfo::default()
        }
        .with_multiplier()
    }

    /// Symmetric int8 parameters covering `data`
    pub fn from_data_i8(data: &[f32]) -> ShlResult<Self> {
        let (min, max) = find_min_max(data);
        let (scale, zero_point) = scale_zp_i8(min, max);
        QuantInfo {
            zero_point,
            scale,
            min,
            max,
            ..QuantInfo::default()
        }
        .with_multiplier()
    }
}

/// Integer element types that can hold quantized values
pub trait QuantElement: Element {
    const MIN: i64;
    const MAX: i64;

    fn to_i32(self) -> i32;
    fn from_i64_saturating(v: i64) -> Self;
}

macro_rules! impl_quant_element {
    ($ty:ty) => {
        impl QuantElement for $ty {
            const MIN: i64 = <$ty>::MIN as i64;
            const MAX: i64 = <$ty>::MAX as i64;

            fn to_i32(self) -> i32 {
                self as i32
            }

            fn from_i64_saturating(v: i64) -> Self {
                // inherent `MIN`/`MAX` would shadow the trait constants
                v.clamp(<Self as QuantElement>::MIN, <Self as QuantElement>::MAX) as $ty
            }
        }
    };
}

impl_quant_element!(u8);
impl_quant_element!(i8);
impl_quant_element!(u16);
impl_quant_element!(i16);
impl_quant_element!(i32);

/// `round(x / scale) + zero_point`, saturated to `T`
pub fn quantize<T: QuantElement>(x: f32, zero_point: i32, scale: f32) -> T {
    let q = (x / scale).round() as i64 + zero_point as i64;
    T::from_i64_saturating(q)
}

/// `(q - zero_point) * scale`
pub fn dequantize<T: QuantElement>(q: T, zero_point: i32, scale: f32) -> f32 {
    (q.to_i32() as i64 - zero_point as i64) as f32 * scale
}

/// Rescale an i32 accumulator into `T` with output zero point `zp`
pub fn requantize<T: QuantElement>(acc: i32, multiplier: i32, shift: i32, zp: i32) -> T {
    T::from_i64_saturating(quantized_multiply(acc, multiplier, shift) as i64 + zp as i64)
}

/// `(min, max)` of `data`; `(0, 0)` for an empty slice
pub fn find_min_max(data: &[f32]) -> (f32, f32) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    data.iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Asymmetric uint8 scale/zero-point. The range is widened to include 0.
pub fn scale_zp_u8(min: f32, max: f32) -> (f32, i32) {
    let max = max.max(0.0);
    let min = min.min(0.0);
    let scale = (max - min) / 255.0;
    if scale == 0.0 {
        return (1.0, 0);
    }
    let zp = (-min / scale).round().clamp(0.0, 255.0) as i32;
    (scale, zp)
}

/// Symmetric int8 scale, zero point 0
pub fn scale_zp_i8(min: f32, max: f32) -> (f32, i32) {
    let abs_max = min.abs().max(max.abs());
    let scale = abs_max / 127.0;
    if scale == 0.0 {
        return (1.0, 0);
    }
    (scale, 0)
}

fn quantize_slice<T: QuantElement>(src: &[f32], t: &Tensor) -> Vec<T> {
    let inner = (src.len() / t.quant_channel().max(1)).max(1);
    src.iter()
        .enumerate()
        .map(|(i, &v)| {
            let q = t.qinfo_for(i / inner);
            quantize::<T>(v, q.zero_point, q.scale)
        })
        .collect()
}

fn dequantize_slice<T: QuantElement>(src: &[T], t: &Tensor) -> Vec<f32> {
    let inner = (src.len() / t.quant_channel().max(1)).max(1);
    src.iter()
        .enumerate()
        .map(|(i, &v)| {
            let q = t.qinfo_for(i / inner);
            dequantize(v, q.zero_point, q.scale)
        })
        .collect()
}

/// Real values of `t`, dequantizing integer types with its qinfo.
///
/// Per-channel records apply along axis 0.
pub fn to_f32_vec(t: &Tensor) -> ShlResult<Vec<f32>> {
    let out = match t.dtype {
        DType::Float32 => t.data::<f32>()?.to_vec(),
        DType::Float64 => t.data::<f64>()?.iter().map(|&v| v as f32).collect(),
        DType::Float16 => t.data::<f16>()?.iter().map(|v| v.to_f32()).collect(),
        DType::BFloat16 => t.data::<bf16>()?.iter().map(|v| v.to_f32()).collect(),
        DType::Uint8 => dequantize_slice(t.data::<u8>()?, t),
        DType::Int8 => dequantize_slice(t.data::<i8>()?, t),
        DType::Uint16 => dequantize_slice(t.data::<u16>()?, t),
        DType::Int16 => dequantize_slice(t.data::<i16>()?, t),
        DType::Int32 => dequantize_slice(t.data::<i32>()?, t),
        other => return Err(ShlError::unsupported_dtype("data_convert", "ref", other)),
    };
    Ok(out)
}

/// Store real `values` into `t`, quantizing with its qinfo
pub fn store_f32(t: &mut Tensor, values: &[f32]) -> ShlResult<()> {
    if values.len() != t.size() {
        return Err(ShlError::BufferSizeMismatch {
            expected: t.size(),
            actual: values.len(),
        });
    }
    let buffer = match t.dtype {
        DType::Float32 => Buffer::F32(values.to_vec()),
        DType::Float64 => Buffer::F64(values.iter().map(|&v| v as f64).collect()),
        DType::Float16 => Buffer::F16(values.iter().map(|&v| f16::from_f32(v)).collect()),
        DType::BFloat16 => Buffer::BF16(values.iter().map(|&v| bf16::from_f32(v)).collect()),
        DType::Uint8 => Buffer::U8(quantize_slice(values, t)),
        DType::Int8 => Buffer::I8(quantize_slice(values, t)),
        DType::Uint16 => Buffer::U16(quantize_slice(values, t)),
        DType::Int16 => Buffer::I16(quantize_slice(values, t)),
        DType::Int32 => Buffer::I32(quantize_slice(values, t)),
        other => return Err(ShlError::unsupported_dtype("data_convert", "ref", other)),
    };
    t.data = Some(buffer);
    Ok(())
}

/// Convert `src` data into `dest`'s dtype and quantization.
///
/// Shapes must hold the same number of elements. Identical dtypes with
/// identical qinfo copy the buffer unchanged.
pub fn data_convert(dest: &mut Tensor, src: &Tensor) -> ShlResult<()> {
    if dest.size() != src.size() {
        return Err(ShlError::BufferSizeMismatch {
            expected: dest.size(),
            actual: src.size(),
        });
    }
    if dest.dtype == src.dtype && (dest.dtype.is_float() || dest.qinfo == src.qinfo) {
        dest.data = src.data.clone();
        return Ok(());
    }
    let values = to_f32_vec(src)?;
    store_f32(dest, &values)
}
