//! Typed tensor storage
//!
//! A [`Buffer`] is a tagged vector, one variant per storage type. Kernels
//! reach the elements through the [`Element`] trait instead of casting raw
//! pointers, so a dtype/storage disagreement surfaces as an error.

use super::dtype::DType;
use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Owned tensor data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Buffer {
    Bool(Vec<bool>),
    /// Also holds `Int4`, two values per byte (low nibble first)
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl Buffer {
    /// Zero-filled storage for `numel` elements of `dtype`
    pub fn zeros(dtype: DType, numel: usize) -> Buffer {
        let n = dtype.buffer_len(numel);
        match dtype {
            DType::Bool => Buffer::Bool(vec![false; n]),
            DType::Int4 | DType::Uint8 => Buffer::U8(vec![0; n]),
            DType::Int8 => Buffer::I8(vec![0; n]),
            DType::Uint16 => Buffer::U16(vec![0; n]),
            DType::Int16 => Buffer::I16(vec![0; n]),
            DType::Uint32 => Buffer::U32(vec![0; n]),
            DType::Int32 => Buffer::I32(vec![0; n]),
            DType::Float16 => Buffer::F16(vec![f16::ZERO; n]),
            DType::BFloat16 => Buffer::BF16(vec![bf16::ZERO; n]),
            DType::Float32 => Buffer::F32(vec![0.0; n]),
            DType::Float64 => Buffer::F64(vec![0.0; n]),
            DType::Int64 => Buffer::I64(vec![0; n]),
        }
    }

    /// Number of storage slots
    pub fn len(&self) -> usize {
        match self {
            Buffer::Bool(v) => v.len(),
            Buffer::U8(v) => v.len(),
            Buffer::I8(v) => v.len(),
            Buffer::U16(v) => v.len(),
            Buffer::I16(v) => v.len(),
            Buffer::U32(v) => v.len(),
            Buffer::I32(v) => v.len(),
            Buffer::F16(v) => v.len(),
            Buffer::BF16(v) => v.len(),
            Buffer::F32(v) => v.len(),
            Buffer::F64(v) => v.len(),
            Buffer::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when this storage variant can back a tensor of `dtype`
    pub fn matches(&self, dtype: DType) -> bool {
        matches!(
            (self, dtype),
            (Buffer::Bool(_), DType::Bool)
                | (Buffer::U8(_), DType::Uint8)
                | (Buffer::U8(_), DType::Int4)
                | (Buffer::I8(_), DType::Int8)
                | (Buffer::U16(_), DType::Uint16)
                | (Buffer::I16(_), DType::Int16)
                | (Buffer::U32(_), DType::Uint32)
                | (Buffer::I32(_), DType::Int32)
                | (Buffer::F16(_), DType::Float16)
                | (Buffer::BF16(_), DType::BFloat16)
                | (Buffer::F32(_), DType::Float32)
                | (Buffer::F64(_), DType::Float64)
                | (Buffer::I64(_), DType::Int64)
        )
    }

    /// Natural dtype of the storage variant (`U8` reports `Uint8`)
    pub fn dtype(&self) -> DType {
        match self {
            Buffer::Bool(_) => DType::Bool,
            Buffer::U8(_) => DType::Uint8,
            Buffer::I8(_) => DType::Int8,
            Buffer::U16(_) => DType::Uint16,
            Buffer::I16(_) => DType::Int16,
            Buffer::U32(_) => DType::Uint32,
            Buffer::I32(_) => DType::Int32,
            Buffer::F16(_) => DType::Float16,
            Buffer::BF16(_) => DType::BFloat16,
            Buffer::F32(_) => DType::Float32,
            Buffer::F64(_) => DType::Float64,
            Buffer::I64(_) => DType::Int64,
        }
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        T::slice_mut(self)
    }
}

/// Scalar types that have a [`Buffer`] variant
pub trait Element: Copy + Default + Send + Sync + std::fmt::Debug + 'static {
    const DTYPE: DType;

    fn slice(buf: &Buffer) -> Option<&[Self]>;
    fn slice_mut(buf: &mut Buffer) -> Option<&mut [Self]>;
    fn into_buffer(values: Vec<Self>) -> Buffer;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn slice(buf: &Buffer) -> Option<&[Self]> {
                match buf {
                    Buffer::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn slice_mut(buf: &mut Buffer) -> Option<&mut [Self]> {
                match buf {
                    Buffer::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }

            fn into_buffer(values: Vec<Self>) -> Buffer {
                Buffer::$variant(values)
            }
        }
    };
}

impl_element!(bool, Bool, DType::Bool);
impl_element!(u8, U8, DType::Uint8);
impl_element!(i8, I8, DType::Int8);
impl_element!(u16, U16, DType::Uint16);
impl_element!(i16, I16, DType::Int16);
impl_element!(u32, U32, DType::Uint32);
impl_element!(i32, I32, DType::Int32);
impl_element!(f16, F16, DType::Float16);
impl_element!(bf16, BF16, DType::BFloat16);
impl_element!(f32, F32, DType::Float32);
impl_element!(f64, F64, DType::Float64);
impl_element!(i64, I64, DType::Int64);

/// Unpack signed 4-bit values, low nibble first
pub fn unpack_int4(packed: &[u8], numel: usize) -> Vec<i8> {
    (0..numel)
        .map(|i| {
            let byte = packed[i / 2];
            let nibble = if i % 2 == 0 { byte & 0x0f } else { byte >> 4 };
            // sign-extend from bit 3
            ((nibble << 4) as i8) >> 4
        })
        .collect()
}

/// Pack signed 4-bit values, low nibble first; inputs are clamped to [-8, 7]
pub fn pack_int4(values: &[i8]) -> Vec<u8> {
    let mut out = vec![0u8; values.len().div_ceil(2)];
    for (i, &v) in values.iter().enumerate() {
        let nibble = (v.clamp(-8, 7) as u8) & 0x0f;
        if i % 2 == 0 {
            out[i / 2] |= nibble;
        } else {
            out[i / 2] |= nibble << 4;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_matches_dtype() {
        for d in DType::ALL {
            let b = Buffer::zeros(d, 5);
            assert!(b.matches(d), "{}", d);
            assert_eq!(b.len(), d.buffer_len(5));
        }
    }

    #[test]
    fn test_typed_access() {
        let mut b = f32::into_buffer(vec![1.0, 2.0]);
        assert_eq!(b.as_slice::<f32>(), Some(&[1.0f32, 2.0][..]));
        assert!(b.as_slice::<i8>().is_none());
        b.as_mut_slice::<f32>().unwrap()[1] = 4.0;
        assert_eq!(b, Buffer::F32(vec![1.0, 4.0]));
    }

    #[test]
    fn test_int4_packing() {
        let values = vec![-8, -1, 0, 7, 3];
        let packed = pack_int4(&values);
        assert_eq!(packed.len(), 3);
        assert_eq!(unpack_int4(&packed, values.len()), values);
    }
}
