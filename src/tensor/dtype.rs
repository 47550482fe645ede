//! Element type, quantization scheme and memory-type tags

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element type of a tensor buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int4,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float16,
    BFloat16,
    #[default]
    Float32,
    Float64,
    Int64,
}

impl DType {
    pub const ALL: [DType; 13] = [
        DType::Bool,
        DType::Int4,
        DType::Uint8,
        DType::Int8,
        DType::Uint16,
        DType::Int16,
        DType::Uint32,
        DType::Int32,
        DType::Float16,
        DType::BFloat16,
        DType::Float32,
        DType::Float64,
        DType::Int64,
    ];

    /// Storage bytes per element. `Int4` reports 1; packed buffers hold
    /// two values per byte, see [`DType::buffer_len`].
    pub fn element_bytes(self) -> usize {
        match self {
            DType::Bool | DType::Int4 | DType::Uint8 | DType::Int8 => 1,
            DType::Uint16 | DType::Int16 | DType::Float16 | DType::BFloat16 => 2,
            DType::Uint32 | DType::Int32 | DType::Float32 => 4,
            DType::Float64 | DType::Int64 => 8,
        }
    }

    /// Number of storage slots needed for `numel` elements
    pub fn buffer_len(self, numel: usize) -> usize {
        match self {
            DType::Int4 => numel.div_ceil(2),
            _ => numel,
        }
    }

    /// Integer activation types that carry affine quantization info
    pub fn is_quantized(self) -> bool {
        matches!(
            self,
            DType::Int4 | DType::Uint8 | DType::Int8 | DType::Uint16 | DType::Int16
        )
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            DType::Float16 | DType::BFloat16 | DType::Float32 | DType::Float64
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int4 => "int4",
            DType::Uint8 => "uint8",
            DType::Int8 => "int8",
            DType::Uint16 => "uint16",
            DType::Int16 => "int16",
            DType::Uint32 => "uint32",
            DType::Int32 => "int32",
            DType::Float16 => "float16",
            DType::BFloat16 => "bfloat16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Int64 => "int64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        let alias = match lower.as_str() {
            "f32" | "fp32" => "float32",
            "f16" | "fp16" => "float16",
            "bf16" => "bfloat16",
            "f64" | "fp64" => "float64",
            "u8" => "uint8",
            "i8" => "int8",
            "i16" => "int16",
            "i32" => "int32",
            other => other,
        };
        DType::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == alias)
            .ok_or_else(|| format!("unknown dtype: {}", s))
    }
}

/// Quantization scheme selected for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantType {
    #[default]
    Unset,
    Int4Sym,
    Uint8Asym,
    Uint8Sym,
    Int8Asym,
    Int8Sym,
    Int16Sym,
    Float16,
    BFloat16,
    Float32,
    /// Asymmetric activations with symmetric weights
    Int8AsymWSym,
}

impl QuantType {
    /// Activation dtype implied by the scheme, if any
    pub fn dtype(self) -> Option<DType> {
        match self {
            QuantType::Unset => None,
            QuantType::Int4Sym => Some(DType::Int4),
            QuantType::Uint8Asym | QuantType::Uint8Sym => Some(DType::Uint8),
            QuantType::Int8Asym | QuantType::Int8Sym | QuantType::Int8AsymWSym => {
                Some(DType::Int8)
            }
            QuantType::Int16Sym => Some(DType::Int16),
            QuantType::Float16 => Some(DType::Float16),
            QuantType::BFloat16 => Some(DType::BFloat16),
            QuantType::Float32 => Some(DType::Float32),
        }
    }

    pub fn is_symmetric(self) -> bool {
        matches!(
            self,
            QuantType::Int4Sym | QuantType::Uint8Sym | QuantType::Int8Sym | QuantType::Int16Sym
        )
    }
}

impl FromStr for QuantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
            .map_err(|_| format!("unknown quant type: {}", s))
    }
}

/// Where a tensor buffer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemType {
    #[default]
    CpuNotAligned,
    CpuAligned,
    DmaBuf,
}
