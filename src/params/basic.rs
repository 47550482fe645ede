//! Parameters of the non-convolution operator set

use super::ParamsBase;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// 2-D pooling window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolParams {
    pub base: ParamsBase,
    pub filter_height: usize,
    pub filter_width: usize,
    pub stride_height: usize,
    pub stride_width: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub pad_down: usize,
    pub pad_right: usize,
    /// Average pooling divides by the full window, padding included
    pub count_include_pad: bool,
}

impl Default for PoolParams {
    fn default() -> Self {
        PoolParams {
            base: ParamsBase::default(),
            filter_height: 1,
            filter_width: 1,
            stride_height: 1,
            stride_width: 1,
            pad_top: 0,
            pad_left: 0,
            pad_down: 0,
            pad_right: 0,
            count_include_pad: false,
        }
    }
}

impl PoolParams {
    pub fn window(kh: usize, kw: usize, sh: usize, sw: usize) -> Self {
        PoolParams {
            filter_height: kh,
            filter_width: kw,
            stride_height: sh,
            stride_width: sw,
            ..PoolParams::default()
        }
    }

    pub fn with_pad(mut self, top: usize, left: usize, down: usize, right: usize) -> Self {
        self.pad_top = top;
        self.pad_left = left;
        self.pad_down = down;
        self.pad_right = right;
        self
    }
}

/// Reduction over a set of axes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReduceParams {
    pub base: ParamsBase,
    /// Negative values count from the last axis
    pub axis: Vec<i32>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PadMode {
    #[default]
    Constant,
    Edge,
}

/// Per-axis padding
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PadParams {
    pub base: ParamsBase,
    pub pad_before: Vec<usize>,
    pub pad_after: Vec<usize>,
    pub pad_value: f32,
    pub pad_mode: PadMode,
}

/// Reshape and flatten take the output shape from the output tensor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReshapeParams {
    pub base: ParamsBase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransposeParams {
    pub base: ParamsBase,
    pub permute: Vec<usize>,
}

/// Single-input elementwise operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SisoParams {
    pub base: ParamsBase,
    /// Upper bound for relun and clip
    pub max_value: f32,
    /// Lower bound for clip
    pub min_value: f32,
    /// Negative slope for leaky relu
    pub alpha: f32,
}

impl Default for SisoParams {
    fn default() -> Self {
        SisoParams {
            base: ParamsBase::default(),
            max_value: f32::MAX,
            min_value: f32::MIN,
            alpha: 0.01,
        }
    }
}

/// Two-input elementwise operators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisoParams {
    pub base: ParamsBase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftmaxParams {
    pub base: ParamsBase,
    pub axis: i32,
}

impl Default for SoftmaxParams {
    fn default() -> Self {
        SoftmaxParams {
            base: ParamsBase::default(),
            axis: -1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FcParams {
    pub base: ParamsBase,
    pub units: usize,
    /// Weights packed for the GEMM kernel at init
    #[serde(skip)]
    pub weights_tm: Option<Tensor>,
}

/// Segment reductions over axis 0
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentParams {
    pub base: ParamsBase,
    pub num_segments: usize,
}
