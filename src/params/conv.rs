//! Convolution parameters

use super::ParamsBase;
use crate::error::{ShlError, ShlResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Convolution algorithm chosen at init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum ConvMode {
    #[default]
    Direct = 0,
    Winograd = 1,
    Gemm = 2,
}

/// Output tile of the float Winograd path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinogradTile {
    /// F(6x6, 3x3), 8x8 input tiles
    #[default]
    F63,
    /// F(4x4, 3x3), 6x6 input tiles
    F43,
}

impl WinogradTile {
    /// Output pixels per tile side
    pub fn output_size(self) -> usize {
        match self {
            WinogradTile::F63 => 6,
            WinogradTile::F43 => 4,
        }
    }
}

/// Per-algorithm state attached to a convolution at init
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvExtra {
    /// Kernel transformed or packed for the selected algorithm. Written once
    /// at init, read-only afterwards.
    #[serde(skip)]
    pub kernel_tm: Option<Tensor>,
    pub conv_mode: ConvMode,
    /// Input zero point folded into the bias at init (int8 paths)
    pub fuse_zp2bias: bool,
    /// Bias with folded zero point, one i32 per output channel
    #[serde(skip)]
    pub bias_tm: Option<Vec<i32>>,
    /// Per-output-channel `(multiplier, shift)` for integer requantization
    #[serde(skip)]
    pub requant: Vec<(i32, i32)>,
}

/// 2-D convolution, depthwise and grouped variants included
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2dParams {
    pub base: ParamsBase,
    pub group: usize,
    pub stride_height: usize,
    pub stride_width: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub pad_down: usize,
    pub pad_right: usize,
    pub dilation_height: usize,
    pub dilation_width: usize,
    pub out_pad_height: usize,
    pub out_pad_width: usize,
    /// Tile preference for float Winograd; int8 always uses F(4x4, 3x3)
    #[serde(default)]
    pub winograd_tile: WinogradTile,
    pub conv_extra: ConvExtra,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Conv2dParams {
            base: ParamsBase::default(),
            group: 1,
            stride_height: 1,
            stride_width: 1,
            pad_top: 0,
            pad_left: 0,
            pad_down: 0,
            pad_right: 0,
            dilation_height: 1,
            dilation_width: 1,
            out_pad_height: 0,
            out_pad_width: 0,
            winograd_tile: WinogradTile::default(),
            conv_extra: ConvExtra::default(),
        }
    }
}

impl Conv2dParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stride(mut self, h: usize, w: usize) -> Self {
        self.stride_height = h;
        self.stride_width = w;
        self
    }

    /// Padding as (top, left, down, right)
    pub fn with_pad(mut self, top: usize, left: usize, down: usize, right: usize) -> Self {
        self.pad_top = top;
        self.pad_left = left;
        self.pad_down = down;
        self.pad_right = right;
        self
    }

    pub fn with_dilation(mut self, h: usize, w: usize) -> Self {
        self.dilation_height = h;
        self.dilation_width = w;
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn with_winograd_tile(mut self, tile: WinogradTile) -> Self {
        self.winograd_tile = tile;
        self
    }

    /// Spatial output size for an input of `(in_h, in_w)` and a kernel of
    /// `(kh, kw)`
    pub fn output_hw(&self, in_h: usize, in_w: usize, kh: usize, kw: usize) -> ShlResult<(usize, usize)> {
        let out_h = conv_out_dim(
            in_h,
            kh,
            self.stride_height,
            self.pad_top + self.pad_down,
            self.dilation_height,
        )?;
        let out_w = conv_out_dim(
            in_w,
            kw,
            self.stride_width,
            self.pad_left + self.pad_right,
            self.dilation_width,
        )?;
        Ok((out_h, out_w))
    }
}

/// `(in + pad - dilation * (k - 1) - 1) / stride + 1`
pub fn conv_out_dim(input: usize, k: usize, stride: usize, pad: usize, dilation: usize) -> ShlResult<usize> {
    if stride == 0 || dilation == 0 || k == 0 {
        return Err(ShlError::InvalidParam(format!(
            "stride {}, dilation {} and kernel {} must be positive",
            stride, dilation, k
        )));
    }
    let extent = dilation * (k - 1) + 1;
    if input + pad < extent {
        return Err(ShlError::InvalidShape(format!(
            "kernel extent {} exceeds padded input {}",
            extent,
            input + pad
        )));
    }
    Ok((input + pad - extent) / stride + 1)
}
