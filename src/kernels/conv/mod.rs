//! Optimized convolution family
//!
//! [`ConvInit`] runs at `conv2d_init` time for the vector backends. It picks
//! an algorithm for the geometry ([`select_strategy`]), transforms or packs
//! the kernel once into `conv_extra`, and returns the kernel that runs it.
//! Geometries no specialized kernel covers fall back to the direct
//! reference convolution.

pub mod depthwise;
pub mod im2col;
pub mod winograd;

use crate::backend::{Api, VectorProfile};
use crate::error::ShlResult;
use crate::kernels::reference::conv::DirectConv;
use crate::kernels::{arg, opt_arg};
use crate::ops::conv::{conv_layout, ConvGeometry};
use crate::ops::OpKind;
use crate::params::{ConvMode, OpParams, WinogradTile};
use crate::registry::{Kernel, KernelInit, Registry};
use crate::tensor::{DType, Layout, Tensor};
use half::f16;
use std::fmt;
use std::sync::Arc;

/// Algorithm chosen for one convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStrategy {
    /// Reference sliding window
    Direct,
    /// 1x1 stride-1: the input already is the GEMM operand
    Gemm1x1,
    Im2colGemm,
    Winograd(WinogradTile),
    /// Integer-scaled F(4x4, 3x3)
    WinogradInt8,
    /// 3x3 depthwise, stride 1 or 2
    Depthwise3x3,
}

impl ConvStrategy {
    pub fn conv_mode(self) -> ConvMode {
        match self {
            ConvStrategy::Direct | ConvStrategy::Depthwise3x3 => ConvMode::Direct,
            ConvStrategy::Gemm1x1 | ConvStrategy::Im2colGemm => ConvMode::Gemm,
            ConvStrategy::Winograd(_) | ConvStrategy::WinogradInt8 => ConvMode::Winograd,
        }
    }
}

impl fmt::Display for ConvStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvStrategy::Direct => f.write_str("direct"),
            ConvStrategy::Gemm1x1 => f.write_str("conv1x1s1_gemm"),
            ConvStrategy::Im2colGemm => f.write_str("im2col_gemm"),
            ConvStrategy::Winograd(WinogradTile::F63) => f.write_str("winograd_f63"),
            ConvStrategy::Winograd(WinogradTile::F43) => f.write_str("winograd_f43"),
            ConvStrategy::WinogradInt8 => f.write_str("winograd_f43_int8"),
            ConvStrategy::Depthwise3x3 => f.write_str("depthwise3x3"),
        }
    }
}

/// Everything strategy selection looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub dtype: DType,
    pub layout: Layout,
    pub group: usize,
    pub in_c: usize,
    pub out_c: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
    pub zero_pad: bool,
    /// Input, kernel and output share a dtype the packed kernels handle
    pub uniform_dtype: bool,
    /// Every weight zero point is 0
    pub symmetric_weights: bool,
}

impl ConvShape {
    pub fn from_tensors(input: &Tensor, kernel: &Tensor, output: &Tensor, params: &OpParams) -> ShlResult<Self> {
        let p = params.as_conv2d()?;
        let layout = conv_layout(input, params);
        let g = ConvGeometry::from_tensors(input, kernel, output, layout)?;
        let uniform_dtype = match input.dtype {
            DType::Float32 | DType::Float16 => kernel.dtype.is_float() && output.dtype == input.dtype,
            DType::Int8 => kernel.dtype == DType::Int8 && output.dtype == DType::Int8,
            _ => false,
        };
        Ok(ConvShape {
            dtype: input.dtype,
            layout,
            group: p.group,
            in_c: g.in_c,
            out_c: g.out_c,
            kernel: (g.kernel_h, g.kernel_w),
            stride: (p.stride_height, p.stride_width),
            dilation: (p.dilation_height, p.dilation_width),
            zero_pad: p.pad_top + p.pad_left + p.pad_down + p.pad_right == 0,
            uniform_dtype,
            symmetric_weights: kernel.qinfo.iter().all(|q| q.zero_point == 0),
        })
    }

    fn is_depthwise(&self) -> bool {
        self.group > 1 && self.group == self.in_c && self.group == self.out_c
    }
}

/// Pick the convolution algorithm for `shape`.
///
/// `packn` is the packed lane count for the dtype, `tile` the float
/// Winograd preference.
pub fn select_strategy(shape: &ConvShape, packn: usize, tile: WinogradTile) -> ConvStrategy {
    if shape.layout == Layout::NHWC || shape.dilation != (1, 1) || !shape.uniform_dtype {
        return ConvStrategy::Direct;
    }
    if shape.dtype == DType::Int8 && !shape.symmetric_weights {
        return ConvStrategy::Direct;
    }
    if shape.is_depthwise() {
        return match (shape.kernel, shape.stride) {
            ((3, 3), (1, 1)) | ((3, 3), (2, 2)) => ConvStrategy::Depthwise3x3,
            _ => ConvStrategy::Direct,
        };
    }
    match (shape.kernel, shape.stride) {
        ((1, 1), (1, 1)) if shape.zero_pad => ConvStrategy::Gemm1x1,
        ((3, 3), (1, 1)) => {
            let packn = packn.max(1);
            if shape.group > 1 || shape.in_c % packn != 0 || shape.out_c % packn != 0 {
                ConvStrategy::Im2colGemm
            } else if shape.dtype == DType::Int8 {
                ConvStrategy::WinogradInt8
            } else {
                ConvStrategy::Winograd(tile)
            }
        }
        _ => ConvStrategy::Im2colGemm,
    }
}

/// Init function of the optimized convolution family
#[derive(Debug, Clone, Copy)]
pub struct ConvInit {
    pub api: Api,
    pub profile: VectorProfile,
}

impl ConvInit {
    fn build(
        &self,
        strategy: ConvStrategy,
        input: &Tensor,
        kernel: &Tensor,
        bias: Option<&Tensor>,
        output: &Tensor,
        params: &mut OpParams,
    ) -> ShlResult<Arc<dyn Kernel>> {
        let packn = self.profile.packn(input.dtype);
        let nr = packn * 2;
        let kernel_impl: Arc<dyn Kernel> = match (strategy, input.dtype) {
            (ConvStrategy::Direct, _) => Arc::new(DirectConv),
            (ConvStrategy::Gemm1x1 | ConvStrategy::Im2colGemm, DType::Int8) => {
                im2col::prepare_int8(input, kernel, bias, output, params, nr, strategy == ConvStrategy::Gemm1x1)?
            }
            (ConvStrategy::Gemm1x1 | ConvStrategy::Im2colGemm, DType::Float16) => {
                im2col::prepare_float::<f16>(kernel, params, nr, strategy == ConvStrategy::Gemm1x1)?
            }
            (ConvStrategy::Gemm1x1 | ConvStrategy::Im2colGemm, _) => {
                im2col::prepare_float::<f32>(kernel, params, nr, strategy == ConvStrategy::Gemm1x1)?
            }
            (ConvStrategy::Winograd(tile), _) => winograd::float::prepare(kernel, params, tile, packn)?,
            (ConvStrategy::WinogradInt8, _) => winograd::int8::prepare(input, kernel, bias, output, params, packn)?,
            (ConvStrategy::Depthwise3x3, DType::Int8) => depthwise::prepare_int8(input, kernel, bias, output, params)?,
            (ConvStrategy::Depthwise3x3, DType::Float16) => depthwise::prepare_float::<f16>(kernel, params)?,
            (ConvStrategy::Depthwise3x3, _) => depthwise::prepare_float::<f32>(kernel, params)?,
        };
        params.as_conv2d_mut()?.conv_extra.conv_mode = strategy.conv_mode();
        Ok(kernel_impl)
    }
}

impl KernelInit for ConvInit {
    fn name(&self) -> &str {
        "conv2d_init"
    }

    fn init(&self, inputs: &[&Tensor], output: &Tensor, params: &mut OpParams) -> ShlResult<Arc<dyn Kernel>> {
        let input = arg(inputs, 0, "input")?;
        let kernel = arg(inputs, 1, "kernel")?;
        let bias = opt_arg(inputs, 2);
        let shape = ConvShape::from_tensors(input, kernel, output, params)?;
        let tile = params.as_conv2d()?.winograd_tile;
        let strategy = select_strategy(&shape, self.profile.packn(shape.dtype), tile);
        tracing::debug!(
            "{} conv {}x{} s{}x{} g{} {}->{} ({}): {}",
            self.api,
            shape.kernel.0,
            shape.kernel.1,
            shape.stride.0,
            shape.stride.1,
            shape.group,
            shape.in_c,
            shape.out_c,
            shape.dtype,
            strategy
        );
        self.build(strategy, input, kernel, bias, output, params)
    }
}

/// Dtypes the packed family handles
pub const DTYPES: [DType; 3] = [DType::Float32, DType::Float16, DType::Int8];

/// Register the convolution family and GEMM fully-connected for `api`
pub fn register(registry: &mut Registry, api: Api, profile: VectorProfile) {
    let init: Arc<dyn KernelInit> = Arc::new(ConvInit { api, profile });
    for op in OpKind::CONV {
        for dtype in DTYPES {
            registry.register_init(api, op, dtype, Arc::clone(&init));
        }
    }
    crate::kernels::fc::register(registry, api, profile);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(dtype: DType, k: usize, stride: usize, in_c: usize, out_c: usize, group: usize) -> ConvShape {
        ConvShape {
            dtype,
            layout: Layout::NCHW,
            group,
            in_c,
            out_c,
            kernel: (k, k),
            stride: (stride, stride),
            dilation: (1, 1),
            zero_pad: k == 1,
            uniform_dtype: true,
            symmetric_weights: true,
        }
    }

    #[test]
    fn test_strategy_table() {
        let f63 = WinogradTile::F63;
        let s = |sh: ConvShape| select_strategy(&sh, 4, f63);
        assert_eq!(s(shape(DType::Float32, 1, 1, 16, 19, 1)), ConvStrategy::Gemm1x1);
        assert_eq!(s(shape(DType::Float32, 3, 1, 8, 8, 1)), ConvStrategy::Winograd(f63));
        assert_eq!(s(shape(DType::Float32, 3, 1, 6, 8, 1)), ConvStrategy::Im2colGemm);
        assert_eq!(s(shape(DType::Float32, 3, 1, 8, 8, 2)), ConvStrategy::Im2colGemm);
        assert_eq!(s(shape(DType::Float32, 3, 2, 8, 8, 1)), ConvStrategy::Im2colGemm);
        assert_eq!(s(shape(DType::Float32, 5, 1, 8, 8, 1)), ConvStrategy::Im2colGemm);
        assert_eq!(s(shape(DType::Int8, 3, 1, 8, 8, 1)), ConvStrategy::WinogradInt8);
        assert_eq!(s(shape(DType::Float32, 3, 2, 8, 8, 8)), ConvStrategy::Depthwise3x3);
        assert_eq!(s(shape(DType::Float32, 5, 1, 8, 8, 8)), ConvStrategy::Direct);
    }

    #[test]
    fn test_fallbacks_to_direct() {
        let mut sh = shape(DType::Float32, 3, 1, 8, 8, 1);
        sh.dilation = (2, 2);
        assert_eq!(select_strategy(&sh, 4, WinogradTile::F63), ConvStrategy::Direct);

        let mut sh = shape(DType::Float32, 3, 1, 8, 8, 1);
        sh.layout = Layout::NHWC;
        assert_eq!(select_strategy(&sh, 4, WinogradTile::F63), ConvStrategy::Direct);

        let mut sh = shape(DType::Int8, 3, 1, 8, 8, 1);
        sh.symmetric_weights = false;
        assert_eq!(select_strategy(&sh, 8, WinogradTile::F63), ConvStrategy::Direct);

        // padded 1x1 goes through im2col
        let mut sh = shape(DType::Float32, 1, 1, 8, 8, 1);
        sh.zero_pad = false;
        assert_eq!(select_strategy(&sh, 4, WinogradTile::F63), ConvStrategy::Im2colGemm);
    }

    #[test]
    fn test_f43_preference() {
        let sh = shape(DType::Float16, 3, 1, 16, 16, 1);
        assert_eq!(
            select_strategy(&sh, 8, WinogradTile::F43),
            ConvStrategy::Winograd(WinogradTile::F43)
        );
        assert_eq!(ConvStrategy::Winograd(WinogradTile::F43).to_string(), "winograd_f43");
    }
}
