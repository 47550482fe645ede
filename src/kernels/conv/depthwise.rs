//! Depthwise 3x3 convolution, stride 1 or 2 (NCHW)
//!
//! Each channel plane is copied into a border-extended buffer first, so the
//! inner loop reads all nine taps without bounds checks. The border holds 0
//! for float and the input zero point for int8; the int8 bias carries the
//! folded `-in_zp * sum(w)` term.

use super::winograd::pad_planes;
use crate::error::{ShlError, ShlResult};
use crate::kernels::gemm::int8::fold_zero_point;
use crate::kernels::reference::conv::{channel_requant, quantized_bias};
use crate::kernels::{arg, opt_arg, real_values, FloatElement};
use crate::ops::conv::ConvGeometry;
use crate::params::{Conv2dParams, OpParams};
use crate::parallel::parallel_chunks_mut;
use crate::quant::requantize;
use crate::registry::{Kernel, KernelContext};
use crate::tensor::{DType, Layout, Tensor};
use half::f16;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct Depthwise3x3;

/// Planes of the border-extended input
#[derive(Debug, Clone, Copy)]
struct Extent {
    ph: usize,
    pw: usize,
    stride: usize,
}

impl Extent {
    fn new(g: &ConvGeometry, p: &Conv2dParams) -> Self {
        Extent {
            ph: g.in_h + p.pad_top + p.pad_down,
            pw: g.in_w + p.pad_left + p.pad_right,
            stride: p.stride_height,
        }
    }

    fn plane(&self) -> usize {
        self.ph * self.pw
    }

    /// Offset of the top-left tap of output pixel (oy, ox)
    #[inline]
    fn base(&self, oy: usize, ox: usize) -> usize {
        oy * self.stride * self.pw + ox * self.stride
    }
}

pub fn prepare_float<T: FloatElement>(kernel: &Tensor, params: &mut OpParams) -> ShlResult<Arc<dyn Kernel>> {
    let w: Vec<T> = real_values(kernel)?.iter().map(|&v| T::from_f32(v)).collect();
    let c = kernel.dim(0);
    params.as_conv2d_mut()?.conv_extra.kernel_tm = Some(Tensor::from_vec(&[c, 9], Layout::OI, w)?);
    Ok(Arc::new(Depthwise3x3))
}

pub fn prepare_int8(
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Arc<dyn Kernel>> {
    let c = kernel.dim(0);
    let w = kernel.data::<i8>()?;
    let bias_q = quantized_bias(bias, input, kernel, c)?;
    let requant = channel_requant(input, kernel, output, c, 1.0)?;
    let extra = &mut params.as_conv2d_mut()?.conv_extra;
    extra.bias_tm = Some(fold_zero_point(w, &bias_q, c, 9, input.qinfo_for(0).zero_point));
    extra.kernel_tm = Some(Tensor::from_vec(&[c, 9], Layout::OI, w.to_vec())?);
    extra.fuse_zp2bias = true;
    extra.requant = requant;
    Ok(Arc::new(Depthwise3x3))
}

fn kernel_tm<'a>(params: &'a OpParams) -> ShlResult<&'a Tensor> {
    params
        .as_conv2d()?
        .conv_extra
        .kernel_tm
        .as_ref()
        .ok_or_else(|| ShlError::InternalError("depthwise kernel was not prepared at init".to_string()))
}

impl Depthwise3x3 {
    fn run_float<T: FloatElement>(
        ctx: &mut KernelContext,
        inputs: &[&Tensor],
        output: &mut Tensor,
        params: &OpParams,
    ) -> ShlResult<()> {
        let input = arg(inputs, 0, "input")?;
        let kernel = arg(inputs, 1, "kernel")?;
        let p = params.as_conv2d()?;
        let g = ConvGeometry::from_tensors(input, kernel, output, Layout::NCHW)?;
        let w = kernel_tm(params)?.data::<T>()?;
        let bias = match opt_arg(inputs, 2) {
            Some(b) => real_values(b)?.into_owned(),
            None => vec![0.0; g.out_c],
        };
        let ext = Extent::new(&g, p);
        let planes = g.batch * g.in_c;

        let mut padded_buf = ctx.arena.alloc::<f32>(planes * ext.plane());
        pad_planes(
            input.data::<T>()?,
            &mut padded_buf[..],
            planes,
            (g.in_h, g.in_w),
            (ext.ph, ext.pw),
            (p.pad_top, p.pad_left),
            |v: T| v.to_f32(),
        );
        let padded: &[f32] = &padded_buf;
        let c = g.in_c;
        let (out_h, out_w) = (g.out_h, g.out_w);

        output.alloc_data();
        let y = output.data_mut::<T>()?;
        parallel_chunks_mut(ctx.pool.as_ref(), y, out_h * out_w, &|idx, dst| {
            let ch = idx % c;
            let src = &padded[idx * ext.plane()..(idx + 1) * ext.plane()];
            let k: Vec<f32> = w[ch * 9..ch * 9 + 9].iter().map(|v| v.to_f32()).collect();
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let base = ext.base(oy, ox);
                    let mut acc = bias[ch];
                    for ky in 0..3 {
                        let row = &src[base + ky * ext.pw..base + ky * ext.pw + 3];
                        acc += row[0] * k[ky * 3] + row[1] * k[ky * 3 + 1] + row[2] * k[ky * 3 + 2];
                    }
                    dst[oy * out_w + ox] = T::from_f32(acc);
                }
            }
        });
        Ok(())
    }

    fn run_int8(ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
        let input = arg(inputs, 0, "input")?;
        let kernel = arg(inputs, 1, "kernel")?;
        let p = params.as_conv2d()?;
        let extra = &p.conv_extra;
        let g = ConvGeometry::from_tensors(input, kernel, output, Layout::NCHW)?;
        let w = kernel_tm(params)?.data::<i8>()?;
        let bias = extra
            .bias_tm
            .as_deref()
            .ok_or_else(|| ShlError::InternalError("depthwise bias was not folded at init".to_string()))?;
        let requant = &extra.requant;
        let in_zp = input.qinfo_for(0).zero_point.clamp(i8::MIN as i32, i8::MAX as i32) as i8;
        let out_zp = output.qinfo_for(0).zero_point;
        let ext = Extent::new(&g, p);
        let planes = g.batch * g.in_c;

        let mut padded_buf = ctx.arena.alloc::<i8>(planes * ext.plane());
        padded_buf.fill(in_zp);
        pad_planes(
            input.data::<i8>()?,
            &mut padded_buf[..],
            planes,
            (g.in_h, g.in_w),
            (ext.ph, ext.pw),
            (p.pad_top, p.pad_left),
            |v: i8| v,
        );
        let padded: &[i8] = &padded_buf;
        let c = g.in_c;
        let (out_h, out_w) = (g.out_h, g.out_w);

        output.alloc_data();
        let y = output.data_mut::<i8>()?;
        parallel_chunks_mut(ctx.pool.as_ref(), y, out_h * out_w, &|idx, dst| {
            let ch = idx % c;
            let src = &padded[idx * ext.plane()..(idx + 1) * ext.plane()];
            let k = &w[ch * 9..ch * 9 + 9];
            let (mult, shift) = requant[ch];
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let base = ext.base(oy, ox);
                    let mut acc = bias[ch];
                    for ky in 0..3 {
                        for kx in 0..3 {
                            acc += src[base + ky * ext.pw + kx] as i32 * k[ky * 3 + kx] as i32;
                        }
                    }
                    dst[oy * out_w + ox] = requantize::<i8>(acc, mult, shift, out_zp);
                }
            }
        });
        Ok(())
    }
}

impl Kernel for Depthwise3x3 {
    fn name(&self) -> &str {
        "dwconv3x3"
    }

    fn execute(&self, ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
        match output.dtype {
            DType::Float32 => Self::run_float::<f32>(ctx, inputs, output, params),
            DType::Float16 => Self::run_float::<f16>(ctx, inputs, output, params),
            DType::Int8 => Self::run_int8(ctx, inputs, output, params),
            other => Err(ShlError::unsupported_dtype(self.name(), "rvv", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::reference::conv::conv2d_direct;
    use crate::quant::QuantInfo;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn check_float(stride: usize, hw: usize) {
        let c = 5;
        let mut rng = ChaCha8Rng::seed_from_u64(stride as u64);
        let mut random = |n: usize| -> Vec<f32> { (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect() };
        let out = (hw + 2 - 3) / stride + 1;
        let input = Tensor::from_f32(&[2, c, hw, hw], Layout::NCHW, random(2 * c * hw * hw)).unwrap();
        let kernel = Tensor::from_f32(&[c, 1, 3, 3], Layout::OIHW, random(c * 9)).unwrap();
        let bias = Tensor::from_f32(&[c], Layout::O, random(c)).unwrap();
        let mut params = OpParams::from(
            Conv2dParams::new()
                .with_group(c)
                .with_stride(stride, stride)
                .with_pad(1, 1, 1, 1),
        );
        let mut ctx = KernelContext::serial();
        let mut expected = Tensor::zeros(DType::Float32, &[2, c, out, out], Layout::NCHW).unwrap();
        conv2d_direct(&mut ctx, &[&input, &kernel, &bias], &mut expected, &params).unwrap();

        let dw = prepare_float::<f32>(&kernel, &mut params).unwrap();
        let mut got = Tensor::zeros(DType::Float32, &[2, c, out, out], Layout::NCHW).unwrap();
        dw.execute(&mut ctx, &[&input, &kernel, &bias], &mut got, &params).unwrap();
        for (a, b) in got.data::<f32>().unwrap().iter().zip(expected.data::<f32>().unwrap()) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_stride1_matches_direct() {
        check_float(1, 7);
    }

    #[test]
    fn test_stride2_matches_direct() {
        check_float(2, 8);
        check_float(2, 9);
    }

    #[test]
    fn test_int8_with_zero_point() {
        let c = 4;
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let x: Vec<i8> = (0..c * 36).map(|_| rng.gen_range(-90..90)).collect();
        let w: Vec<i8> = (0..c * 9).map(|_| rng.gen_range(-127..=127)).collect();
        let input = Tensor::from_vec(&[1, c, 6, 6], Layout::NCHW, x)
            .unwrap()
            .with_qinfo(vec![QuantInfo::new(0.03, -7)]);
        let kernel = Tensor::from_vec(&[c, 1, 3, 3], Layout::OIHW, w)
            .unwrap()
            .with_qinfo((0..c).map(|i| QuantInfo::new(0.01 * (i + 1) as f32, 0)).collect());
        let bias = Tensor::from_f32(&[c], Layout::O, vec![0.5, -0.25, 0.0, 1.0]).unwrap();
        let out_q = vec![QuantInfo::new(0.05, 1)];
        let mut params = OpParams::from(Conv2dParams::new().with_group(c).with_pad(1, 1, 1, 1));
        let mut ctx = KernelContext::serial();

        let mut expected = Tensor::new(DType::Int8, &[1, c, 6, 6], Layout::NCHW)
            .unwrap()
            .with_qinfo(out_q.clone());
        conv2d_direct(&mut ctx, &[&input, &kernel, &bias], &mut expected, &params).unwrap();

        let mut got = Tensor::new(DType::Int8, &[1, c, 6, 6], Layout::NCHW).unwrap().with_qinfo(out_q);
        let dw = prepare_int8(&input, &kernel, Some(&bias), &got, &mut params).unwrap();
        dw.execute(&mut ctx, &[&input, &kernel, &bias], &mut got, &params).unwrap();
        assert_eq!(got.data::<i8>().unwrap(), expected.data::<i8>().unwrap());
    }
}
