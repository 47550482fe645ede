//! im2col + packed GEMM convolution (NCHW)
//!
//! Per batch and group the receptive fields are unrolled into a
//! `[in_c/group * kh * kw, out_h * out_w]` column matrix, packed, and
//! multiplied by the kernel packed once at init. 1x1 stride-1 convolutions
//! skip the unroll: the input plane already is the column matrix.

use crate::error::{ShlError, ShlResult};
use crate::kernels::gemm::int8::{fold_zero_point, gemm_packed_i8, Requant};
use crate::kernels::gemm::{gemm_packed, reorder_input, reorder_kernel};
use crate::kernels::reference::conv::{channel_requant, quantized_bias};
use crate::kernels::{arg, opt_arg, real_values, FloatElement};
use crate::ops::conv::ConvGeometry;
use crate::params::{Conv2dParams, OpParams};
use crate::registry::{Kernel, KernelContext};
use crate::tensor::{DType, Layout, Tensor};
use half::f16;
use std::sync::Arc;

/// Unroll one group's `[c, in_h, in_w]` plane into columns.
///
/// Row `(ic * kh + ky) * kw + kx` of `dst` holds, for every output pixel,
/// the input value under that tap or `pad` outside the image.
pub fn im2col<T: Copy>(src: &[T], dst: &mut [T], c: usize, g: &ConvGeometry, p: &Conv2dParams, pad: T) {
    let n = g.out_h * g.out_w;
    let plane = g.in_h * g.in_w;
    for ic in 0..c {
        for ky in 0..g.kernel_h {
            for kx in 0..g.kernel_w {
                let row = ((ic * g.kernel_h + ky) * g.kernel_w + kx) * n;
                for oy in 0..g.out_h {
                    let iy = (oy * p.stride_height + ky * p.dilation_height) as isize - p.pad_top as isize;
                    for ox in 0..g.out_w {
                        let ix = (ox * p.stride_width + kx * p.dilation_width) as isize - p.pad_left as isize;
                        let inside = iy >= 0 && ix >= 0 && (iy as usize) < g.in_h && (ix as usize) < g.in_w;
                        dst[row + oy * g.out_w + ox] = if inside {
                            src[ic * plane + iy as usize * g.in_w + ix as usize]
                        } else {
                            pad
                        };
                    }
                }
            }
        }
    }
}

/// Pack each group's `[out_c/group, k]` kernel block in n-block order
pub fn pack_kernel<T: Copy + Default>(weights: &[T], out_c: usize, k: usize, group: usize) -> Vec<T> {
    let m = out_c / group.max(1);
    let mut packed = vec![T::default(); out_c * k];
    for gi in 0..group.max(1) {
        let range = gi * m * k..(gi + 1) * m * k;
        reorder_kernel(&weights[range.clone()], &mut packed[range], m, k);
    }
    packed
}

/// im2col GEMM convolution; `pointwise` marks the 1x1 stride-1 variant
#[derive(Debug, Clone, Copy)]
pub struct Im2colGemm {
    pub nr: usize,
    pub pointwise: bool,
}

fn packed_kernel(params: &OpParams) -> ShlResult<&Tensor> {
    params
        .as_conv2d()?
        .conv_extra
        .kernel_tm
        .as_ref()
        .ok_or_else(|| ShlError::InternalError("convolution kernel was not packed at init".to_string()))
}

/// Pack a float kernel for [`Im2colGemm`]
pub fn prepare_float<T: FloatElement>(
    kernel: &Tensor,
    params: &mut OpParams,
    nr: usize,
    pointwise: bool,
) -> ShlResult<Arc<dyn Kernel>> {
    let p = params.as_conv2d_mut()?;
    let out_c = kernel.dim(0);
    let k = kernel.size() / out_c.max(1);
    let weights: Vec<T> = real_values(kernel)?.iter().map(|&v| T::from_f32(v)).collect();
    let packed = pack_kernel(&weights, out_c, k, p.group);
    p.conv_extra.kernel_tm = Some(Tensor::from_vec(&[out_c, k], Layout::OI, packed)?);
    Ok(Arc::new(Im2colGemm { nr, pointwise }))
}

/// Pack an int8 kernel for [`Im2colGemm`], folding the input zero point
/// into the bias and precomputing the per-channel requantization
pub fn prepare_int8(
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &Tensor,
    params: &mut OpParams,
    nr: usize,
    pointwise: bool,
) -> ShlResult<Arc<dyn Kernel>> {
    let out_c = kernel.dim(0);
    let k = kernel.size() / out_c.max(1);
    let weights = kernel.data::<i8>()?;
    let bias_q = quantized_bias(bias, input, kernel, out_c)?;
    let requant = channel_requant(input, kernel, output, out_c, 1.0)?;

    let p = params.as_conv2d_mut()?;
    let packed = pack_kernel(weights, out_c, k, p.group);
    p.conv_extra.kernel_tm = Some(Tensor::from_vec(&[out_c, k], Layout::OI, packed)?);
    p.conv_extra.bias_tm = Some(fold_zero_point(weights, &bias_q, out_c, k, input.qinfo_for(0).zero_point));
    p.conv_extra.fuse_zp2bias = true;
    p.conv_extra.requant = requant;
    Ok(Arc::new(Im2colGemm { nr, pointwise }))
}

/// Per-call sizes shared by the float and int8 paths
struct Plan {
    g: ConvGeometry,
    group: usize,
    in_c_g: usize,
    m: usize,
    k: usize,
    n: usize,
}

impl Plan {
    fn new(input: &Tensor, kernel: &Tensor, output: &Tensor, p: &Conv2dParams) -> ShlResult<Self> {
        let g = ConvGeometry::from_tensors(input, kernel, output, Layout::NCHW)?;
        let group = p.group.max(1);
        let in_c_g = g.in_c / group;
        Ok(Plan {
            g,
            group,
            in_c_g,
            m: g.out_c / group,
            k: in_c_g * g.kernel_h * g.kernel_w,
            n: g.out_h * g.out_w,
        })
    }

    fn input_range(&self, b: usize, gi: usize) -> std::ops::Range<usize> {
        let plane = self.g.in_h * self.g.in_w;
        let start = (b * self.g.in_c + gi * self.in_c_g) * plane;
        start..start + self.in_c_g * plane
    }

    fn output_range(&self, b: usize, gi: usize) -> std::ops::Range<usize> {
        let start = (b * self.g.out_c + gi * self.m) * self.n;
        start..start + self.m * self.n
    }
}

impl Im2colGemm {
    fn run_float<T: FloatElement>(
        &self,
        ctx: &mut KernelContext,
        inputs: &[&Tensor],
        output: &mut Tensor,
        params: &OpParams,
    ) -> ShlResult<()> {
        let input = arg(inputs, 0, "input")?;
        let kernel = arg(inputs, 1, "kernel")?;
        let p = params.as_conv2d()?;
        let plan = Plan::new(input, kernel, output, p)?;
        let a = packed_kernel(params)?.data::<T>()?;
        let bias = opt_arg(inputs, 2).map(real_values).transpose()?;
        let x = input.data::<T>()?;
        output.alloc_data();
        let y = output.data_mut::<T>()?;

        let (k, n, m) = (plan.k, plan.n, plan.m);
        let mut col = ctx.arena.alloc::<T>(if self.pointwise { 0 } else { k * n });
        let mut packed = ctx.arena.alloc::<T>(k * n);
        let pad = T::from_f32(0.0);
        for b in 0..plan.g.batch {
            for gi in 0..plan.group {
                let src = &x[plan.input_range(b, gi)];
                let cols: &[T] = if self.pointwise {
                    src
                } else {
                    im2col(src, &mut col[..], plan.in_c_g, &plan.g, p, pad);
                    &col[..]
                };
                reorder_input(cols, &mut packed[..], k, n, self.nr);
                let bias_g = bias.as_deref().map(|bs| &bs[gi * m..(gi + 1) * m]);
                gemm_packed(
                    ctx.pool.as_ref(),
                    &mut y[plan.output_range(b, gi)],
                    &a[gi * m * k..(gi + 1) * m * k],
                    &packed[..],
                    bias_g,
                    m,
                    k,
                    n,
                    self.nr,
                );
            }
        }
        Ok(())
    }

    fn run_int8(&self, ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
        let input = arg(inputs, 0, "input")?;
        let kernel = arg(inputs, 1, "kernel")?;
        let p = params.as_conv2d()?;
        let plan = Plan::new(input, kernel, output, p)?;
        let a = packed_kernel(params)?.data::<i8>()?;
        let extra = &p.conv_extra;
        let bias = extra
            .bias_tm
            .as_deref()
            .ok_or_else(|| ShlError::InternalError("int8 convolution bias was not folded at init".to_string()))?;
        let out_zp = output.qinfo_for(0).zero_point;
        let in_zp = input.qinfo_for(0).zero_point.clamp(i8::MIN as i32, i8::MAX as i32) as i8;
        let x = input.data::<i8>()?;
        output.alloc_data();
        let y = output.data_mut::<i8>()?;

        let (k, n, m) = (plan.k, plan.n, plan.m);
        let mut col = ctx.arena.alloc::<i8>(if self.pointwise { 0 } else { k * n });
        let mut packed = ctx.arena.alloc::<i8>(k * n);
        for b in 0..plan.g.batch {
            for gi in 0..plan.group {
                let src = &x[plan.input_range(b, gi)];
                let cols: &[i8] = if self.pointwise {
                    src
                } else {
                    im2col(src, &mut col[..], plan.in_c_g, &plan.g, p, in_zp);
                    &col[..]
                };
                reorder_input(cols, &mut packed[..], k, n, self.nr);
                let rq = Requant {
                    bias: &bias[gi * m..(gi + 1) * m],
                    scales: &extra.requant[gi * m..(gi + 1) * m],
                    out_zp,
                };
                gemm_packed_i8(
                    ctx.pool.as_ref(),
                    &mut y[plan.output_range(b, gi)],
                    &a[gi * m * k..(gi + 1) * m * k],
                    &packed[..],
                    &rq,
                    m,
                    k,
                    n,
                    self.nr,
                );
            }
        }
        Ok(())
    }
}

impl Kernel for Im2colGemm {
    fn name(&self) -> &str {
        if self.pointwise {
            "conv1x1s1_gemm"
        } else {
            "conv_im2col_gemm"
        }
    }

    fn execute(&self, ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
        match output.dtype {
            DType::Float32 => self.run_float::<f32>(ctx, inputs, output, params),
            DType::Float16 => self.run_float::<f16>(ctx, inputs, output, params),
            DType::Int8 => self.run_int8(ctx, inputs, output, params),
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

    fn random(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_im2col_rows() {
        // 1 channel 3x3, kernel 2x2, stride 1, no padding -> 4 rows x 4 pixels
        let src: Vec<u32> = (0..9).collect();
        let input = Tensor::new(DType::Float32, &[1, 1, 3, 3], Layout::NCHW).unwrap();
        let kernel = Tensor::new(DType::Float32, &[1, 1, 2, 2], Layout::OIHW).unwrap();
        let output = Tensor::new(DType::Float32, &[1, 1, 2, 2], Layout::NCHW).unwrap();
        let g = ConvGeometry::from_tensors(&input, &kernel, &output, Layout::NCHW).unwrap();
        let mut dst = vec![0u32; 16];
        im2col(&src, &mut dst, 1, &g, &Conv2dParams::new(), 99);
        assert_eq!(&dst[..4], &[0, 1, 3, 4]);
        assert_eq!(&dst[12..], &[4, 5, 7, 8]);
    }

    fn run_both(
        params: Conv2dParams,
        in_dims: [usize; 4],
        k_dims: [usize; 4],
        out_dims: [usize; 4],
        pointwise: bool,
    ) -> (Vec<f32>, Vec<f32>) {
        let input = Tensor::from_f32(&in_dims, Layout::NCHW, random(in_dims.iter().product(), 1)).unwrap();
        let kernel = Tensor::from_f32(&k_dims, Layout::OIHW, random(k_dims.iter().product(), 2)).unwrap();
        let bias = Tensor::from_f32(&[k_dims[0]], Layout::O, random(k_dims[0], 3)).unwrap();
        let mut params = OpParams::from(params);
        let mut ctx = KernelContext::serial();

        let mut expected = Tensor::zeros(DType::Float32, &out_dims, Layout::NCHW).unwrap();
        conv2d_direct(&mut ctx, &[&input, &kernel, &bias], &mut expected, &params).unwrap();

        let gemm = prepare_float::<f32>(&kernel, &mut params, 8, pointwise).unwrap();
        let mut out = Tensor::zeros(DType::Float32, &out_dims, Layout::NCHW).unwrap();
        gemm.execute(&mut ctx, &[&input, &kernel, &bias], &mut out, &params).unwrap();
        (out.data::<f32>().unwrap().to_vec(), expected.data::<f32>().unwrap().to_vec())
    }

    #[test]
    fn test_conv1x1s1_matches_direct() {
        let (got, want) = run_both(Conv2dParams::new(), [1, 16, 4, 5], [19, 16, 1, 1], [1, 19, 4, 5], true);
        for (a, b) in got.iter().zip(&want) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_conv1x1s1_kernel_reorder() {
        let kernel = Tensor::from_f32(&[19, 16, 1, 1], Layout::OIHW, (0..19 * 16).map(|v| v as f32).collect()).unwrap();
        let mut params = OpParams::from(Conv2dParams::new());
        prepare_float::<f32>(&kernel, &mut params, 8, true).unwrap();
        let tm = params.as_conv2d().unwrap().conv_extra.kernel_tm.clone().unwrap();
        let packed = tm.data::<f32>().unwrap();
        // first 8-row block, k = 0 then k = 1
        let rows: Vec<f32> = (0..8).map(|r| (r * 16) as f32).collect();
        assert_eq!(&packed[..8], rows.as_slice());
        assert_eq!(packed[8], 1.0);
        // rows 16, 17 form a 2-row block, row 18 stands alone
        assert_eq!(&packed[16 * 16..16 * 16 + 2], &[256.0, 272.0]);
        assert_eq!(packed[18 * 16], 288.0);
    }

    #[test]
    fn test_im2col_gemm_strided_grouped() {
        let params = Conv2dParams::new().with_stride(2, 2).with_pad(1, 1, 1, 1).with_group(2);
        let (got, want) = run_both(params, [2, 4, 7, 7], [6, 2, 3, 3], [2, 6, 4, 4], false);
        for (a, b) in got.iter().zip(&want) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_int8_gemm_matches_direct() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let x: Vec<i8> = (0..3 * 6 * 6).map(|_| rng.gen_range(-60..60)).collect();
        let w: Vec<i8> = (0..5 * 3 * 9).map(|_| rng.gen_range(-32..32)).collect();
        let input = Tensor::from_vec(&[1, 3, 6, 6], Layout::NCHW, x)
            .unwrap()
            .with_qinfo(vec![QuantInfo::new(0.05, 4)]);
        let kernel = Tensor::from_vec(&[5, 3, 3, 3], Layout::OIHW, w)
            .unwrap()
            .with_qinfo((0..5).map(|c| QuantInfo::new(0.01 + c as f32 * 0.002, 0)).collect());
        let bias = Tensor::from_vec::<i32>(&[5], Layout::O, vec![100, -50, 0, 7, 3000]).unwrap();
        let out_q = vec![QuantInfo::new(0.08, -3)];
        let mut params = OpParams::from(Conv2dParams::new().with_pad(1, 1, 1, 1));
        let mut ctx = KernelContext::serial();

        let mut expected = Tensor::new(DType::Int8, &[1, 5, 6, 6], Layout::NCHW)
            .unwrap()
            .with_qinfo(out_q.clone());
        conv2d_direct(&mut ctx, &[&input, &kernel, &bias], &mut expected, &params).unwrap();

        let mut out = Tensor::new(DType::Int8, &[1, 5, 6, 6], Layout::NCHW).unwrap().with_qinfo(out_q);
        let gemm = prepare_int8(&input, &kernel, Some(&bias), &out, &mut params, 16, false).unwrap();
        gemm.execute(&mut ctx, &[&input, &kernel, &bias], &mut out, &params).unwrap();
        assert_eq!(out.data::<i8>().unwrap(), expected.data::<i8>().unwrap());
        assert!(params.as_conv2d().unwrap().conv_extra.fuse_zp2bias);
    }
}
