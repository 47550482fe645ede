//! Direct convolution
//!
//! Handles every geometry the optimized family declines: NHWC, dilation,
//! arbitrary stride/group and asymmetric int8 weights. Float types compute
//! in `f32`; uint8/int8 accumulate `(x - zp_in) * (w - zp_w)` exactly in
//! `i64` and requantize per output channel.

use crate::error::{ShlError, ShlResult};
use crate::kernels::{arg, opt_arg, real_values, write_real};
use crate::ops::conv::{conv_layout, ConvGeometry};
use crate::params::{Conv2dParams, OpParams};
use crate::parallel::parallel_chunks_mut;
use crate::quant::{quantize_multiplier, requantize, QuantElement};
use crate::registry::{Kernel, KernelContext};
use crate::tensor::{DType, Layout, Tensor};

/// Index arithmetic for one convolution call
struct Taps<'a> {
    g: ConvGeometry,
    p: &'a Conv2dParams,
    kernel_in_c: usize,
    out_per_group: usize,
}

impl Taps<'_> {
    fn input_index(&self, b: usize, c: usize, y: usize, x: usize) -> usize {
        let g = &self.g;
        match g.layout {
            Layout::NHWC => ((b * g.in_h + y) * g.in_w + x) * g.in_c + c,
            _ => ((b * g.in_c + c) * g.in_h + y) * g.in_w + x,
        }
    }

    fn kernel_index(&self, oc: usize, ic: usize, ky: usize, kx: usize) -> usize {
        let g = &self.g;
        match g.layout {
            Layout::NHWC => ((oc * g.kernel_h + ky) * g.kernel_w + kx) * self.kernel_in_c + ic,
            _ => ((oc * self.kernel_in_c + ic) * g.kernel_h + ky) * g.kernel_w + kx,
        }
    }

    /// Decode chunk `row`, element `i` into (batch, out channel, y, x)
    fn output_coord(&self, row: usize, i: usize) -> (usize, usize, usize, usize) {
        let g = &self.g;
        match g.layout {
            Layout::NHWC => {
                let pix = row % (g.out_h * g.out_w);
                (row / (g.out_h * g.out_w), i, pix / g.out_w, pix % g.out_w)
            }
            _ => (row / g.out_c, row % g.out_c, i / g.out_w, i % g.out_w),
        }
    }

    fn row_len(&self) -> usize {
        match self.g.layout {
            Layout::NHWC => self.g.out_c,
            _ => self.g.out_h * self.g.out_w,
        }
    }

    /// Call `visit(input_index, kernel_index)` for every in-bounds tap of
    /// output pixel (b, oc, oy, ox)
    fn for_each_tap(&self, b: usize, oc: usize, oy: usize, ox: usize, mut visit: impl FnMut(usize, usize)) {
        let (g, p) = (&self.g, self.p);
        let ic0 = (oc / self.out_per_group) * self.kernel_in_c;
        for ky in 0..g.kernel_h {
            let y = (oy * p.stride_height + ky * p.dilation_height) as isize - p.pad_top as isize;
            if y < 0 || y as usize >= g.in_h {
                continue;
            }
            for kx in 0..g.kernel_w {
                let x = (ox * p.stride_width + kx * p.dilation_width) as isize - p.pad_left as isize;
                if x < 0 || x as usize >= g.in_w {
                    continue;
                }
                for ic in 0..self.kernel_in_c {
                    visit(
                        self.input_index(b, ic0 + ic, y as usize, x as usize),
                        self.kernel_index(oc, ic, ky, kx),
                    );
                }
            }
        }
    }
}

/// Per-output-channel `(multiplier, shift)` for
/// `in_scale * w_scale[c] / out_scale / divisor`
pub fn channel_requant(
    input: &Tensor,
    kernel: &Tensor,
    output: &Tensor,
    out_c: usize,
    divisor: f64,
) -> ShlResult<Vec<(i32, i32)>> {
    let in_q = input.qinfo_for(0);
    let out_q = output.qinfo_for(0);
    (0..out_c)
        .map(|c| {
            let real = in_q.scale as f64 * kernel.qinfo_for(c).scale as f64 / out_q.scale as f64 / divisor;
            quantize_multiplier(real)
        })
        .collect()
}

/// Bias as i32 accumulator units (`in_scale * w_scale[c]`). An int32 bias
/// is taken as already in those units.
pub fn quantized_bias(bias: Option<&Tensor>, input: &Tensor, kernel: &Tensor, out_c: usize) -> ShlResult<Vec<i32>> {
    let Some(bias) = bias else {
        return Ok(vec![0; out_c]);
    };
    if bias.dtype == DType::Int32 {
        return Ok(bias.data::<i32>()?.to_vec());
    }
    let in_scale = input.qinfo_for(0).scale;
    let values = real_values(bias)?;
    Ok(values
        .iter()
        .enumerate()
        .map(|(c, &v)| {
            let s = in_scale * kernel.qinfo_for(c).scale;
            (v / s).round().clamp(i32::MIN as f32, i32::MAX as f32) as i32
        })
        .collect())
}

/// Direct convolution over any geometry
pub fn conv2d_direct(ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
    let input = arg(inputs, 0, "input")?;
    let kernel = arg(inputs, 1, "kernel")?;
    let bias = opt_arg(inputs, 2);
    let p = params.as_conv2d()?;
    let g = ConvGeometry::from_tensors(input, kernel, output, conv_layout(input, params))?;
    let taps = Taps {
        g,
        p,
        kernel_in_c: g.kernel_in_c(kernel),
        out_per_group: g.out_c / p.group.max(1),
    };

    match (input.dtype, kernel.dtype, output.dtype) {
        (DType::Uint8, DType::Uint8, DType::Uint8) => direct_quant::<u8>(ctx, &taps, input, kernel, bias, output),
        (DType::Int8, DType::Int8, DType::Int8) => direct_quant::<i8>(ctx, &taps, input, kernel, bias, output),
        _ => direct_real(ctx, &taps, input, kernel, bias, output),
    }
}

fn direct_real(
    ctx: &mut KernelContext,
    taps: &Taps<'_>,
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &mut Tensor,
) -> ShlResult<()> {
    let x = real_values(input)?;
    let w = real_values(kernel)?;
    let bias = match bias {
        Some(b) => real_values(b)?.into_owned(),
        None => vec![0.0; taps.g.out_c],
    };
    let mut out = vec![0.0f32; output.size()];
    parallel_chunks_mut(ctx.pool.as_ref(), &mut out, taps.row_len(), &|row, chunk| {
        for (i, o) in chunk.iter_mut().enumerate() {
            let (b, oc, oy, ox) = taps.output_coord(row, i);
            let mut acc = bias[oc];
            taps.for_each_tap(b, oc, oy, ox, |xi, wi| acc += x[xi] * w[wi]);
            *o = acc;
        }
    });
    write_real(output, out)
}

fn direct_quant<T: QuantElement>(
    ctx: &mut KernelContext,
    taps: &Taps<'_>,
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &mut Tensor,
) -> ShlResult<()> {
    let out_c = taps.g.out_c;
    let requant = channel_requant(input, kernel, output, out_c, 1.0)?;
    let bias_q = quantized_bias(bias, input, kernel, out_c)?;
    let in_zp = input.qinfo_for(0).zero_point as i64;
    let out_zp = output.qinfo_for(0).zero_point;
    let w_zp: Vec<i64> = (0..out_c).map(|c| kernel.qinfo_for(c).zero_point as i64).collect();
    let x = input.data::<T>()?;
    let w = kernel.data::<T>()?;

    output.alloc_data();
    let out = output.data_mut::<T>()?;
    parallel_chunks_mut(ctx.pool.as_ref(), out, taps.row_len(), &|row, chunk| {
        for (i, o) in chunk.iter_mut().enumerate() {
            let (b, oc, oy, ox) = taps.output_coord(row, i);
            let mut acc = bias_q[oc] as i64;
            taps.for_each_tap(b, oc, oy, ox, |xi, wi| {
                acc += (x[xi].to_i32() as i64 - in_zp) * (w[wi].to_i32() as i64 - w_zp[oc]);
            });
            let acc = acc.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
            let (m, s) = requant[oc];
            *o = requantize::<T>(acc, m, s, out_zp);
        }
    });
    Ok(())
}

/// Direct convolution as a registry kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectConv;

impl Kernel for DirectConv {
    fn name(&self) -> &str {
        "conv2d_direct"
    }

    fn execute(&self, ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
        if inputs.len() < 2 {
            return Err(ShlError::MissingData("conv2d needs input and kernel".to_string()));
        }
        conv2d_direct(ctx, inputs, output, params)
    }
}
