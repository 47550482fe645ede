//! 2-D pooling kernels, NCHW and NHWC

use crate::error::{ShlError, ShlResult};
use crate::kernels::{arg, real_values, write_real};
use crate::ops::OpKind;
use crate::params::{OpParams, Params, PoolParams};
use crate::parallel::parallel_chunks_mut;
use crate::registry::KernelContext;
use crate::tensor::{Layout, Tensor};

#[derive(Debug, Clone, Copy)]
struct PoolGeom {
    channels: usize,
    in_h: usize,
    in_w: usize,
    out_h: usize,
    out_w: usize,
    nhwc: bool,
}

impl PoolGeom {
    fn new(input: &Tensor, output: &Tensor, layout: Layout) -> ShlResult<Self> {
        let nhwc = match layout {
            Layout::NHWC => true,
            Layout::NCHW | Layout::Null => false,
            other => return Err(ShlError::unsupported_layout("pool2d", other)),
        };
        let (c, h, w) = if nhwc { (3, 1, 2) } else { (1, 2, 3) };
        Ok(PoolGeom {
            channels: input.dim(c),
            in_h: input.dim(h),
            in_w: input.dim(w),
            out_h: output.dim(h),
            out_w: output.dim(w),
            nhwc,
        })
    }

    fn in_index(&self, b: usize, c: usize, y: usize, x: usize) -> usize {
        if self.nhwc {
            ((b * self.in_h + y) * self.in_w + x) * self.channels + c
        } else {
            ((b * self.channels + c) * self.in_h + y) * self.in_w + x
        }
    }
}

fn window(out: usize, stride: usize, pad: usize, filter: usize, extent: usize) -> (usize, usize) {
    let origin = (out * stride) as isize - pad as isize;
    let start = origin.max(0) as usize;
    let end = (origin + filter as isize).clamp(0, extent as isize) as usize;
    (start, end.max(start))
}

pub fn pool2d(op: OpKind, ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
    let input = arg(inputs, 0, "input")?;
    let layout = match params.base().layout {
        Layout::Null => input.layout,
        l => l,
    };
    let g = PoolGeom::new(input, output, layout)?;
    let p: PoolParams = match op {
        OpKind::GlobalAvgPool2d | OpKind::GlobalMaxPool2d => PoolParams::window(g.in_h, g.in_w, 1, 1),
        _ => params.as_pool()?.clone(),
    };
    let is_max = matches!(op, OpKind::MaxPool2d | OpKind::GlobalMaxPool2d);
    let src = real_values(input)?;
    let batch = input.dim(0);
    let mut out = vec![0.0f32; batch * g.channels * g.out_h * g.out_w];

    // one chunk per output row: (b, c, y) for NCHW, (b, y) for NHWC
    let row_len = if g.nhwc { g.out_w * g.channels } else { g.out_w };
    parallel_chunks_mut(ctx.pool.as_ref(), &mut out, row_len, &|row, chunk| {
        let (b, c_fixed, oy) = if g.nhwc {
            (row / g.out_h, None, row % g.out_h)
        } else {
            let oy = row % g.out_h;
            let bc = row / g.out_h;
            (bc / g.channels, Some(bc % g.channels), oy)
        };
        let (y0, y1) = window(oy, p.stride_height, p.pad_top, p.filter_height, g.in_h);
        for (i, o) in chunk.iter_mut().enumerate() {
            let (ox, c) = match c_fixed {
                Some(c) => (i, c),
                None => (i / g.channels, i % g.channels),
            };
            let (x0, x1) = window(ox, p.stride_width, p.pad_left, p.filter_width, g.in_w);
            let mut acc = if is_max { f32::NEG_INFINITY } else { 0.0 };
            for y in y0..y1 {
                for x in x0..x1 {
                    let v = src[g.in_index(b, c, y, x)];
                    acc = if is_max { acc.max(v) } else { acc + v };
                }
            }
            if !is_max {
                let count = if p.count_include_pad {
                    p.filter_height * p.filter_width
                } else {
                    (y1 - y0) * (x1 - x0)
                };
                acc /= count.max(1) as f32;
            } else if acc == f32::NEG_INFINITY {
                acc = 0.0;
            }
            *o = acc;
        }
    });
    write_real(output, out)
}
