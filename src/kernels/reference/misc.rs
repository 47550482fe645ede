//! Softmax, fully-connected and segment reductions

use crate::error::{ShlError, ShlResult};
use crate::kernels::{arg, opt_arg, real_values, write_real};
use crate::ops::OpKind;
use crate::params::OpParams;
use crate::parallel::parallel_chunks_mut;
use crate::registry::KernelContext;
use crate::tensor::Tensor;

/// Split `dims` around `axis` into (outer, axis, inner) extents
fn split_axis(dims: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = dims[..axis].iter().product();
    let inner = dims[axis + 1..].iter().product();
    (outer, dims[axis], inner)
}

pub fn softmax(_ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
    let input = arg(inputs, 0, "input")?;
    let axis = params.as_softmax()?.axis;
    let rank = input.dim_count().max(1);
    let resolved = if axis < 0 { axis + rank as i32 } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return Err(ShlError::InvalidParam(format!("softmax axis {} for rank {}", axis, rank)));
    }
    let dims = if input.dim_count() == 0 { vec![1] } else { input.dims().to_vec() };
    let (outer, len, inner) = split_axis(&dims, resolved as usize);
    let src = real_values(input)?;
    let mut out = vec![0.0f32; src.len()];

    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * len + k) * inner + i;
            let max = (0..len).map(|k| src[at(k)]).fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for k in 0..len {
                let e = (src[at(k)] - max).exp();
                out[at(k)] = e;
                sum += e;
            }
            for k in 0..len {
                out[at(k)] /= sum;
            }
        }
    }
    write_real(output, out)
}

/// `out[b][u] = sum_k in[b][k] * w[u][k] + bias[u]`
pub fn fullyconnected(ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, _params: &OpParams) -> ShlResult<()> {
    let input = arg(inputs, 0, "input")?;
    let weights = arg(inputs, 1, "weights")?;
    let (units, in_len) = (weights.dim(0), weights.dim(1));
    let batch = input.size() / in_len.max(1);
    let x = real_values(input)?;
    let w = real_values(weights)?;
    let bias = match opt_arg(inputs, 2) {
        Some(b) => real_values(b)?.into_owned(),
        None => vec![0.0; units],
    };

    let mut out = vec![0.0f32; batch * units];
    parallel_chunks_mut(ctx.pool.as_ref(), &mut out, units, &|b, row| {
        let xb = &x[b * in_len..(b + 1) * in_len];
        for (u, o) in row.iter_mut().enumerate() {
            let wu = &w[u * in_len..(u + 1) * in_len];
            *o = xb.iter().zip(wu).map(|(a, b)| a * b).sum::<f32>() + bias[u];
        }
    });
    write_real(output, out)
}

/// Sum or mean of the rows of `input` sharing a segment id
pub fn segment(op: OpKind, _ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
    let input = arg(inputs, 0, "input")?;
    let ids = arg(inputs, 1, "segment_ids")?.data::<i32>()?;
    let num_segments = match params.as_segment()?.num_segments {
        0 => output.dim(0),
        n => n,
    };
    let rows = input.dim(0);
    let inner = input.size() / rows.max(1);
    if ids.windows(2).any(|w| w[0] > w[1]) {
        return Err(ShlError::InvalidParam("segment ids must be sorted".to_string()));
    }
    let src = real_values(input)?;
    let mut out = vec![0.0f32; num_segments * inner];
    let mut counts = vec![0usize; num_segments];
    for (r, &id) in ids.iter().enumerate().take(rows) {
        if id < 0 || id as usize >= num_segments {
            return Err(ShlError::IndexOutOfRange {
                index: id.max(0) as usize,
                len: num_segments,
            });
        }
        let s = id as usize;
        counts[s] += 1;
        for i in 0..inner {
            out[s * inner + i] += src[r * inner + i];
        }
    }
    if op == OpKind::SegmentMean {
        for (s, &n) in counts.iter().enumerate() {
            if n > 0 {
                out[s * inner..(s + 1) * inner].iter_mut().for_each(|v| *v /= n as f32);
            }
        }
    }
    write_real(output, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{FcParams, SegmentParams, SoftmaxParams};
    use crate::tensor::{DType, Layout};

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let input = Tensor::from_f32(&[2, 3], Layout::NC, vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]).unwrap();
        let mut out = Tensor::zeros(DType::Float32, &[2, 3], Layout::NC).unwrap();
        let mut ctx = KernelContext::serial();
        softmax(&mut ctx, &[&input], &mut out, &OpParams::from(SoftmaxParams::default())).unwrap();
        let y = out.data::<f32>().unwrap();
        assert!((y[..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(y[2] > y[1] && y[1] > y[0]);
        assert!(y[3..].iter().all(|v| (v - 1.0 / 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_softmax_axis_zero() {
        let input = Tensor::from_f32(&[2, 2], Layout::NC, vec![0.0, 5.0, 0.0, 5.0]).unwrap();
        let mut out = Tensor::zeros(DType::Float32, &[2, 2], Layout::NC).unwrap();
        let params = OpParams::from(SoftmaxParams {
            axis: 0,
            ..SoftmaxParams::default()
        });
        let mut ctx = KernelContext::serial();
        softmax(&mut ctx, &[&input], &mut out, &params).unwrap();
        assert!(out.data::<f32>().unwrap().iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_fullyconnected_with_bias() {
        let input = Tensor::from_f32(&[1, 3], Layout::NC, vec![1.0, 2.0, 3.0]).unwrap();
        let weights = Tensor::from_f32(&[2, 3], Layout::OI, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let bias = Tensor::from_f32(&[2], Layout::O, vec![0.5, -6.0]).unwrap();
        let mut out = Tensor::zeros(DType::Float32, &[1, 2], Layout::NC).unwrap();
        let mut ctx = KernelContext::serial();
        fullyconnected(&mut ctx, &[&input, &weights, &bias], &mut out, &OpParams::from(FcParams::default())).unwrap();
        assert_eq!(out.data::<f32>().unwrap(), &[1.5, 0.0]);
    }

    #[test]
    fn test_segment_sum_and_mean() {
        let input = Tensor::from_f32(&[4, 2], Layout::NC, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();
        let ids = Tensor::from_vec::<i32>(&[4], Layout::N, vec![0, 0, 1, 2]).unwrap();
        let mut out = Tensor::zeros(DType::Float32, &[3, 2], Layout::NC).unwrap();
        let mut ctx = KernelContext::serial();
        let params = OpParams::from(SegmentParams::default());

        segment(OpKind::SegmentSum, &mut ctx, &[&input, &ids], &mut out, &params).unwrap();
        assert_eq!(out.data::<f32>().unwrap(), &[4.0, 6.0, 5.0, 6.0, 7.0, 8.0]);

        segment(OpKind::SegmentMean, &mut ctx, &[&input, &ids], &mut out, &params).unwrap();
        assert_eq!(out.data::<f32>().unwrap(), &[2.0, 3.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_segment_rejects_unsorted_ids() {
        let input = Tensor::from_f32(&[2, 1], Layout::NC, vec![1.0, 2.0]).unwrap();
        let ids = Tensor::from_vec::<i32>(&[2], Layout::N, vec![1, 0]).unwrap();
        let mut out = Tensor::zeros(DType::Float32, &[2, 1], Layout::NC).unwrap();
        let mut ctx = KernelContext::serial();
        let err = segment(OpKind::SegmentSum, &mut ctx, &[&input, &ids], &mut out, &OpParams::from(SegmentParams::default()));
        assert!(err.is_err());
    }
}
