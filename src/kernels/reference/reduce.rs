//! Axis reductions

use crate::error::{ShlError, ShlResult};
use crate::kernels::{arg, real_values, write_real};
use crate::ops::OpKind;
use crate::params::OpParams;
use crate::registry::KernelContext;
use crate::tensor::Tensor;

/// Resolve negative axes against `rank`; an empty list means every axis
pub fn normalize_axes(axes: &[i32], rank: usize) -> ShlResult<Vec<usize>> {
    if axes.is_empty() {
        return Ok((0..rank).collect());
    }
    let mut out = Vec::with_capacity(axes.len());
    for &a in axes {
        let resolved = if a < 0 { a + rank as i32 } else { a };
        if resolved < 0 || resolved as usize >= rank.max(1) {
            return Err(ShlError::InvalidParam(format!(
                "axis {} out of range for rank {}",
                a, rank
            )));
        }
        if !out.contains(&(resolved as usize)) {
            out.push(resolved as usize);
        }
    }
    out.sort_unstable();
    Ok(out)
}

/// Output dims of reducing `dims` over `axes`
pub fn reduced_dims(dims: &[usize], axes: &[usize], keepdims: bool) -> Vec<usize> {
    dims.iter()
        .enumerate()
        .filter_map(|(i, &d)| match (axes.contains(&i), keepdims) {
            (true, true) => Some(1),
            (true, false) => None,
            (false, _) => Some(d),
        })
        .collect()
}

pub fn reduce(op: OpKind, _ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
    let input = arg(inputs, 0, "input")?;
    let p = params.as_reduce()?;
    let dims = input.dims();
    let axes = normalize_axes(&p.axis, dims.len())?;

    // output coordinate strides: reduced axes contribute nothing
    let mut out_strides = vec![0usize; dims.len()];
    let mut s = 1;
    for i in (0..dims.len()).rev() {
        if !axes.contains(&i) {
            out_strides[i] = s;
            s *= dims[i];
        }
    }
    let out_len = s;
    if output.size() != out_len {
        return Err(ShlError::InvalidShape(format!(
            "reduce output should hold {} values, has {}",
            out_len,
            output.size()
        )));
    }
    let count = (input.size() / out_len.max(1)).max(1);

    let init = match op {
        OpKind::ReduceSum | OpKind::ReduceMean => 0.0,
        OpKind::ReduceProd => 1.0,
        OpKind::ReduceMax => f32::NEG_INFINITY,
        OpKind::ReduceMin => f32::INFINITY,
        other => return Err(ShlError::InvalidParam(format!("{} is not a reduction", other))),
    };
    let src = real_values(input)?;
    let mut out = vec![init; out_len];
    let mut coord = vec![0usize; dims.len()];
    for &v in src.iter() {
        let o: usize = coord.iter().zip(&out_strides).map(|(c, s)| c * s).sum();
        out[o] = match op {
            OpKind::ReduceSum | OpKind::ReduceMean => out[o] + v,
            OpKind::ReduceProd => out[o] * v,
            OpKind::ReduceMax => out[o].max(v),
            _ => out[o].min(v),
        };
        for d in (0..dims.len()).rev() {
            coord[d] += 1;
            if coord[d] < dims[d] {
                break;
            }
            coord[d] = 0;
        }
    }
    if op == OpKind::ReduceMean {
        out.iter_mut().for_each(|v| *v /= count as f32);
    }
    write_real(output, out)
}
