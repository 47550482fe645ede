//! Single-input elementwise kernels

use crate::error::{ShlError, ShlResult};
use crate::kernels::{arg, real_values, write_real};
use crate::ops::OpKind;
use crate::params::{OpParams, SisoParams};
use crate::parallel::parallel_chunks_mut;
use crate::registry::KernelContext;
use crate::tensor::Tensor;

const CHUNK: usize = 4096;

/// Scalar function of `op`
pub fn siso_fn(op: OpKind, p: &SisoParams) -> ShlResult<Box<dyn Fn(f32) -> f32 + Send + Sync>> {
    let (lo, hi, alpha) = (p.min_value, p.max_value, p.alpha);
    let f: Box<dyn Fn(f32) -> f32 + Send + Sync> = match op {
        OpKind::Relu => Box::new(|x: f32| x.max(0.0)),
        OpKind::Relu1 => Box::new(|x: f32| x.clamp(-1.0, 1.0)),
        OpKind::Relu6 => Box::new(|x: f32| x.clamp(0.0, 6.0)),
        OpKind::ReluN => Box::new(move |x: f32| x.max(0.0).min(hi)),
        OpKind::LeakyRelu => Box::new(move |x: f32| if x > 0.0 { x } else { alpha * x }),
        OpKind::Sigmoid => Box::new(|x: f32| 1.0 / (1.0 + (-x).exp())),
        OpKind::Tanh => Box::new(|x: f32| x.tanh()),
        OpKind::Abs => Box::new(|x: f32| x.abs()),
        OpKind::Neg => Box::new(|x: f32| -x),
        OpKind::Exp => Box::new(|x: f32| x.exp()),
        OpKind::Sqrt => Box::new(|x: f32| x.sqrt()),
        OpKind::Clip => Box::new(move |x: f32| x.max(lo).min(hi)),
        other => {
            return Err(ShlError::InvalidParam(format!(
                "{} is not a single-input operator",
                other
            )))
        }
    };
    Ok(f)
}

pub fn siso(op: OpKind, ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
    let input = arg(inputs, 0, "input")?;
    let f = siso_fn(op, params.as_siso()?)?;
    let src = real_values(input)?;
    let mut out = vec![0.0f32; src.len()];
    parallel_chunks_mut(ctx.pool.as_ref(), &mut out, CHUNK, &|ci, chunk| {
        let base = ci * CHUNK;
        for (i, o) in chunk.iter_mut().enumerate() {
            *o = f(src[base + i]);
        }
    });
    write_real(output, out)
}
