//! Two-input elementwise kernels with trailing-dim broadcast

use crate::error::{ShlError, ShlResult};
use crate::kernels::{arg, real_values, write_real};
use crate::ops::OpKind;
use crate::params::OpParams;
use crate::registry::KernelContext;
use crate::tensor::Tensor;

/// Result shape of broadcasting `rhs` against `lhs`.
///
/// Dims are aligned from the right; each pair must be equal or contain a 1.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> ShlResult<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let a = dim_from_right(lhs, rank - 1 - i);
        let b = dim_from_right(rhs, rank - 1 - i);
        out[i] = match (a, b) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(ShlError::InvalidShape(format!(
                    "cannot broadcast {:?} with {:?}",
                    lhs, rhs
                )))
            }
        };
    }
    Ok(out)
}

fn dim_from_right(dims: &[usize], k: usize) -> usize {
    if k < dims.len() {
        dims[dims.len() - 1 - k]
    } else {
        1
    }
}

/// Linear source index for every output element of `out_dims`
fn broadcast_index(src: &[usize], out_dims: &[usize]) -> Vec<usize> {
    let rank = out_dims.len();
    let padded: Vec<usize> = (0..rank).map(|i| dim_from_right(src, rank - 1 - i)).collect();
    let mut strides = vec![0usize; rank];
    let mut s = 1;
    for i in (0..rank).rev() {
        strides[i] = if padded[i] == 1 { 0 } else { s };
        s *= padded[i];
    }
    let total: usize = out_dims.iter().product();
    let mut index = Vec::with_capacity(total);
    let mut coord = vec![0usize; rank];
    for _ in 0..total {
        index.push(coord.iter().zip(&strides).map(|(c, s)| c * s).sum());
        for d in (0..rank).rev() {
            coord[d] += 1;
            if coord[d] < out_dims[d] {
                break;
            }
            coord[d] = 0;
        }
    }
    index
}

fn binary_fn(op: OpKind) -> ShlResult<fn(f32, f32) -> f32> {
    let f: fn(f32, f32) -> f32 = match op {
        OpKind::Add => |a, b| a + b,
        OpKind::Sub => |a, b| a - b,
        OpKind::Mul => |a, b| a * b,
        OpKind::Div => |a, b| a / b,
        OpKind::Maximum => f32::max,
        OpKind::Minimum => f32::min,
        other => {
            return Err(ShlError::InvalidParam(format!(
                "{} is not a two-input operator",
                other
            )))
        }
    };
    Ok(f)
}

pub fn diso(op: OpKind, _ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, _params: &OpParams) -> ShlResult<()> {
    let lhs = arg(inputs, 0, "lhs")?;
    let rhs = arg(inputs, 1, "rhs")?;
    let f = binary_fn(op)?;
    let out_dims = broadcast_shape(lhs.dims(), rhs.dims())?;
    let total: usize = out_dims.iter().product();
    if output.size() != total {
        return Err(ShlError::InvalidShape(format!(
            "output {:?} does not match broadcast shape {:?}",
            output.dims(),
            out_dims
        )));
    }
    let a = real_values(lhs)?;
    let b = real_values(rhs)?;
    let out = if lhs.dims() == rhs.dims() {
        a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect()
    } else {
        let ia = broadcast_index(lhs.dims(), &out_dims);
        let ib = broadcast_index(rhs.dims(), &out_dims);
        ia.iter().zip(&ib).map(|(&i, &j)| f(a[i], b[j])).collect()
    };
    write_real(output, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::DisoParams;
    use crate::tensor::{DType, Layout};

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape(&[2, 3, 4], &[4]).unwrap(), vec![2, 3, 4]);
        assert_eq!(broadcast_shape(&[2, 1, 4], &[3, 1]).unwrap(), vec![2, 3, 4]);
        assert!(broadcast_shape(&[2, 3], &[4]).is_err());
    }

    #[test]
    fn test_add_with_channel_broadcast() {
        let a = Tensor::from_f32(&[2, 3], Layout::NC, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_f32(&[3], Layout::N, vec![10.0, 20.0, 30.0]).unwrap();
        let mut out = Tensor::zeros(DType::Float32, &[2, 3], Layout::NC).unwrap();
        let mut ctx = KernelContext::serial();
        diso(OpKind::Add, &mut ctx, &[&a, &b], &mut out, &OpParams::from(DisoParams::default())).unwrap();
        assert_eq!(out.data::<f32>().unwrap(), &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_maximum_same_shape() {
        let a = Tensor::from_f32(&[3], Layout::N, vec![1.0, 5.0, -2.0]).unwrap();
        let b = Tensor::from_f32(&[3], Layout::N, vec![2.0, 4.0, -3.0]).unwrap();
        let mut out = Tensor::zeros(DType::Float32, &[3], Layout::N).unwrap();
        let mut ctx = KernelContext::serial();
        diso(OpKind::Maximum, &mut ctx, &[&a, &b], &mut out, &OpParams::from(DisoParams::default())).unwrap();
        assert_eq!(out.data::<f32>().unwrap(), &[2.0, 5.0, -2.0]);
    }
}
