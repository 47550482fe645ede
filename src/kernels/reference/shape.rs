//! Data-movement kernels: reshape, flatten, transpose and pad

use crate::error::{ShlError, ShlResult};
use crate::kernels::{arg, real_values, write_real};
use crate::params::{OpParams, PadMode};
use crate::registry::KernelContext;
use crate::tensor::{Buffer, Tensor};

/// `out[i] = src[index[i]]` for any storage type
fn gather(src: &Buffer, index: &[usize]) -> Buffer {
    macro_rules! pick {
        ($($variant:ident),*) => {
            match src {
                $(Buffer::$variant(v) => Buffer::$variant(index.iter().map(|&i| v[i]).collect()),)*
            }
        };
    }
    pick!(Bool, U8, I8, U16, I16, U32, I32, F16, BF16, F32, F64, I64)
}

fn source_data(t: &Tensor) -> ShlResult<&Buffer> {
    t.data.as_ref().ok_or_else(|| ShlError::MissingData(t.name.clone()))
}

/// Reshape and flatten copy the buffer; only the descriptor changes
pub fn reshape(_ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, _params: &OpParams) -> ShlResult<()> {
    let input = arg(inputs, 0, "input")?;
    if input.size() != output.size() {
        return Err(ShlError::InvalidShape(format!(
            "cannot reshape {:?} into {:?}",
            input.dims(),
            output.dims()
        )));
    }
    if input.dtype == output.dtype && input.qinfo == output.qinfo {
        output.set_data(source_data(input)?.clone())
    } else {
        crate::quant::data_convert(output, input)
    }
}

pub fn transpose(_ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
    let input = arg(inputs, 0, "input")?;
    let perm = &params.as_transpose()?.permute;
    let dims = input.dims();
    let rank = dims.len();
    if perm.len() != rank {
        return Err(ShlError::InvalidParam(format!("permutation {:?} for rank {}", perm, rank)));
    }
    let mut in_strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        in_strides[i] = in_strides[i + 1] * dims[i + 1];
    }
    let out_dims: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();
    let strides: Vec<usize> = perm.iter().map(|&p| in_strides[p]).collect();

    let mut index = Vec::with_capacity(input.size());
    let mut coord = vec![0usize; rank];
    for _ in 0..input.size() {
        index.push(coord.iter().zip(&strides).map(|(c, s)| c * s).sum());
        for d in (0..rank).rev() {
            coord[d] += 1;
            if coord[d] < out_dims[d] {
                break;
            }
            coord[d] = 0;
        }
    }
    output.set_data(gather(source_data(input)?, &index))
}

/// Constant or edge padding over every axis
pub fn pad(_ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
    let input = arg(inputs, 0, "input")?;
    let p = params.as_pad()?;
    let dims = input.dims();
    let rank = dims.len();
    let out_dims: Vec<usize> = (0..rank).map(|i| dims[i] + p.pad_before[i] + p.pad_after[i]).collect();
    let src = real_values(input)?;

    let total: usize = out_dims.iter().product();
    let mut out = Vec::with_capacity(total);
    let mut coord = vec![0usize; rank];
    for _ in 0..total {
        let mut src_index = Some(0usize);
        for d in 0..rank {
            let c = coord[d] as isize - p.pad_before[d] as isize;
            let c = match p.pad_mode {
                PadMode::Edge => Some(c.clamp(0, dims[d] as isize - 1) as usize),
                PadMode::Constant if c >= 0 && (c as usize) < dims[d] => Some(c as usize),
                PadMode::Constant => None,
            };
            src_index = match (src_index, c) {
                (Some(i), Some(c)) => Some(i * dims[d] + c),
                _ => None,
            };
        }
        out.push(src_index.map_or(p.pad_value, |i| src[i]));
        for d in (0..rank).rev() {
            coord[d] += 1;
            if coord[d] < out_dims[d] {
                break;
            }
            coord[d] = 0;
        }
    }
    write_real(output, out)
}
