//! Entry points of the non-convolution operators

use super::{op_init, op_invoke, OpKind};
use crate::error::{ensure_shape, ShlError, ShlResult, Status};
use crate::params::OpParams;
use crate::registry::{KernelContext, Registry};
use crate::tensor::Tensor;

fn ensure_member(op: OpKind, family: &[OpKind], what: &str) -> ShlResult<()> {
    if family.contains(&op) {
        Ok(())
    } else {
        Err(ShlError::InvalidParam(format!("{} is not a {} operator", op, what)))
    }
}

fn ensure_same_size(input: &Tensor, output: &Tensor) -> ShlResult<()> {
    ensure_shape(input.size() == output.size(), || {
        format!(
            "output {:?} does not match input {:?}",
            output.dims(),
            input.dims()
        )
    })
}

// ---------- elementwise ----------

/// Bind a single-input elementwise operator (relu, sigmoid, clip, ...)
pub fn siso_init(
    registry: &Registry,
    op: OpKind,
    input: &Tensor,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    ensure_member(op, &OpKind::SISO, "single-input")?;
    params.as_siso()?;
    ensure_same_size(input, output)?;
    op_init(registry, op, &[input], output, params)
}

pub fn siso(ctx: &mut KernelContext, input: &Tensor, output: &mut Tensor, params: &OpParams) -> ShlResult<Status> {
    op_invoke(ctx, &[input], output, params)
}

/// Bind a two-input elementwise operator. `rhs` must match `lhs` or
/// broadcast against its trailing dims.
pub fn diso_init(
    registry: &Registry,
    op: OpKind,
    lhs: &Tensor,
    rhs: &Tensor,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    ensure_member(op, &OpKind::DISO, "two-input")?;
    params.as_diso()?;
    crate::kernels::reference::diso::broadcast_shape(lhs.dims(), rhs.dims())?;
    op_init(registry, op, &[lhs, rhs], output, params)
}

pub fn diso(
    ctx: &mut KernelContext,
    lhs: &Tensor,
    rhs: &Tensor,
    output: &mut Tensor,
    params: &OpParams,
) -> ShlResult<Status> {
    op_invoke(ctx, &[lhs, rhs], output, params)
}

// ---------- pooling ----------

pub fn pool_init(
    registry: &Registry,
    op: OpKind,
    input: &Tensor,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    ensure_member(op, &OpKind::POOL, "pooling")?;
    let p = params.as_pool()?;
    ensure_shape(input.dim_count() == 4 && output.dim_count() == 4, || {
        "pooling needs 4-D input and output".to_string()
    })?;
    if p.stride_height == 0 || p.stride_width == 0 {
        return Err(ShlError::InvalidParam("pool stride must be positive".to_string()));
    }
    op_init(registry, op, &[input], output, params)
}

pub fn pool(ctx: &mut KernelContext, input: &Tensor, output: &mut Tensor, params: &OpParams) -> ShlResult<Status> {
    op_invoke(ctx, &[input], output, params)
}

// ---------- reduction ----------

pub fn reduce_init(
    registry: &Registry,
    op: OpKind,
    input: &Tensor,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    ensure_member(op, &OpKind::REDUCE, "reduction")?;
    let p = params.as_reduce()?;
    crate::kernels::reference::reduce::normalize_axes(&p.axis, input.dim_count())?;
    op_init(registry, op, &[input], output, params)
}

pub fn reduce(ctx: &mut KernelContext, input: &Tensor, output: &mut Tensor, params: &OpParams) -> ShlResult<Status> {
    op_invoke(ctx, &[input], output, params)
}

// ---------- shape ----------

pub fn reshape_init(registry: &Registry, input: &Tensor, output: &Tensor, params: &mut OpParams) -> ShlResult<Status> {
    params.as_reshape()?;
    ensure_same_size(input, output)?;
    op_init(registry, OpKind::Reshape, &[input], output, params)
}

pub fn reshape(ctx: &mut KernelContext, input: &Tensor, output: &mut Tensor, params: &OpParams) -> ShlResult<Status> {
    op_invoke(ctx, &[input], output, params)
}

pub fn flatten_init(registry: &Registry, input: &Tensor, output: &Tensor, params: &mut OpParams) -> ShlResult<Status> {
    params.as_reshape()?;
    ensure_same_size(input, output)?;
    op_init(registry, OpKind::Flatten, &[input], output, params)
}

pub fn flatten(ctx: &mut KernelContext, input: &Tensor, output: &mut Tensor, params: &OpParams) -> ShlResult<Status> {
    op_invoke(ctx, &[input], output, params)
}

pub fn transpose_init(
    registry: &Registry,
    input: &Tensor,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    let p = params.as_transpose()?;
    let rank = input.dim_count();
    let mut seen = vec![false; rank];
    ensure_shape(p.permute.len() == rank, || {
        format!("permutation of length {} for rank {}", p.permute.len(), rank)
    })?;
    for (i, &axis) in p.permute.iter().enumerate() {
        if axis >= rank || seen[axis] {
            return Err(ShlError::InvalidParam(format!("invalid permutation {:?}", p.permute)));
        }
        seen[axis] = true;
        ensure_shape(output.dim(i) == input.dim(axis), || {
            format!("output dim {} should be {}", i, input.dim(axis))
        })?;
    }
    op_init(registry, OpKind::Transpose, &[input], output, params)
}

pub fn transpose(ctx: &mut KernelContext, input: &Tensor, output: &mut Tensor, params: &OpParams) -> ShlResult<Status> {
    op_invoke(ctx, &[input], output, params)
}

pub fn pad_init(registry: &Registry, input: &Tensor, output: &Tensor, params: &mut OpParams) -> ShlResult<Status> {
    let p = params.as_pad()?;
    let rank = input.dim_count();
    ensure_shape(p.pad_before.len() == rank && p.pad_after.len() == rank, || {
        format!("pad needs {} before/after entries", rank)
    })?;
    for i in 0..rank {
        let want = input.dim(i) + p.pad_before[i] + p.pad_after[i];
        ensure_shape(output.dim(i) == want, || {
            format!("padded dim {} should be {}, got {}", i, want, output.dim(i))
        })?;
    }
    op_init(registry, OpKind::Pad, &[input], output, params)
}

pub fn pad(ctx: &mut KernelContext, input: &Tensor, output: &mut Tensor, params: &OpParams) -> ShlResult<Status> {
    op_invoke(ctx, &[input], output, params)
}

// ---------- misc ----------

pub fn softmax_init(registry: &Registry, input: &Tensor, output: &Tensor, params: &mut OpParams) -> ShlResult<Status> {
    let p = params.as_softmax()?;
    crate::kernels::reference::reduce::normalize_axes(&[p.axis], input.dim_count())?;
    ensure_same_size(input, output)?;
    op_init(registry, OpKind::Softmax, &[input], output, params)
}

pub fn softmax(ctx: &mut KernelContext, input: &Tensor, output: &mut Tensor, params: &OpParams) -> ShlResult<Status> {
    op_invoke(ctx, &[input], output, params)
}

/// Bind a fully-connected layer: `weights` is `[units, in]`, the input is
/// read as `[batch, in]`
pub fn fullyconnected_init(
    registry: &Registry,
    input: &Tensor,
    weights: &Tensor,
    bias: Option<&Tensor>,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    params.as_fc()?;
    ensure_shape(weights.dim_count() == 2, || "fully-connected weights must be 2-D".to_string())?;
    let (units, in_len) = (weights.dim(0), weights.dim(1));
    ensure_shape(in_len > 0 && input.size() % in_len == 0, || {
        format!("input of {} values is not a multiple of {}", input.size(), in_len)
    })?;
    let batch = input.size() / in_len;
    ensure_shape(output.size() == batch * units, || {
        format!("output should hold {}x{} values", batch, units)
    })?;
    if let Some(b) = bias {
        ensure_shape(b.size() == 0 || b.size() == units, || {
            format!("bias has {} values for {} units", b.size(), units)
        })?;
    }
    params.as_fc_mut()?.units = units;
    let mut inputs = vec![input, weights];
    if let Some(b) = bias {
        inputs.push(b);
    }
    op_init(registry, OpKind::FullyConnected, &inputs, output, params)
}

pub fn fullyconnected(
    ctx: &mut KernelContext,
    input: &Tensor,
    weights: &Tensor,
    bias: Option<&Tensor>,
    output: &mut Tensor,
    params: &OpParams,
) -> ShlResult<Status> {
    let mut inputs = vec![input, weights];
    if let Some(b) = bias {
        inputs.push(b);
    }
    op_invoke(ctx, &inputs, output, params)
}

/// Bind a segment reduction. `segment_ids` are sorted i32 ids, one per row
/// of `input`.
pub fn segment_init(
    registry: &Registry,
    op: OpKind,
    input: &Tensor,
    segment_ids: &Tensor,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    ensure_member(op, &[OpKind::SegmentSum, OpKind::SegmentMean], "segment")?;
    params.as_segment()?;
    ensure_shape(segment_ids.size() == input.dim(0), || {
        format!("{} segment ids for {} rows", segment_ids.size(), input.dim(0))
    })?;
    op_init(registry, op, &[input, segment_ids], output, params)
}

pub fn segment(
    ctx: &mut KernelContext,
    input: &Tensor,
    segment_ids: &Tensor,
    output: &mut Tensor,
    params: &OpParams,
) -> ShlResult<Status> {
    op_invoke(ctx, &[input, segment_ids], output, params)
}
