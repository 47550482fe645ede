//! Reference kernels
//!
//! Portable implementations of every operator. They compute in `f32`
//! (integer convolution excepted) and serve as the fallback layer under
//! the optimized backends.

pub mod conv;
pub mod diso;
pub mod misc;
pub mod pool;
pub mod reduce;
pub mod shape;
pub mod siso;

use crate::backend::{Api, RunMode};
use crate::kernels::kernel_fn;
use crate::ops::OpKind;
use crate::registry::{Kernel, Registry};
use crate::tensor::DType;
use std::sync::Arc;

/// Storage types the reference set is registered for
pub const DTYPES: [DType; 4] = [DType::Float32, DType::Float16, DType::Uint8, DType::Int8];

/// Reference kernel for `op`
pub fn kernel_for(op: OpKind) -> Arc<dyn Kernel> {
    let name = format!("ref_{}", op);
    match op {
        OpKind::Conv2d | OpKind::DepthwiseConv2d | OpKind::GroupConv2d => Arc::new(conv::DirectConv),
        OpKind::MaxPool2d | OpKind::AvgPool2d | OpKind::GlobalAvgPool2d | OpKind::GlobalMaxPool2d => {
            kernel_fn(name, move |ctx, inputs, output, params| pool::pool2d(op, ctx, inputs, output, params))
        }
        OpKind::ReduceSum | OpKind::ReduceMean | OpKind::ReduceMax | OpKind::ReduceMin | OpKind::ReduceProd => {
            kernel_fn(name, move |ctx, inputs, output, params| reduce::reduce(op, ctx, inputs, output, params))
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::Maximum | OpKind::Minimum => {
            kernel_fn(name, move |ctx, inputs, output, params| diso::diso(op, ctx, inputs, output, params))
        }
        OpKind::Reshape | OpKind::Flatten => kernel_fn(name, shape::reshape),
        OpKind::Transpose => kernel_fn(name, shape::transpose),
        OpKind::Pad => kernel_fn(name, shape::pad),
        OpKind::Softmax => kernel_fn(name, misc::softmax),
        OpKind::FullyConnected => kernel_fn(name, misc::fullyconnected),
        OpKind::SegmentSum | OpKind::SegmentMean => {
            kernel_fn(name, move |ctx, inputs, output, params| misc::segment(op, ctx, inputs, output, params))
        }
        // remaining ops are the single-input elementwise set
        _ => kernel_fn(name, move |ctx, inputs, output, params| siso::siso(op, ctx, inputs, output, params)),
    }
}

/// Every operator the reference set implements
pub fn ops() -> Vec<OpKind> {
    let mut ops = Vec::new();
    ops.extend(OpKind::CONV);
    ops.extend(OpKind::POOL);
    ops.extend(OpKind::SISO);
    ops.extend(OpKind::DISO);
    ops.extend(OpKind::REDUCE);
    ops.extend([
        OpKind::Reshape,
        OpKind::Flatten,
        OpKind::Transpose,
        OpKind::Pad,
        OpKind::Softmax,
        OpKind::FullyConnected,
        OpKind::SegmentSum,
        OpKind::SegmentMean,
    ]);
    ops
}

/// Register the reference set under `api` for layer execution
pub fn register(registry: &mut Registry, api: Api) {
    for op in ops() {
        let kernel = kernel_for(op);
        for dtype in DTYPES {
            registry.register(api, RunMode::Layer, op, dtype, Arc::clone(&kernel));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_op_registered_for_every_dtype() {
        let mut registry = Registry::new();
        register(&mut registry, Api::Ref);
        assert_eq!(registry.kernel_count(), ops().len() * DTYPES.len());
        for op in ops() {
            for dtype in DTYPES {
                assert!(registry.lookup(Api::Ref, RunMode::Layer, op, dtype).is_some(), "{} {}", op, dtype);
            }
        }
        assert!(registry.lookup(Api::Ref, RunMode::Layer, OpKind::Relu, DType::Int32).is_none());
        assert!(registry.lookup(Api::C906, RunMode::Layer, OpKind::Relu, DType::Float32).is_none());
    }

    #[test]
    fn test_kernel_names() {
        assert_eq!(kernel_for(OpKind::Relu).name(), "ref_relu");
        assert_eq!(kernel_for(OpKind::Conv2d).name(), "conv2d_direct");
        assert_eq!(kernel_for(OpKind::SegmentMean).name(), "ref_segment_mean");
    }
}
