//! Kernel implementations
//!
//! This module organizes all computational kernels by family:
//! - `reference`: portable kernels for every operator and dtype
//! - `gemm`: operand packing and the tiled GEMM micro-kernels
//! - `conv`: optimized convolution family (im2col GEMM, 1x1 GEMM, Winograd, depthwise)
//! - `fc`: GEMM-backed fully-connected layer
//!
//! Reference kernels compute in `f32`. [`real_values`] and [`write_real`]
//! move data in and out of that domain, dequantizing and quantizing with
//! the tensors' own quantization records.

pub mod conv;
pub mod fc;
pub mod gemm;
pub mod reference;

use crate::error::{ShlError, ShlResult};
use crate::params::OpParams;
use crate::quant::{store_f32, to_f32_vec};
use crate::registry::{Kernel, KernelContext};
use crate::tensor::{Buffer, DType, Element, Tensor};
use half::f16;
use std::borrow::Cow;
use std::sync::Arc;

/// Floating-point storage types the optimized kernels are generic over.
/// Arithmetic always happens in `f32`.
pub trait FloatElement: Element + bytemuck::Pod {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl FloatElement for f32 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl FloatElement for f16 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

/// Kernel backed by a closure
pub struct FnKernel<F> {
    name: String,
    f: F,
}

impl<F> Kernel for FnKernel<F>
where
    F: Fn(&mut KernelContext, &[&Tensor], &mut Tensor, &OpParams) -> ShlResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        ctx: &mut KernelContext,
        inputs: &[&Tensor],
        output: &mut Tensor,
        params: &OpParams,
    ) -> ShlResult<()> {
        (self.f)(ctx, inputs, output, params)
    }
}

pub fn kernel_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Kernel>
where
    F: Fn(&mut KernelContext, &[&Tensor], &mut Tensor, &OpParams) -> ShlResult<()> + Send + Sync + 'static,
{
    Arc::new(FnKernel { name: name.into(), f })
}

/// Input `index`, or `MissingData` naming the operand
pub fn arg<'a>(inputs: &[&'a Tensor], index: usize, what: &str) -> ShlResult<&'a Tensor> {
    inputs
        .get(index)
        .copied()
        .ok_or_else(|| ShlError::MissingData(format!("{} (input {})", what, index)))
}

/// Optional input `index`; empty tensors count as absent
pub fn opt_arg<'a>(inputs: &[&'a Tensor], index: usize) -> Option<&'a Tensor> {
    inputs
        .get(index)
        .copied()
        .filter(|t| t.size() > 0 && t.data.is_some())
}

/// Real values of `t`; borrowed when it already holds `f32`
pub fn real_values(t: &Tensor) -> ShlResult<Cow<'_, [f32]>> {
    match t.dtype {
        DType::Float32 => Ok(Cow::Borrowed(t.data::<f32>()?)),
        _ => Ok(Cow::Owned(to_f32_vec(t)?)),
    }
}

/// Store real `values` into `t` in its own dtype
pub fn write_real(t: &mut Tensor, values: Vec<f32>) -> ShlResult<()> {
    match t.dtype {
        DType::Float32 => t.set_data(Buffer::F32(values)),
        _ => store_f32(t, &values),
    }
}
