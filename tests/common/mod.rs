//! Common test utilities
//!
//! Shared fixtures for the integration tests:
//! - one registry with every backend, built once and shared by `Arc`
//! - seeded random tensors (ChaCha8, reproducible across runs)
//! - convolution tensor builders and tolerance checks

#![allow(dead_code)]

mod tempfile_helpers;

pub use tempfile_helpers::*;

use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use shl::params::Conv2dParams;
use shl::quant::{store_f32, QuantInfo};
use shl::{default_registry, Api, DType, Layout, OpParams, Params, Registry, Tensor};
use std::sync::Arc;

/// Registry shared by every test in a binary
pub static REGISTRY: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(default_registry()));

pub fn random_values(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Float tensor of `dtype` holding seeded values in [-1, 1)
pub fn random_tensor(dtype: DType, dims: &[usize], layout: Layout, seed: u64) -> anyhow::Result<Tensor> {
    let mut t = Tensor::new(dtype, dims, layout)?;
    let values = random_values(t.size(), seed);
    store_f32(&mut t, &values)?;
    Ok(t)
}

/// Tensors of one NCHW convolution
pub struct ConvCase {
    pub input: Tensor,
    pub kernel: Tensor,
    pub bias: Tensor,
    pub output: Tensor,
    pub params: Conv2dParams,
}

/// Float convolution with `k x k` kernels, `same`-style padding `pad`
pub fn float_conv(
    dtype: DType,
    (in_c, out_c, group): (usize, usize, usize),
    (h, w): (usize, usize),
    (k, stride, pad): (usize, usize, usize),
    seed: u64,
) -> anyhow::Result<ConvCase> {
    let params = Conv2dParams::new()
        .with_group(group)
        .with_stride(stride, stride)
        .with_pad(pad, pad, pad, pad);
    let (oh, ow) = params.output_hw(h, w, k, k)?;
    Ok(ConvCase {
        input: random_tensor(dtype, &[1, in_c, h, w], Layout::NCHW, seed)?,
        kernel: random_tensor(dtype, &[out_c, in_c / group, k, k], Layout::OIHW, seed + 1)?,
        bias: random_tensor(dtype, &[out_c], Layout::O, seed + 2)?,
        output: Tensor::new(dtype, &[1, out_c, oh, ow], Layout::NCHW)?,
        params,
    })
}

/// Symmetric int8 convolution with per-channel weight scales and a float
/// bias. The input zero point is nonzero.
pub fn int8_conv(
    (in_c, out_c): (usize, usize),
    (h, w): (usize, usize),
    (k, pad): (usize, usize),
    seed: u64,
) -> anyhow::Result<ConvCase> {
    let params = Conv2dParams::new().with_pad(pad, pad, pad, pad);
    let (oh, ow) = params.output_hw(h, w, k, k)?;

    let x = random_values(in_c * h * w, seed);
    let mut input = Tensor::new(DType::Int8, &[1, in_c, h, w], Layout::NCHW)?
        .with_qinfo(vec![QuantInfo::new(1.0 / 100.0, 5)]);
    store_f32(&mut input, &x)?;

    let wv = random_values(out_c * in_c * k * k, seed + 1);
    let per_channel = in_c * k * k;
    let qw = wv
        .chunks(per_channel)
        .map(QuantInfo::from_data_i8)
        .collect::<Result<Vec<_>, _>>()?;
    let mut kernel = Tensor::new(DType::Int8, &[out_c, in_c, k, k], Layout::OIHW)?.with_qinfo(qw);
    store_f32(&mut kernel, &wv)?;

    let bias = Tensor::from_f32(&[out_c], Layout::O, random_values(out_c, seed + 2))?;
    let output = Tensor::new(DType::Int8, &[1, out_c, oh, ow], Layout::NCHW)?
        .with_qinfo(vec![QuantInfo::new(0.1, -3)]);
    Ok(ConvCase {
        input,
        kernel,
        bias,
        output,
        params,
    })
}

/// Params of `case` targeted at `api`
pub fn conv_params(case: &ConvCase, api: Api) -> OpParams {
    OpParams::from(case.params.clone()).with_target(api, Layout::NCHW)
}

/// Name of the kernel bound on `params`
pub fn bound_name(params: &OpParams) -> String {
    params
        .base()
        .callback
        .as_ref()
        .map(|k| k.name().to_string())
        .unwrap_or_default()
}

/// Largest `|a - b| / max(1, |b|)`
pub fn max_rel_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "length mismatch");
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs() / y.abs().max(1.0))
        .fold(0.0, f32::max)
}
