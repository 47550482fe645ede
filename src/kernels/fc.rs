//! Fully-connected layer on the packed GEMM
//!
//! `out[batch x units] = x[batch x in] * Wᵀ + bias`, computed as
//! `C[units x batch] = W * xᵀ` so the weights take the packed A slot and
//! are reordered once at init.

use crate::backend::{Api, VectorProfile};
use crate::error::{ShlError, ShlResult};
use crate::kernels::gemm::{gemm_packed, reorder_input, reorder_kernel};
use crate::kernels::reference::kernel_for;
use crate::kernels::{arg, opt_arg, real_values, FloatElement};
use crate::ops::OpKind;
use crate::params::OpParams;
use crate::registry::{Kernel, KernelContext, KernelInit, Registry};
use crate::tensor::{DType, Layout, Tensor};
use half::f16;
use std::sync::Arc;

/// GEMM-backed fully-connected kernel
#[derive(Debug, Clone, Copy)]
pub struct FcGemm {
    pub nr: usize,
}

impl FcGemm {
    fn run<T: FloatElement>(
        &self,
        ctx: &mut KernelContext,
        inputs: &[&Tensor],
        output: &mut Tensor,
        params: &OpParams,
    ) -> ShlResult<()> {
        let input = arg(inputs, 0, "input")?;
        let weights = arg(inputs, 1, "weights")?;
        let fc = params.as_fc()?;
        let w = fc
            .weights_tm
            .as_ref()
            .ok_or_else(|| ShlError::InternalError("fully-connected weights were not packed at init".to_string()))?
            .data::<T>()?;
        let (units, in_len) = (weights.dim(0), weights.dim(1));
        let batch = input.size() / in_len.max(1);
        let bias = opt_arg(inputs, 2).map(real_values).transpose()?;
        let x = input.data::<T>()?;

        let mut xt = ctx.arena.alloc::<T>(in_len * batch);
        for b in 0..batch {
            for k in 0..in_len {
                xt[k * batch + b] = x[b * in_len + k];
            }
        }
        let mut packed = ctx.arena.alloc::<T>(in_len * batch);
        reorder_input(&xt[..], &mut packed[..], in_len, batch, self.nr);
        let mut c = ctx.arena.alloc::<T>(units * batch);
        gemm_packed(
            ctx.pool.as_ref(),
            &mut c[..],
            w,
            &packed[..],
            bias.as_deref(),
            units,
            in_len,
            batch,
            self.nr,
        );

        output.alloc_data();
        let y = output.data_mut::<T>()?;
        for u in 0..units {
            for b in 0..batch {
                y[b * units + u] = c[u * batch + b];
            }
        }
        Ok(())
    }
}

impl Kernel for FcGemm {
    fn name(&self) -> &str {
        "fullyconnected_gemm"
    }

    fn execute(&self, ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
        match output.dtype {
            DType::Float32 => self.run::<f32>(ctx, inputs, output, params),
            DType::Float16 => self.run::<f16>(ctx, inputs, output, params),
            other => Err(ShlError::unsupported_dtype(self.name(), "rvv", other)),
        }
    }
}

/// Packs the weights for [`FcGemm`]; mixed dtypes go to the reference kernel
#[derive(Debug, Clone, Copy)]
pub struct FcInit {
    pub profile: VectorProfile,
}

impl FcInit {
    fn pack<T: FloatElement>(weights: &Tensor, params: &mut OpParams) -> ShlResult<()> {
        let (units, in_len) = (weights.dim(0), weights.dim(1));
        let w: Vec<T> = real_values(weights)?.iter().map(|&v| T::from_f32(v)).collect();
        let mut packed = vec![T::from_f32(0.0); units * in_len];
        reorder_kernel(&w, &mut packed, units, in_len);
        params.as_fc_mut()?.weights_tm = Some(Tensor::from_vec(&[units, in_len], Layout::OI, packed)?);
        Ok(())
    }
}

impl KernelInit for FcInit {
    fn name(&self) -> &str {
        "fullyconnected_init"
    }

    fn init(&self, inputs: &[&Tensor], output: &Tensor, params: &mut OpParams) -> ShlResult<Arc<dyn Kernel>> {
        let input = arg(inputs, 0, "input")?;
        let weights = arg(inputs, 1, "weights")?;
        if output.dtype != input.dtype || !weights.dtype.is_float() {
            tracing::debug!("fullyconnected {} x {}: reference", input.dtype, weights.dtype);
            return Ok(kernel_for(OpKind::FullyConnected));
        }
        match input.dtype {
            DType::Float32 => Self::pack::<f32>(weights, params)?,
            DType::Float16 => Self::pack::<f16>(weights, params)?,
            _ => return Ok(kernel_for(OpKind::FullyConnected)),
        }
        Ok(Arc::new(FcGemm {
            nr: self.profile.packn(input.dtype) * 2,
        }))
    }
}

/// Register the GEMM fully-connected for `api`
pub fn register(registry: &mut Registry, api: Api, profile: VectorProfile) {
    let init: Arc<dyn KernelInit> = Arc::new(FcInit { profile });
    for dtype in [DType::Float32, DType::Float16] {
        registry.register_init(api, OpKind::FullyConnected, dtype, Arc::clone(&init));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::reference::misc;
    use crate::params::FcParams;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_gemm_matches_reference() {
        let (batch, in_len, units) = (3, 21, 13);
        let input = Tensor::from_f32(&[batch, in_len], Layout::NC, random(batch * in_len, 1)).unwrap();
        let weights = Tensor::from_f32(&[units, in_len], Layout::OI, random(units * in_len, 2)).unwrap();
        let bias = Tensor::from_f32(&[units], Layout::O, random(units, 3)).unwrap();
        let mut params = OpParams::from(FcParams::default());
        let mut ctx = KernelContext::serial();

        let mut expected = Tensor::zeros(DType::Float32, &[batch, units], Layout::NC).unwrap();
        misc::fullyconnected(&mut ctx, &[&input, &weights, &bias], &mut expected, &params).unwrap();

        let init = FcInit {
            profile: VectorProfile::VLEN_128,
        };
        let mut out = Tensor::zeros(DType::Float32, &[batch, units], Layout::NC).unwrap();
        let kernel = init.init(&[&input, &weights, &bias], &out, &mut params).unwrap();
        assert_eq!(kernel.name(), "fullyconnected_gemm");
        kernel.execute(&mut ctx, &[&input, &weights, &bias], &mut out, &params).unwrap();
        for (a, b) in out.data::<f32>().unwrap().iter().zip(expected.data::<f32>().unwrap()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_quantized_weights_use_reference() {
        let input = Tensor::from_f32(&[1, 4], Layout::NC, vec![1.0; 4]).unwrap();
        let weights = Tensor::from_vec::<i8>(&[2, 4], Layout::OI, vec![1; 8]).unwrap();
        let out = Tensor::zeros(DType::Float32, &[1, 2], Layout::NC).unwrap();
        let mut params = OpParams::from(FcParams::default());
        let init = FcInit {
            profile: VectorProfile::VLEN_128,
        };
        let kernel = init.init(&[&input, &weights], &out, &mut params).unwrap();
        assert_eq!(kernel.name(), "ref_fullyconnected");
        assert!(params.as_fc().unwrap().weights_tm.is_none());
    }
}
