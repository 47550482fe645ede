//! Operator entry points
//!
//! Every operator has an init call, which resolves and caches the kernel
//! on its params, and an invoke call, which runs the cached kernel:
//!
//! ```ignore
//! let mut params = OpParams::from(SisoParams::default());
//! ops::siso_init(&registry, OpKind::Relu, &input, &output, &mut params)?;
//! ops::siso(&mut ctx, &input, &mut output, &params)?;
//! ```
//!
//! Init looks for a backend init function first and falls back to a plain
//! kernel lookup. Invoke never touches the registry.

pub mod basic;
pub mod conv;
pub mod kind;

pub use basic::*;
pub use conv::{conv2d, conv2d_init, conv_node_init, conv_op_for, depthwise_conv2d_init, group_conv2d_init};
pub use kind::OpKind;

use crate::backend::RunMode;
use crate::error::{ShlError, ShlResult, Status};
use crate::params::{OpParams, Params};
use crate::registry::{BoundKernel, KernelContext, KernelSignature, Registry};
use crate::tensor::Tensor;

/// Resolve the kernel for `op` and cache it on `params`.
///
/// The dispatch dtype is the dtype of the first input (the output's when
/// there are no inputs). On a miss the previous callback is cleared and
/// `UnsupportedDtype` is returned, or `KernelNotFound` when the api has
/// no kernel for `op` at all. Both report `Status::UnsupportedDtype`.
pub fn op_init(
    registry: &Registry,
    op: OpKind,
    inputs: &[&Tensor],
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    for t in inputs {
        t.validate()?;
    }
    let key_tensor = inputs.first().copied().unwrap_or(output);
    let dtype = key_tensor.dtype;
    let api = params.base().api;
    let run_mode = params.base().run_mode;
    params.base_mut().callback = None;

    let kernel = if let Some(init) = registry.lookup_init(api, op, dtype) {
        tracing::debug!("{} init via {} ({} {})", op, init.name(), api, dtype);
        init.init(inputs, output, params)?
    } else {
        let found = registry.lookup(api, run_mode, op, dtype).or_else(|| {
            // graph nodes run layer kernels
            if run_mode.is_graph() {
                registry.lookup(api, RunMode::Layer, op, dtype)
            } else {
                None
            }
        });
        match found {
            Some(k) => k,
            None => {
                tracing::warn!("no {} kernel for {} on {}", op, dtype, api);
                if !registry.has_op(api, op) {
                    return Err(ShlError::KernelNotFound {
                        op: op.to_string(),
                        api: api.to_string(),
                    });
                }
                return Err(ShlError::unsupported_dtype(op, api, dtype));
            }
        }
    };

    tracing::debug!("{} bound to {}", op, kernel.name());
    params.base_mut().callback = Some(BoundKernel::new(
        kernel,
        KernelSignature {
            op,
            dtype,
            layout: key_tensor.layout,
        },
    ));
    Ok(Status::True)
}

/// Run the kernel cached by the last successful init.
///
/// The output buffer is allocated when missing.
pub fn op_invoke(
    ctx: &mut KernelContext,
    inputs: &[&Tensor],
    output: &mut Tensor,
    params: &OpParams,
) -> ShlResult<Status> {
    let bound = params.base().callback.as_ref().ok_or_else(|| {
        let name = &params.base().name;
        ShlError::CallbackUnset(if name.is_empty() {
            params.category().to_string()
        } else {
            name.clone()
        })
    })?;
    output.alloc_data();
    if crate::logging::debug_enabled(crate::logging::DebugLevel::Debug) {
        crate::session::debug::debug_print_params(params);
    }
    bound.invoke(ctx, inputs, output, params)?;
    if crate::logging::debug_enabled(crate::logging::DebugLevel::Debug) {
        crate::session::debug::debug_print_tensor(output);
    }
    Ok(Status::True)
}
