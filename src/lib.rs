//! shl - operator-kernel dispatch for neural-network inference
//!
//! Operators are resolved through a [`Registry`] keyed by target api, run
//! mode, operator and dtype. Init binds a kernel to the operator's params
//! once; invocation then runs the bound kernel directly. The optimized
//! backends carry a packed convolution family (im2col + GEMM, 1x1 GEMM,
//! float and int8 Winograd, 3x3 depthwise) next to reference kernels for
//! every operator. Sessions run operators one by one (layer mode) or record
//! them as a graph and execute it (CPU graph mode).

#![allow(clippy::too_many_arguments)] // Kernel entry points take geometry plus buffers
#![allow(clippy::needless_range_loop)] // Index loops mirror the tensor math
#![allow(clippy::type_complexity)]

pub mod backend;
pub mod error;
pub mod kernels;
pub mod logging;
pub mod memory;
pub mod ops;
pub mod parallel;
pub mod params;
pub mod quant;
pub mod registry;
pub mod session;
pub mod tensor;

pub use backend::{default_registry, Api, RunMode};
pub use error::{ErrorCategory, ShlError, ShlResult, Status};
pub use ops::OpKind;
pub use params::{OpParams, Params};
pub use registry::{Kernel, KernelContext, KernelInit, Registry};
pub use session::{alloc_params, alloc_session, alloc_tensor, import_binary_model, Session, SessionConfig};
pub use tensor::{Buffer, DType, Layout, QuantType, Tensor};
