//! Backend callback registry
//!
//! Maps `(api, run mode, op, dtype)` to a kernel, `(api, op, dtype)` to an
//! init function and `(api, run mode)` to a session backend. Entries are kept
//! in insertion order and searched newest first, so a later registration
//! shadows an earlier one with the same key.
//!
//! Operator init resolves once and caches a [`BoundKernel`] on the params;
//! invocation then costs one dtype/layout check and a virtual call.

use crate::backend::{Api, RunMode};
use crate::error::{ShlError, ShlResult};
use crate::memory::ScratchArena;
use crate::ops::OpKind;
use crate::parallel::{SerialPool, WorkerPool};
use crate::params::OpParams;
use crate::session::backend::SessionBackend;
use crate::tensor::{DType, Layout, Tensor};
use std::fmt;
use std::sync::Arc;

/// Execution environment handed to every kernel
pub struct KernelContext {
    pub pool: Arc<dyn WorkerPool>,
    pub arena: ScratchArena,
}

impl KernelContext {
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        KernelContext {
            pool,
            arena: ScratchArena::new(),
        }
    }

    /// Single-threaded context
    pub fn serial() -> Self {
        Self::new(Arc::new(SerialPool))
    }

    pub fn with_threads(threads: usize) -> Self {
        Self::new(crate::parallel::make_pool(threads))
    }
}

impl Default for KernelContext {
    fn default() -> Self {
        Self::serial()
    }
}

impl fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelContext")
            .field("threads", &self.pool.num_threads())
            .field("arena", &self.arena.stats())
            .finish()
    }
}

/// A concrete operator implementation
pub trait Kernel: Send + Sync {
    fn name(&self) -> &str;

    fn execute(
        &self,
        ctx: &mut KernelContext,
        inputs: &[&Tensor],
        output: &mut Tensor,
        params: &OpParams,
    ) -> ShlResult<()>;
}

/// Backend-specific init: inspects shapes and params, prepares any
/// transformed weights on `params` and picks the kernel to run.
pub trait KernelInit: Send + Sync {
    fn name(&self) -> &str;

    fn init(
        &self,
        inputs: &[&Tensor],
        output: &Tensor,
        params: &mut OpParams,
    ) -> ShlResult<Arc<dyn Kernel>>;
}

/// What a cached kernel was resolved for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSignature {
    pub op: OpKind,
    pub dtype: DType,
    pub layout: Layout,
}

/// Kernel cached on the params by a successful init
#[derive(Clone)]
pub struct BoundKernel {
    kernel: Arc<dyn Kernel>,
    signature: KernelSignature,
}

impl BoundKernel {
    pub fn new(kernel: Arc<dyn Kernel>, signature: KernelSignature) -> Self {
        BoundKernel { kernel, signature }
    }

    pub fn name(&self) -> &str {
        self.kernel.name()
    }

    pub fn signature(&self) -> KernelSignature {
        self.signature
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    /// Run the cached kernel after checking the first input still matches
    /// the dtype and layout it was bound for
    pub fn invoke(
        &self,
        ctx: &mut KernelContext,
        inputs: &[&Tensor],
        output: &mut Tensor,
        params: &OpParams,
    ) -> ShlResult<()> {
        let sig = self.signature;
        if let Some(first) = inputs.first() {
            if first.dtype != sig.dtype {
                return Err(ShlError::DtypeMismatch {
                    op: sig.op.to_string(),
                    expected: sig.dtype.to_string(),
                    actual: first.dtype.to_string(),
                });
            }
            if sig.layout != Layout::Null && first.layout != Layout::Null && first.layout != sig.layout {
                return Err(ShlError::unsupported_layout(sig.op, first.layout));
            }
        }
        self.kernel.execute(ctx, inputs, output, params)
    }
}

impl fmt::Debug for BoundKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundKernel")
            .field("kernel", &self.kernel.name())
            .field("signature", &self.signature)
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct KernelKey {
    api: Api,
    run_mode: RunMode,
    op: OpKind,
    dtype: DType,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct InitKey {
    api: Api,
    op: OpKind,
    dtype: DType,
}

/// Kernel, init function and session backend tables
#[derive(Default)]
pub struct Registry {
    kernels: Vec<(KernelKey, Arc<dyn Kernel>)>,
    inits: Vec<(InitKey, Arc<dyn KernelInit>)>,
    session_backends: Vec<((Api, RunMode), Arc<dyn SessionBackend>)>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with every backend the crate ships
    pub fn with_defaults() -> Self {
        crate::backend::default_registry()
    }

    pub fn register(
        &mut self,
        api: Api,
        run_mode: RunMode,
        op: OpKind,
        dtype: DType,
        kernel: Arc<dyn Kernel>,
    ) {
        tracing::trace!("register {} {} {} {} -> {}", api, run_mode, op, dtype, kernel.name());
        self.kernels.push((
            KernelKey {
                api,
                run_mode,
                op,
                dtype,
            },
            kernel,
        ));
    }

    pub fn lookup(&self, api: Api, run_mode: RunMode, op: OpKind, dtype: DType) -> Option<Arc<dyn Kernel>> {
        let key = KernelKey {
            api,
            run_mode,
            op,
            dtype,
        };
        self.kernels
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, kernel)| Arc::clone(kernel))
    }

    /// [`Registry::lookup`] with a miss reported as `UnsupportedDtype`
    pub fn resolve(&self, api: Api, run_mode: RunMode, op: OpKind, dtype: DType) -> ShlResult<Arc<dyn Kernel>> {
        self.lookup(api, run_mode, op, dtype)
            .ok_or_else(|| ShlError::unsupported_dtype(op, api, dtype))
    }

    /// Whether `api` has any kernel or init function for `op`
    pub fn has_op(&self, api: Api, op: OpKind) -> bool {
        self.kernels.iter().any(|(k, _)| k.api == api && k.op == op)
            || self.inits.iter().any(|(k, _)| k.api == api && k.op == op)
    }

    pub fn register_init(&mut self, api: Api, op: OpKind, dtype: DType, init: Arc<dyn KernelInit>) {
        tracing::trace!("register init {} {} {} -> {}", api, op, dtype, init.name());
        self.inits.push((InitKey { api, op, dtype }, init));
    }

    pub fn lookup_init(&self, api: Api, op: OpKind, dtype: DType) -> Option<Arc<dyn KernelInit>> {
        let key = InitKey { api, op, dtype };
        self.inits
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, init)| Arc::clone(init))
    }

    pub fn register_session_backend(&mut self, api: Api, run_mode: RunMode, backend: Arc<dyn SessionBackend>) {
        tracing::trace!("register session backend {} {} -> {}", api, run_mode, backend.name());
        self.session_backends.push(((api, run_mode), backend));
    }

    /// Session backend for `(api, run_mode)`.
    ///
    /// The CPU graph run mode always uses the `Gref` backend; its nodes
    /// still dispatch their kernels with their own api.
    pub fn session_backend(&self, api: Api, run_mode: RunMode) -> Option<Arc<dyn SessionBackend>> {
        let api = if run_mode == RunMode::CpuGraph { Api::Gref } else { api };
        self.session_backends
            .iter()
            .rev()
            .find(|(k, _)| *k == (api, run_mode))
            .map(|(_, b)| Arc::clone(b))
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    pub fn init_count(&self) -> usize {
        self.inits.len()
    }

    pub fn session_backend_count(&self) -> usize {
        self.session_backends.len()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kernels", &self.kernels.len())
            .field("inits", &self.inits.len())
            .field("session_backends", &self.session_backends.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SisoParams;

    struct Fill(f32, &'static str);

    impl Kernel for Fill {
        fn name(&self) -> &str {
            self.1
        }

        fn execute(
            &self,
            _ctx: &mut KernelContext,
            _inputs: &[&Tensor],
            output: &mut Tensor,
            _params: &OpParams,
        ) -> ShlResult<()> {
            output.data_mut::<f32>()?.fill(self.0);
            Ok(())
        }
    }

    #[test]
    fn test_lookup_miss() {
        let registry = Registry::new();
        assert!(registry
            .lookup(Api::Ref, RunMode::Layer, OpKind::Relu, DType::Float32)
            .is_none());
        let err = registry
            .resolve(Api::Ref, RunMode::Layer, OpKind::Relu, DType::Float32)
            .err()
            .unwrap();
        assert!(matches!(err, ShlError::UnsupportedDtype { .. }));
        assert!(!registry.has_op(Api::Ref, OpKind::Relu));
    }

    #[test]
    fn test_latest_registration_wins() {
        let mut registry = Registry::new();
        registry.register(Api::Ref, RunMode::Layer, OpKind::Relu, DType::Float32, Arc::new(Fill(1.0, "first")));
        registry.register(Api::Ref, RunMode::Layer, OpKind::Relu, DType::Float32, Arc::new(Fill(2.0, "second")));
        registry.register(Api::Ref, RunMode::Layer, OpKind::Relu, DType::Int8, Arc::new(Fill(3.0, "int8")));

        let k = registry
            .lookup(Api::Ref, RunMode::Layer, OpKind::Relu, DType::Float32)
            .unwrap();
        assert_eq!(k.name(), "second");
        assert_eq!(registry.kernel_count(), 3);
        assert!(registry
            .lookup(Api::C906, RunMode::Layer, OpKind::Relu, DType::Float32)
            .is_none());
    }

    #[test]
    fn test_bound_kernel_checks_dtype() {
        let bound = BoundKernel::new(
            Arc::new(Fill(5.0, "fill")),
            KernelSignature {
                op: OpKind::Relu,
                dtype: DType::Float32,
                layout: Layout::NCHW,
            },
        );
        let params = OpParams::from(SisoParams::default());
        let mut ctx = KernelContext::serial();

        let input = Tensor::zeros(DType::Float32, &[1, 1, 2, 2], Layout::NCHW).unwrap();
        let mut out = Tensor::zeros(DType::Float32, &[1, 1, 2, 2], Layout::NCHW).unwrap();
        bound.invoke(&mut ctx, &[&input], &mut out, &params).unwrap();
        assert_eq!(out.data::<f32>().unwrap(), &[5.0; 4]);

        let wrong = Tensor::zeros(DType::Int8, &[1, 1, 2, 2], Layout::NCHW).unwrap();
        let err = bound.invoke(&mut ctx, &[&wrong], &mut out, &params).unwrap_err();
        assert!(matches!(err, ShlError::DtypeMismatch { .. }));

        let nhwc = Tensor::zeros(DType::Float32, &[1, 2, 2, 1], Layout::NHWC).unwrap();
        let err = bound.invoke(&mut ctx, &[&nhwc], &mut out, &params).unwrap_err();
        assert!(matches!(err, ShlError::UnsupportedLayout { .. }));
    }

    #[test]
    fn test_debug_output_names_kernel() {
        let bound = BoundKernel::new(
            Arc::new(Fill(0.0, "fill")),
            KernelSignature {
                op: OpKind::Add,
                dtype: DType::Float32,
                layout: Layout::Null,
            },
        );
        assert!(format!("{:?}", bound).contains("fill"));
    }
}
