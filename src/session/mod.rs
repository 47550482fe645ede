//! Sessions
//!
//! A [`Session`] owns the configuration, the tensor table and, in graph
//! modes, the graph handle created by its [`SessionBackend`]. Calls must
//! follow the lifecycle below; anything out of order fails with
//! `InvalidState` and leaves the session untouched.
//!
//! ```text
//! Uninitialized -> Initialized -> TensorsBound -> Setup -> ReadyToRun (run*)
//!                                                                |
//!                                                         Deinitialized
//! ```
//!
//! Layer-mode sessions only hand out tensors, params, the registry and a
//! kernel context; operators are invoked directly through [`crate::ops`].

pub mod backend;
pub mod binary_model;
pub mod config;
pub mod debug;
pub mod graph;

pub use backend::{SessionBackend, TargetData, TensorTable};
pub use binary_model::{BinaryModel, ModelSection};
pub use config::{ModelConfig, SaveMode, SessionConfig};
pub use graph::{GraphBackend, GraphData};

use crate::error::{io_context, ShlError, ShlResult};
use crate::ops::OpKind;
use crate::params::{OpParams, Params};
use crate::registry::{KernelContext, Registry};
use crate::tensor::{Buffer, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identity, recorded on tensors and params the
/// session allocates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Index of a tensor in a session's tensor table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    TensorsBound,
    Setup,
    ReadyToRun,
    Deinitialized,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initialized => "initialized",
            SessionState::TensorsBound => "tensors bound",
            SessionState::Setup => "setup",
            SessionState::ReadyToRun => "ready to run",
            SessionState::Deinitialized => "deinitialized",
        };
        f.write_str(s)
    }
}

use SessionState::*;

/// States in which the tensor table exists
const LIVE: &[SessionState] = &[Initialized, TensorsBound, Setup, ReadyToRun];
/// States in which every input and output is bound
const BOUND: &[SessionState] = &[TensorsBound, Setup, ReadyToRun];

pub struct Session {
    id: SessionId,
    config: SessionConfig,
    state: SessionState,
    registry: Arc<Registry>,
    backend: Option<Arc<dyn SessionBackend>>,
    td: Option<Box<dyn TargetData>>,
    inputs: Vec<Option<TensorId>>,
    outputs: Vec<Option<TensorId>>,
    ctx: KernelContext,
}

/// Create an uninitialized session
pub fn alloc_session(registry: Arc<Registry>, config: SessionConfig) -> Session {
    Session::new(registry, config)
}

impl Session {
    pub fn new(registry: Arc<Registry>, config: SessionConfig) -> Self {
        let id = SessionId::next();
        tracing::debug!("session {} allocated ({} {})", id.0, config.base_api, config.base_run_mode);
        Session {
            id,
            config,
            state: Uninitialized,
            registry,
            backend: None,
            td: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            ctx: KernelContext::serial(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Kernel context for layer-mode invocations
    pub fn context_mut(&mut self) -> &mut KernelContext {
        &mut self.ctx
    }

    pub fn target_data(&self) -> Option<&dyn TargetData> {
        self.td.as_deref()
    }

    pub fn is_graph(&self) -> bool {
        self.config.base_run_mode.is_graph()
    }

    fn expect_state(&self, op: &str, allowed: &[SessionState]) -> ShlResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ShlError::invalid_state(op, self.state))
        }
    }

    fn td(&self) -> ShlResult<&dyn TargetData> {
        self.td
            .as_deref()
            .ok_or_else(|| ShlError::invalid_state("target data", self.state))
    }

    fn td_mut(&mut self) -> ShlResult<&mut Box<dyn TargetData>> {
        let state = self.state;
        self.td
            .as_mut()
            .ok_or_else(|| ShlError::invalid_state("target data", state))
    }

    /// Validate the config, apply its debug level and create the tensor
    /// table. Graph modes resolve their backend and acquire a graph handle.
    pub fn init(&mut self) -> ShlResult<()> {
        self.expect_state("init", &[Uninitialized])?;
        self.config.validate()?;
        crate::logging::set_debug_level(self.config.debug_level);

        let td = if self.is_graph() {
            let (api, run_mode) = (self.config.base_api, self.config.base_run_mode);
            let backend = self.registry.session_backend(api, run_mode).ok_or_else(|| {
                ShlError::BackendUnavailable(format!("no session backend for {} {}", api, run_mode))
            })?;
            let td = backend.create_target_data(&self.config)?;
            tracing::debug!("session {} uses backend {}", self.id.0, backend.name());
            self.backend = Some(backend);
            td
        } else {
            Box::new(TensorTable::new()) as Box<dyn TargetData>
        };
        self.td = Some(td);
        self.ctx = KernelContext::with_threads(self.config.num_threads);
        self.state = Initialized;
        Ok(())
    }

    pub fn set_input_number(&mut self, n: usize) -> ShlResult<()> {
        self.expect_state("set_input_number", &[Initialized, TensorsBound])?;
        self.inputs = vec![None; n];
        self.refresh_bound();
        Ok(())
    }

    pub fn set_output_number(&mut self, n: usize) -> ShlResult<()> {
        self.expect_state("set_output_number", &[Initialized, TensorsBound])?;
        self.outputs = vec![None; n];
        self.refresh_bound();
        Ok(())
    }

    pub fn get_input_number(&self) -> usize {
        self.inputs.len()
    }

    pub fn get_output_number(&self) -> usize {
        self.outputs.len()
    }

    /// Store `tensor` in the session's table
    pub fn add_tensor(&mut self, mut tensor: Tensor) -> ShlResult<TensorId> {
        self.expect_state("add_tensor", &[Initialized, TensorsBound])?;
        tensor.session = Some(self.id);
        Ok(self.td_mut()?.add_tensor(tensor))
    }

    pub fn set_tensor_entry(&mut self, id: TensorId) -> ShlResult<()> {
        self.expect_state("set_tensor_entry", &[Initialized, TensorsBound])?;
        self.td_mut()?.set_tensor_entry(id)
    }

    pub fn set_input(&mut self, index: usize, id: TensorId) -> ShlResult<()> {
        self.expect_state("set_input", &[Initialized, TensorsBound])?;
        self.td()?.tensor(id)?;
        let len = self.inputs.len();
        let slot = self
            .inputs
            .get_mut(index)
            .ok_or(ShlError::IndexOutOfRange { index, len })?;
        *slot = Some(id);
        self.refresh_bound();
        Ok(())
    }

    pub fn set_output(&mut self, index: usize, id: TensorId) -> ShlResult<()> {
        self.expect_state("set_output", &[Initialized, TensorsBound])?;
        self.td()?.tensor(id)?;
        let len = self.outputs.len();
        let slot = self
            .outputs
            .get_mut(index)
            .ok_or(ShlError::IndexOutOfRange { index, len })?;
        *slot = Some(id);
        self.refresh_bound();
        Ok(())
    }

    /// Record a graph node. Layer-mode sessions report `Unsupported`.
    pub fn add_node(
        &mut self,
        op: OpKind,
        mut params: OpParams,
        inputs: &[TensorId],
        output: TensorId,
    ) -> ShlResult<()> {
        self.expect_state("add_node", &[Initialized, TensorsBound])?;
        if !self.is_graph() {
            return Err(ShlError::Unsupported(format!(
                "add_node in {} mode",
                self.config.base_run_mode
            )));
        }
        params.base_mut().session = Some(self.id);
        self.td_mut()?.add_node(op, params, inputs, output)
    }

    /// Bind kernels to every graph node. Layer mode only changes state.
    pub fn setup(&mut self) -> ShlResult<()> {
        self.expect_state("setup", &[TensorsBound])?;
        if self.is_graph() {
            let registry = Arc::clone(&self.registry);
            self.td_mut()?.setup(&registry)?;
        }
        self.state = Setup;
        if matches!(self.config.model.save_mode, SaveMode::SaveOnly | SaveMode::SaveAndRun) {
            if let Some(path) = self.config.model.path.clone() {
                let bytes = self.dump_binary_model()?;
                std::fs::write(&path, bytes)
                    .map_err(|e| io_context(e, &format!("writing binary model {}", path.display())))?;
                tracing::debug!("session {} saved to {}", self.id.0, path.display());
            }
        }
        Ok(())
    }

    /// Execute the graph once
    pub fn run(&mut self) -> ShlResult<()> {
        if !self.is_graph() {
            return Err(ShlError::invalid_state("run", "layer mode"));
        }
        self.expect_state("run", &[Setup, ReadyToRun])?;
        if self.config.model.save_mode == SaveMode::SaveOnly {
            tracing::debug!("session {}: save-only model, run skipped", self.id.0);
            self.state = ReadyToRun;
            return Ok(());
        }
        let inputs = bound_ids(&self.inputs, "input")?;
        let outputs = bound_ids(&self.outputs, "output")?;
        let td = self
            .td
            .as_mut()
            .ok_or_else(|| ShlError::invalid_state("run", self.state))?;
        td.run(&mut self.ctx, &inputs, &outputs)?;
        self.state = ReadyToRun;
        Ok(())
    }

    /// Replace the data of bound input `index`; the shape stays as bound
    pub fn update_input(&mut self, index: usize, buffer: Buffer) -> ShlResult<()> {
        self.expect_state("update_input", BOUND)?;
        let id = slot_id(&self.inputs, index)?;
        self.td_mut()?.tensor_mut(id)?.set_data(buffer)
    }

    /// Replace the data of bound output `index`
    pub fn update_output(&mut self, index: usize, buffer: Buffer) -> ShlResult<()> {
        self.expect_state("update_output", BOUND)?;
        let id = slot_id(&self.outputs, index)?;
        self.td_mut()?.tensor_mut(id)?.set_data(buffer)
    }

    pub fn get_input(&self, index: usize) -> ShlResult<&Tensor> {
        self.expect_state("get_input", BOUND)?;
        self.td()?.tensor(slot_id(&self.inputs, index)?)
    }

    pub fn get_output(&self, index: usize) -> ShlResult<&Tensor> {
        self.expect_state("get_output", BOUND)?;
        self.td()?.tensor(slot_id(&self.outputs, index)?)
    }

    /// Tensor by id, for layer-mode callers that keep their own ids
    pub fn tensor(&self, id: TensorId) -> ShlResult<&Tensor> {
        self.expect_state("tensor", LIVE)?;
        self.td()?.tensor(id)
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> ShlResult<&mut Tensor> {
        self.expect_state("tensor_mut", LIVE)?;
        self.td_mut()?.tensor_mut(id)
    }

    /// Move output `index`'s buffer out to the caller
    pub fn take_output_data(&mut self, index: usize) -> ShlResult<Buffer> {
        self.expect_state("take_output_data", BOUND)?;
        let id = slot_id(&self.outputs, index)?;
        let tensor = self.td_mut()?.tensor_mut(id)?;
        let name = tensor.name.clone();
        tensor.take_data().ok_or(ShlError::MissingData(name))
    }

    /// Release the target data and the backend handle
    pub fn deinit(&mut self) -> ShlResult<()> {
        if self.state == Deinitialized {
            return Err(ShlError::invalid_state("deinit", self.state));
        }
        self.td = None;
        self.backend = None;
        self.inputs.clear();
        self.outputs.clear();
        self.ctx.arena.release_cached();
        self.state = Deinitialized;
        tracing::debug!("session {} deinitialized", self.id.0);
        Ok(())
    }

    /// Serialize the config, the bound descriptors and the backend blob
    pub fn dump_binary_model(&self) -> ShlResult<Vec<u8>> {
        self.expect_state("dump_binary_model", BOUND)?;
        let td = self.td()?;
        let input_ids = bound_ids(&self.inputs, "input")?;
        let output_ids = bound_ids(&self.outputs, "output")?;
        let describe = |ids: &[TensorId]| -> ShlResult<Vec<Tensor>> {
            ids.iter().map(|&id| Ok(td.tensor(id)?.descriptor())).collect()
        };
        let model = BinaryModel {
            section: ModelSection {
                version: binary_model::FORMAT_VERSION,
                config: self.config.clone(),
                inputs: describe(&input_ids)?,
                outputs: describe(&output_ids)?,
                input_ids,
                output_ids,
            },
            blob: if self.is_graph() { td.dump_blob()? } else { Vec::new() },
        };
        model.encode()
    }

    /// Load a binary model file into an initialized session through the
    /// backend's load hook
    pub fn load_binary_model(&mut self, path: impl AsRef<Path>) -> ShlResult<()> {
        self.expect_state("load_binary_model", &[Initialized])?;
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| io_context(e, &format!("reading binary model {}", path.display())))?;
        let model = BinaryModel::decode(&bytes)?;
        let backend = self.backend.clone().ok_or_else(|| {
            ShlError::Unsupported(format!(
                "{} sessions cannot load binary models",
                self.config.base_run_mode
            ))
        })?;
        self.td = Some(backend.load_binary_model(&model.blob)?);
        self.bind_model(&model.section)
    }

    fn bind_model(&mut self, section: &ModelSection) -> ShlResult<()> {
        self.set_input_number(section.input_ids.len())?;
        self.set_output_number(section.output_ids.len())?;
        for (i, &id) in section.input_ids.iter().enumerate() {
            self.set_input(i, id)?;
        }
        for (i, &id) in section.output_ids.iter().enumerate() {
            self.set_output(i, id)?;
        }
        Ok(())
    }

    /// Every input and output slot holds an id
    fn refresh_bound(&mut self) {
        let bound = !self.outputs.is_empty()
            && self.inputs.iter().all(Option::is_some)
            && self.outputs.iter().all(Option::is_some);
        self.state = if bound { TensorsBound } else { Initialized };
    }
}

/// Rebuild a session from [`Session::dump_binary_model`] output.
///
/// Graph models come back set up and ready to run. A stored save mode is
/// reset to run-only so importing never rewrites the file.
pub fn import_binary_model(registry: Arc<Registry>, bytes: &[u8]) -> ShlResult<Session> {
    let model = BinaryModel::decode(bytes)?;
    let mut config = model.section.config.clone();
    config.model.save_mode = SaveMode::RunOnly;
    let mut session = Session::new(registry, config);
    session.init()?;

    if model.blob.is_empty() {
        // descriptors only: rebuild the table in id order
        let mut described: Vec<(TensorId, Tensor)> = model
            .section
            .input_ids
            .iter()
            .copied()
            .zip(model.section.inputs.iter().cloned())
            .chain(
                model
                    .section
                    .output_ids
                    .iter()
                    .copied()
                    .zip(model.section.outputs.iter().cloned()),
            )
            .collect();
        described.sort_by_key(|(id, _)| id.0);
        described.dedup_by_key(|(id, _)| id.0);
        let mut remap = Vec::with_capacity(described.len());
        for (old, tensor) in described {
            remap.push((old, session.add_tensor(tensor)?));
        }
        let lookup = |old: &TensorId| -> ShlResult<TensorId> {
            remap
                .iter()
                .find(|(o, _)| o == old)
                .map(|(_, new)| *new)
                .ok_or_else(|| ShlError::InvalidModelFile(format!("unknown tensor {:?}", old)))
        };
        let section = ModelSection {
            input_ids: model.section.input_ids.iter().map(&lookup).collect::<ShlResult<_>>()?,
            output_ids: model.section.output_ids.iter().map(&lookup).collect::<ShlResult<_>>()?,
            ..model.section.clone()
        };
        session.bind_model(&section)?;
    } else {
        let backend = session.backend.clone().ok_or_else(|| {
            ShlError::InvalidModelFile("model carries a graph blob for a layer session".to_string())
        })?;
        session.td = Some(backend.load_binary_model(&model.blob)?);
        session.bind_model(&model.section)?;
    }

    if session.is_graph() && session.state == TensorsBound {
        session.setup()?;
    }
    Ok(session)
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.td.take().is_some() {
            tracing::trace!("session {} dropped while live", self.id.0);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id.0)
            .field("state", &self.state)
            .field("api", &self.config.base_api)
            .field("run_mode", &self.config.base_run_mode)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("td", &self.td)
            .finish()
    }
}

fn slot_id(slots: &[Option<TensorId>], index: usize) -> ShlResult<TensorId> {
    slots
        .get(index)
        .ok_or(ShlError::IndexOutOfRange {
            index,
            len: slots.len(),
        })?
        .ok_or_else(|| ShlError::MissingData(format!("slot {} is unbound", index)))
}

fn bound_ids(slots: &[Option<TensorId>], what: &str) -> ShlResult<Vec<TensorId>> {
    slots
        .iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| ShlError::MissingData(format!("{} {} is unbound", what, i))))
        .collect()
}

/// Tensor descriptor carrying the session's base dtype and layout
pub fn alloc_tensor(session: Option<&Session>) -> Tensor {
    let mut tensor = Tensor::default();
    if let Some(s) = session {
        tensor.dtype = s.config.base_dtype;
        tensor.layout = s.config.base_layout;
        tensor.session = Some(s.id);
    }
    tensor
}

/// Fill the dispatch header of `params` from the session's config
pub fn alloc_params(params: impl Into<OpParams>, session: Option<&Session>) -> OpParams {
    let mut params = params.into();
    if let Some(s) = session {
        let base = params.base_mut();
        base.api = s.config.base_api;
        base.layout = s.config.base_layout;
        base.run_mode = s.config.base_run_mode;
        base.quant_type = s.config.base_quant_type;
        base.session = Some(s.id);
        if let OpParams::Conv2d(conv) = &mut params {
            conv.winograd_tile = s.config.winograd_tile;
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Api, RunMode};
    use crate::params::{Conv2dParams, SisoParams, WinogradTile};
    use crate::tensor::{DType, Layout};

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::with_defaults())
    }

    fn graph_config() -> SessionConfig {
        SessionConfig::new()
            .with_run_mode(RunMode::CpuGraph)
            .with_num_threads(1)
    }

    fn vec4(name: &str) -> Tensor {
        Tensor::new(DType::Float32, &[1, 4], Layout::NC).unwrap().with_name(name)
    }

    /// Graph session computing `sigmoid(relu(x))`, bound but not set up
    fn relu_sigmoid(session: &mut Session) -> (TensorId, TensorId) {
        session.init().unwrap();
        session.set_input_number(1).unwrap();
        session.set_output_number(1).unwrap();
        let x = session.add_tensor(vec4("x")).unwrap();
        let mid = session.add_tensor(vec4("mid")).unwrap();
        let y = session.add_tensor(vec4("y")).unwrap();
        session.add_node(OpKind::Relu, SisoParams::default().into(), &[x], mid).unwrap();
        session.add_node(OpKind::Sigmoid, SisoParams::default().into(), &[mid], y).unwrap();
        session.set_input(0, x).unwrap();
        session.set_output(0, y).unwrap();
        (x, y)
    }

    #[test]
    fn test_ids_are_unique() {
        let r = registry();
        let a = Session::new(Arc::clone(&r), SessionConfig::new());
        let b = Session::new(r, SessionConfig::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_out_of_order_calls() {
        let mut s = alloc_session(registry(), graph_config());
        assert!(matches!(s.set_input_number(1), Err(ShlError::InvalidState { .. })));
        assert!(matches!(s.setup(), Err(ShlError::InvalidState { .. })));
        assert!(matches!(s.run(), Err(ShlError::InvalidState { .. })));

        s.init().unwrap();
        assert!(matches!(s.init(), Err(ShlError::InvalidState { .. })));
        assert!(matches!(s.setup(), Err(ShlError::InvalidState { .. })));
        assert!(matches!(s.get_input(0), Err(ShlError::InvalidState { .. })));
        assert_eq!(s.state(), Initialized);
    }

    #[test]
    fn test_graph_lifecycle() {
        let mut s = alloc_session(registry(), graph_config());
        relu_sigmoid(&mut s);
        assert_eq!(s.state(), TensorsBound);
        assert_eq!(s.target_data().unwrap().node_count(), 2);

        s.setup().unwrap();
        assert_eq!(s.state(), Setup);
        s.update_input(0, Buffer::F32(vec![-2.0, 0.0, 1.0, 3.0])).unwrap();
        s.run().unwrap();
        assert_eq!(s.state(), ReadyToRun);
        let y = s.get_output(0).unwrap().data::<f32>().unwrap().to_vec();
        assert_eq!(y[0], 0.5);
        assert!((y[2] - 0.731_058_6).abs() < 1e-6);

        s.update_input(0, Buffer::F32(vec![0.0; 4])).unwrap();
        s.run().unwrap();
        assert_eq!(s.get_output(0).unwrap().data::<f32>().unwrap(), &[0.5; 4]);
        assert!(s.add_tensor(vec4("late")).is_err());
    }

    #[test]
    fn test_update_input_checks_buffer() {
        let mut s = alloc_session(registry(), graph_config());
        relu_sigmoid(&mut s);
        s.setup().unwrap();
        assert!(matches!(
            s.update_input(0, Buffer::F32(vec![0.0; 3])),
            Err(ShlError::BufferSizeMismatch { .. })
        ));
        assert!(matches!(
            s.update_input(0, Buffer::I8(vec![0; 4])),
            Err(ShlError::DtypeMismatch { .. })
        ));
        assert!(matches!(
            s.update_input(3, Buffer::F32(vec![0.0; 4])),
            Err(ShlError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_set_input_index_out_of_range() {
        let mut s = alloc_session(registry(), SessionConfig::new().with_num_threads(1));
        s.init().unwrap();
        s.set_input_number(1).unwrap();
        let t = s.add_tensor(vec4("x")).unwrap();
        assert!(matches!(
            s.set_input(1, t),
            Err(ShlError::IndexOutOfRange { index: 1, len: 1 })
        ));
        assert!(s.set_input(0, TensorId(42)).is_err());
    }

    #[test]
    fn test_layer_mode() {
        let mut s = alloc_session(registry(), SessionConfig::new().with_num_threads(1));
        s.init().unwrap();
        s.set_input_number(1).unwrap();
        s.set_output_number(1).unwrap();
        let x = s.add_tensor(vec4("x")).unwrap();
        let y = s.add_tensor(vec4("y")).unwrap();
        assert_eq!(s.tensor(x).unwrap().session, Some(s.id()));
        assert!(matches!(
            s.add_node(OpKind::Relu, SisoParams::default().into(), &[x], y),
            Err(ShlError::Unsupported(_))
        ));
        s.set_input(0, x).unwrap();
        s.set_output(0, y).unwrap();
        s.setup().unwrap();
        assert_eq!(s.state(), Setup);
        assert!(matches!(s.run(), Err(ShlError::InvalidState { .. })));
    }

    #[test]
    fn test_take_output_data() {
        let mut s = alloc_session(registry(), graph_config());
        relu_sigmoid(&mut s);
        s.setup().unwrap();
        s.update_input(0, Buffer::F32(vec![0.0; 4])).unwrap();
        s.run().unwrap();
        let buf = s.take_output_data(0).unwrap();
        assert_eq!(buf.len(), 4);
        assert!(matches!(s.take_output_data(0), Err(ShlError::MissingData(_))));
    }

    #[test]
    fn test_deinit_releases_target_data() {
        let mut s = alloc_session(registry(), graph_config());
        relu_sigmoid(&mut s);
        s.deinit().unwrap();
        assert!(s.target_data().is_none());
        assert_eq!(s.state(), Deinitialized);
        assert!(matches!(s.deinit(), Err(ShlError::InvalidState { .. })));
        assert!(matches!(s.run(), Err(ShlError::InvalidState { .. })));
    }

    #[test]
    fn test_graph_without_backend() {
        let mut s = alloc_session(Arc::new(Registry::new()), graph_config());
        assert!(matches!(s.init(), Err(ShlError::BackendUnavailable(_))));
        assert_eq!(s.state(), Uninitialized);
    }

    #[test]
    fn test_alloc_from_session() {
        let config = SessionConfig::new()
            .with_api(Api::C906)
            .with_dtype(DType::Float16)
            .with_layout(Layout::NHWC)
            .with_winograd_tile(WinogradTile::F43);
        let s = Session::new(registry(), config);

        let t = alloc_tensor(Some(&s));
        assert_eq!((t.dtype, t.layout, t.session), (DType::Float16, Layout::NHWC, Some(s.id())));
        assert_eq!(alloc_tensor(None).session, None);

        let p = alloc_params(Conv2dParams::new(), Some(&s));
        assert_eq!(p.base().api, Api::C906);
        assert_eq!(p.base().session, Some(s.id()));
        assert_eq!(p.as_conv2d().unwrap().winograd_tile, WinogradTile::F43);
        assert_eq!(alloc_params(SisoParams::default(), None).base().api, Api::Ref);
    }

    #[test]
    fn test_binary_model_import_runs() {
        let mut s = alloc_session(registry(), graph_config());
        relu_sigmoid(&mut s);
        s.setup().unwrap();
        let bytes = s.dump_binary_model().unwrap();

        let mut imported = import_binary_model(registry(), &bytes).unwrap();
        assert_eq!(imported.state(), Setup);
        assert_eq!(imported.get_input(0).unwrap().name, "x");
        imported.update_input(0, Buffer::F32(vec![0.0; 4])).unwrap();
        imported.run().unwrap();
        assert_eq!(imported.get_output(0).unwrap().data::<f32>().unwrap(), &[0.5; 4]);
    }

    #[test]
    fn test_layer_model_import_rebuilds_descriptors() {
        let mut s = alloc_session(registry(), SessionConfig::new().with_num_threads(1));
        s.init().unwrap();
        s.set_input_number(1).unwrap();
        s.set_output_number(1).unwrap();
        let _unused = s.add_tensor(vec4("scratch")).unwrap();
        let x = s.add_tensor(vec4("x")).unwrap();
        let y = s.add_tensor(vec4("y")).unwrap();
        s.set_input(0, x).unwrap();
        s.set_output(0, y).unwrap();
        let bytes = s.dump_binary_model().unwrap();

        let imported = import_binary_model(registry(), &bytes).unwrap();
        assert_eq!(imported.state(), TensorsBound);
        assert_eq!(imported.get_output(0).unwrap().name, "y");
        assert!(imported.get_input(0).unwrap().data.is_none());
    }

    #[test]
    fn test_load_binary_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.shl");
        let config = graph_config().with_model_path(&path);
        let mut config_save = config.clone();
        config_save.model.save_mode = SaveMode::SaveOnly;

        let mut saver = alloc_session(registry(), config_save);
        relu_sigmoid(&mut saver);
        saver.setup().unwrap();
        saver.run().unwrap();
        assert!(path.exists());

        let mut loader = alloc_session(registry(), config);
        loader.init().unwrap();
        loader.load_binary_model(&path).unwrap();
        assert_eq!(loader.state(), TensorsBound);
        loader.setup().unwrap();
        loader.update_input(0, Buffer::F32(vec![0.0; 4])).unwrap();
        loader.run().unwrap();
        assert_eq!(loader.get_output(0).unwrap().data::<f32>().unwrap(), &[0.5; 4]);

        let mut layer = alloc_session(registry(), SessionConfig::new().with_num_threads(1));
        layer.init().unwrap();
        assert!(matches!(layer.load_binary_model(&path), Err(ShlError::Unsupported(_))));
    }
}
