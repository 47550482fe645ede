//! Session backends and the state they own
//!
//! A [`SessionBackend`] is registered per `(api, run mode)` and creates the
//! [`TargetData`] a session holds between `init` and `deinit`. Layer mode
//! needs no backend; its sessions own a plain [`TensorTable`].

use super::config::SessionConfig;
use super::TensorId;
use crate::error::{ShlError, ShlResult};
use crate::ops::OpKind;
use crate::params::OpParams;
use crate::registry::{KernelContext, Registry};
use crate::tensor::Tensor;
use std::fmt;

/// Factory for per-session backend state
pub trait SessionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Fresh state for a session that is being initialized
    fn create_target_data(&self, config: &SessionConfig) -> ShlResult<Box<dyn TargetData>>;

    /// Rebuild state from the opaque blob of a binary model
    fn load_binary_model(&self, _blob: &[u8]) -> ShlResult<Box<dyn TargetData>> {
        Err(ShlError::Unsupported(format!(
            "{} cannot load binary models",
            self.name()
        )))
    }
}

/// State owned by one session: the tensor table and, for graph backends,
/// the recorded nodes.
pub trait TargetData: Send + fmt::Debug {
    fn add_tensor(&mut self, tensor: Tensor) -> TensorId;

    fn tensor(&self, id: TensorId) -> ShlResult<&Tensor>;

    fn tensor_mut(&mut self, id: TensorId) -> ShlResult<&mut Tensor>;

    fn tensor_count(&self) -> usize;

    /// Mark a tensor as a graph entry (constant or external input)
    fn set_tensor_entry(&mut self, id: TensorId) -> ShlResult<()>;

    fn add_node(
        &mut self,
        op: OpKind,
        _params: OpParams,
        _inputs: &[TensorId],
        _output: TensorId,
    ) -> ShlResult<()> {
        Err(ShlError::Unsupported(format!("{} node outside a graph session", op)))
    }

    fn node_count(&self) -> usize {
        0
    }

    /// Resolve kernels ahead of the first run
    fn setup(&mut self, _registry: &Registry) -> ShlResult<()> {
        Ok(())
    }

    fn run(
        &mut self,
        ctx: &mut KernelContext,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> ShlResult<()>;

    /// Opaque snapshot stored in binary models; empty when there is
    /// nothing beyond the input/output descriptors
    fn dump_blob(&self) -> ShlResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Tensor storage of a layer-mode session
#[derive(Debug, Default)]
pub struct TensorTable {
    tensors: Vec<Tensor>,
    entries: Vec<TensorId>,
}

impl TensorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TensorId] {
        &self.entries
    }
}

impl TargetData for TensorTable {
    fn add_tensor(&mut self, tensor: Tensor) -> TensorId {
        self.tensors.push(tensor);
        TensorId(self.tensors.len() - 1)
    }

    fn tensor(&self, id: TensorId) -> ShlResult<&Tensor> {
        let len = self.tensors.len();
        self.tensors
            .get(id.0)
            .ok_or(ShlError::IndexOutOfRange { index: id.0, len })
    }

    fn tensor_mut(&mut self, id: TensorId) -> ShlResult<&mut Tensor> {
        let len = self.tensors.len();
        self.tensors
            .get_mut(id.0)
            .ok_or(ShlError::IndexOutOfRange { index: id.0, len })
    }

    fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    fn set_tensor_entry(&mut self, id: TensorId) -> ShlResult<()> {
        self.tensor(id)?;
        if !self.entries.contains(&id) {
            self.entries.push(id);
        }
        Ok(())
    }

    fn run(&mut self, _ctx: &mut KernelContext, _inputs: &[TensorId], _outputs: &[TensorId]) -> ShlResult<()> {
        Err(ShlError::invalid_state("run", "layer mode"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, Layout};

    #[test]
    fn test_tensor_table_ids() {
        let mut table = TensorTable::new();
        let a = table.add_tensor(Tensor::new(DType::Float32, &[2], Layout::N).unwrap());
        let b = table.add_tensor(Tensor::new(DType::Int8, &[3], Layout::N).unwrap());
        assert_eq!((a, b), (TensorId(0), TensorId(1)));
        assert_eq!(table.tensor(b).unwrap().dtype, DType::Int8);
        assert_eq!(table.tensor_count(), 2);

        let err = table.tensor(TensorId(5)).unwrap_err();
        assert!(matches!(err, ShlError::IndexOutOfRange { index: 5, len: 2 }));
    }

    #[test]
    fn test_entries_deduplicate() {
        let mut table = TensorTable::new();
        let a = table.add_tensor(Tensor::default());
        table.set_tensor_entry(a).unwrap();
        table.set_tensor_entry(a).unwrap();
        assert_eq!(table.entries(), &[a]);
        assert!(table.set_tensor_entry(TensorId(9)).is_err());
    }

    #[test]
    fn test_layer_table_has_no_graph() {
        let mut table = TensorTable::new();
        let a = table.add_tensor(Tensor::default());
        let params = OpParams::from(crate::params::SisoParams::default());
        let err = table.add_node(OpKind::Relu, params, &[a], a).unwrap_err();
        assert!(matches!(err, ShlError::Unsupported(_)));
        let mut ctx = KernelContext::serial();
        assert!(matches!(
            table.run(&mut ctx, &[a], &[a]),
            Err(ShlError::InvalidState { .. })
        ));
    }
}
