//! CPU graph reference backend
//!
//! Nodes are recorded in call order and executed in that order. Setup binds
//! a kernel to every node through the regular operator init path, so graph
//! nodes run the same layer kernels a caller would invoke directly.
//! Convolution nodes go through the convolution checks and are re-routed
//! to depthwise or group convolution when their shape says so.
//! Intermediate buffers are allocated right before their producer runs and
//! released once their last consumer has run. Tensors no node produces
//! belong to the caller and are never released.

use super::backend::{SessionBackend, TargetData};
use super::config::SessionConfig;
use super::TensorId;
use crate::backend::{Api, RunMode};
use crate::error::{ShlError, ShlResult};
use crate::ops::{conv_node_init, op_init, op_invoke, OpKind};
use crate::params::{OpParams, Params};
use crate::registry::{KernelContext, Registry};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One recorded operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub op: OpKind,
    pub params: OpParams,
    pub inputs: Vec<TensorId>,
    pub output: TensorId,
}

/// Graph handle owned by a CPU graph session
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GraphData {
    tensors: Vec<Tensor>,
    nodes: Vec<Node>,
    entries: Vec<TensorId>,
    /// Consumer count per tensor, computed by setup
    #[serde(skip)]
    consumers: Vec<usize>,
    /// Tensors some node produces; only their buffers belong to the graph
    #[serde(skip)]
    owned: Vec<bool>,
    #[serde(skip)]
    ready: bool,
}

impl GraphData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    fn check_id(&self, id: TensorId) -> ShlResult<()> {
        if id.0 < self.tensors.len() {
            Ok(())
        } else {
            Err(ShlError::IndexOutOfRange {
                index: id.0,
                len: self.tensors.len(),
            })
        }
    }

    /// Every id a node or entry refers to must exist
    fn check_references(&self) -> ShlResult<()> {
        for node in &self.nodes {
            for &id in node.inputs.iter().chain(std::iter::once(&node.output)) {
                self.check_id(id)?;
            }
        }
        self.entries.iter().try_for_each(|&id| self.check_id(id))
    }

    /// Tensors whose buffers survive between nodes
    fn is_pinned(&self, id: TensorId, inputs: &[TensorId], outputs: &[TensorId]) -> bool {
        !self.owned.get(id.0).copied().unwrap_or(false)
            || self.entries.contains(&id)
            || inputs.contains(&id)
            || outputs.contains(&id)
            || self.tensors.get(id.0).is_some_and(|t| t.is_const)
    }
}

impl TargetData for GraphData {
    fn add_tensor(&mut self, tensor: Tensor) -> TensorId {
        self.tensors.push(tensor);
        self.ready = false;
        TensorId(self.tensors.len() - 1)
    }

    fn tensor(&self, id: TensorId) -> ShlResult<&Tensor> {
        self.check_id(id)?;
        Ok(&self.tensors[id.0])
    }

    fn tensor_mut(&mut self, id: TensorId) -> ShlResult<&mut Tensor> {
        self.check_id(id)?;
        Ok(&mut self.tensors[id.0])
    }

    fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    fn set_tensor_entry(&mut self, id: TensorId) -> ShlResult<()> {
        self.check_id(id)?;
        if !self.entries.contains(&id) {
            self.entries.push(id);
        }
        Ok(())
    }

    fn add_node(
        &mut self,
        op: OpKind,
        params: OpParams,
        inputs: &[TensorId],
        output: TensorId,
    ) -> ShlResult<()> {
        for &id in inputs {
            self.check_id(id)?;
        }
        self.check_id(output)?;
        if inputs.contains(&output) {
            return Err(ShlError::InvalidParam(format!(
                "{} node writes its own input {:?}",
                op, output
            )));
        }
        self.nodes.push(Node {
            op,
            params,
            inputs: inputs.to_vec(),
            output,
        });
        self.ready = false;
        Ok(())
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn setup(&mut self, registry: &Registry) -> ShlResult<()> {
        let GraphData {
            tensors,
            nodes,
            consumers,
            owned,
            ..
        } = self;

        for (index, node) in nodes.iter_mut().enumerate() {
            let base = node.params.base_mut();
            if base.api == Api::Gref {
                base.api = Api::Ref;
            }
            base.run_mode = RunMode::CpuGraph;
            let inputs: Vec<&Tensor> = node.inputs.iter().map(|id| &tensors[id.0]).collect();
            let output = &tensors[node.output.0];
            let bound = if node.op.is_conv() {
                conv_node_init(registry, node.op, &inputs, output, &mut node.params).map(|routed| {
                    if routed != node.op {
                        tracing::debug!("graph node {}: {} routed to {}", index, node.op, routed);
                        node.op = routed;
                    }
                })
            } else {
                op_init(registry, node.op, &inputs, output, &mut node.params).map(|_| ())
            };
            bound.map_err(|e| {
                tracing::warn!("graph node {} ({}) failed setup: {}", index, node.op, e);
                e
            })?;
        }

        owned.clear();
        owned.resize(tensors.len(), false);
        for node in nodes.iter() {
            owned[node.output.0] = true;
        }

        consumers.clear();
        consumers.resize(tensors.len(), 0);
        for node in nodes.iter() {
            for id in &node.inputs {
                consumers[id.0] += 1;
            }
        }
        self.ready = true;
        tracing::debug!(
            "graph setup: {} nodes over {} tensors",
            self.nodes.len(),
            self.tensors.len()
        );
        Ok(())
    }

    fn run(
        &mut self,
        ctx: &mut KernelContext,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> ShlResult<()> {
        if !self.ready {
            return Err(ShlError::invalid_state("graph run", "nodes added since setup"));
        }
        for &id in inputs {
            let t = self.tensor(id)?;
            if t.data.is_none() {
                return Err(ShlError::MissingData(format!("graph input '{}'", t.name)));
            }
        }

        let mut remaining = self.consumers.clone();
        for index in 0..self.nodes.len() {
            let out_id = self.nodes[index].output;
            let mut out = std::mem::take(&mut self.tensors[out_id.0]);
            let result = {
                let node = &self.nodes[index];
                let args: Vec<&Tensor> = node.inputs.iter().map(|id| &self.tensors[id.0]).collect();
                op_invoke(ctx, &args, &mut out, &node.params)
            };
            self.tensors[out_id.0] = out;
            result?;

            for k in 0..self.nodes[index].inputs.len() {
                let id = self.nodes[index].inputs[k];
                remaining[id.0] = remaining[id.0].saturating_sub(1);
                if remaining[id.0] == 0 && !self.is_pinned(id, inputs, outputs) {
                    tracing::trace!("graph: release intermediate {:?}", id);
                    self.tensors[id.0].take_data();
                }
            }
        }
        Ok(())
    }

    fn dump_blob(&self) -> ShlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Session backend for the CPU graph run mode
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphBackend;

impl SessionBackend for GraphBackend {
    fn name(&self) -> &str {
        "gref"
    }

    fn create_target_data(&self, config: &SessionConfig) -> ShlResult<Box<dyn TargetData>> {
        tracing::debug!("gref: new graph for {} {}", config.base_api, config.base_dtype);
        Ok(Box::new(GraphData::new()))
    }

    fn load_binary_model(&self, blob: &[u8]) -> ShlResult<Box<dyn TargetData>> {
        let graph: GraphData = serde_json::from_slice(blob)
            .map_err(|e| ShlError::InvalidModelFile(format!("graph blob: {}", e)))?;
        graph
            .check_references()
            .map_err(|e| ShlError::InvalidModelFile(format!("graph blob: {}", e)))?;
        tracing::debug!("gref: loaded {} nodes", graph.nodes.len());
        Ok(Box::new(graph))
    }
}

/// Register the graph backend. Every api runs its CPU graph through it.
pub fn register(registry: &mut Registry) {
    registry.register_session_backend(Api::Gref, RunMode::CpuGraph, Arc::new(GraphBackend));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Conv2dParams, DisoParams, SisoParams};
    use crate::tensor::{DType, Layout};

    fn t(name: &str) -> Tensor {
        Tensor::new(DType::Float32, &[1, 4], Layout::NC).unwrap().with_name(name)
    }

    /// x -> relu -> a; (a, y) -> add -> out
    fn relu_add() -> (GraphData, [TensorId; 4]) {
        let mut g = GraphData::new();
        let x = g.add_tensor(t("x"));
        let y = g.add_tensor(Tensor::from_f32(&[1, 4], Layout::NC, vec![1.0; 4]).unwrap().with_const(true));
        let a = g.add_tensor(t("a"));
        let out = g.add_tensor(t("out"));
        g.set_tensor_entry(y).unwrap();
        g.add_node(OpKind::Relu, SisoParams::default().into(), &[x], a).unwrap();
        g.add_node(OpKind::Add, DisoParams::default().into(), &[a, y], out).unwrap();
        (g, [x, y, a, out])
    }

    #[test]
    fn test_setup_binds_every_node() {
        let registry = Registry::with_defaults();
        let (mut g, _) = relu_add();
        g.setup(&registry).unwrap();
        assert!(g.nodes().iter().all(|n| n.params.base().callback.is_some()));
        assert_eq!(g.consumers, vec![1, 1, 1, 0]);
    }

    #[test]
    fn test_run_releases_intermediates() {
        let registry = Registry::with_defaults();
        let (mut g, [x, _, a, out]) = relu_add();
        g.setup(&registry).unwrap();
        g.tensor_mut(x)
            .unwrap()
            .set_data(crate::tensor::Buffer::F32(vec![-1.0, 2.0, -3.0, 4.0]))
            .unwrap();

        let mut ctx = KernelContext::serial();
        g.run(&mut ctx, &[x], &[out]).unwrap();
        assert_eq!(g.tensor(out).unwrap().data::<f32>().unwrap(), &[1.0, 3.0, 1.0, 5.0]);
        assert!(g.tensor(a).unwrap().data.is_none());
        assert!(g.tensor(x).unwrap().data.is_some());
    }

    #[test]
    fn test_run_requires_input_data() {
        let registry = Registry::with_defaults();
        let (mut g, [x, _, _, out]) = relu_add();
        g.setup(&registry).unwrap();
        let mut ctx = KernelContext::serial();
        assert!(matches!(
            g.run(&mut ctx, &[x], &[out]),
            Err(ShlError::MissingData(_))
        ));
    }

    #[test]
    fn test_node_added_after_setup_needs_setup() {
        let registry = Registry::with_defaults();
        let (mut g, [x, _, a, _]) = relu_add();
        g.setup(&registry).unwrap();
        let extra = g.add_tensor(t("extra"));
        g.add_node(OpKind::Sigmoid, SisoParams::default().into(), &[a], extra).unwrap();
        let mut ctx = KernelContext::serial();
        assert!(matches!(
            g.run(&mut ctx, &[x], &[extra]),
            Err(ShlError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_add_node_checks_ids() {
        let mut g = GraphData::new();
        let x = g.add_tensor(t("x"));
        let err = g
            .add_node(OpKind::Relu, SisoParams::default().into(), &[x], TensorId(7))
            .unwrap_err();
        assert!(matches!(err, ShlError::IndexOutOfRange { .. }));
        assert!(g.add_node(OpKind::Relu, SisoParams::default().into(), &[x], x).is_err());
    }

    #[test]
    fn test_blob_reload() {
        let registry = Registry::with_defaults();
        let (g, [x, _, _, out]) = relu_add();
        let blob = g.dump_blob().unwrap();

        let mut loaded = GraphBackend.load_binary_model(&blob).unwrap();
        assert_eq!(loaded.node_count(), 2);
        loaded.setup(&registry).unwrap();
        loaded
            .tensor_mut(x)
            .unwrap()
            .set_data(crate::tensor::Buffer::F32(vec![0.5; 4]))
            .unwrap();
        let mut ctx = KernelContext::serial();
        loaded.run(&mut ctx, &[x], &[out]).unwrap();
        assert_eq!(loaded.tensor(out).unwrap().data::<f32>().unwrap(), &[1.5; 4]);

        assert!(matches!(
            GraphBackend.load_binary_model(b"not json"),
            Err(ShlError::InvalidModelFile(_))
        ));
    }

    /// x[1,c,h,h] (*) k -> out[1,o,oh,oh], with a const kernel of ones
    fn conv_graph(c: usize, kernel_dims: &[usize], out_dims: &[usize]) -> (GraphData, TensorId, TensorId) {
        let mut g = GraphData::new();
        let x = g.add_tensor(Tensor::new(DType::Float32, &[1, c, 4, 4], Layout::NCHW).unwrap());
        let k_len = kernel_dims.iter().product();
        let k = g.add_tensor(
            Tensor::from_f32(kernel_dims, Layout::OIHW, vec![1.0; k_len])
                .unwrap()
                .with_const(true),
        );
        let out = g.add_tensor(Tensor::new(DType::Float32, out_dims, Layout::NCHW).unwrap());
        g.add_node(OpKind::Conv2d, Conv2dParams::new().into(), &[x, k], out).unwrap();
        (g, x, out)
    }

    #[test]
    fn test_setup_rejects_conv_channel_mismatch() {
        let registry = Registry::with_defaults();
        let (mut g, _, _) = conv_graph(4, &[4, 8, 3, 3], &[1, 4, 2, 2]);
        assert!(matches!(g.setup(&registry), Err(ShlError::InvalidShape(_))));
        assert!(g.nodes()[0].params.base().callback.is_none());
    }

    #[test]
    fn test_setup_rejects_conv_output_shape() {
        let registry = Registry::with_defaults();
        // 4x4 input, 3x3 kernel, no padding: the output is 2x2
        let (mut g, _, _) = conv_graph(1, &[1, 1, 3, 3], &[1, 1, 4, 4]);
        assert!(matches!(g.setup(&registry), Err(ShlError::InvalidShape(_))));

        let (mut g, x, out) = conv_graph(1, &[1, 1, 3, 3], &[1, 1, 2, 2]);
        g.setup(&registry).unwrap();
        g.tensor_mut(x)
            .unwrap()
            .set_data(crate::tensor::Buffer::F32(vec![1.0; 16]))
            .unwrap();
        let mut ctx = KernelContext::serial();
        g.run(&mut ctx, &[x], &[out]).unwrap();
        assert_eq!(g.tensor(out).unwrap().data::<f32>().unwrap(), &[9.0; 4]);
    }

    #[test]
    fn test_setup_routes_depthwise_node() {
        let registry = Registry::with_defaults();
        let mut g = GraphData::new();
        let x = g.add_tensor(Tensor::new(DType::Float32, &[1, 4, 4, 4], Layout::NCHW).unwrap());
        let k = g.add_tensor(
            Tensor::from_f32(&[4, 1, 3, 3], Layout::OIHW, vec![1.0; 36])
                .unwrap()
                .with_const(true),
        );
        let out = g.add_tensor(Tensor::new(DType::Float32, &[1, 4, 2, 2], Layout::NCHW).unwrap());
        g.add_node(OpKind::Conv2d, Conv2dParams::new().with_group(4).into(), &[x, k], out)
            .unwrap();
        g.setup(&registry).unwrap();
        assert_eq!(g.nodes()[0].op, OpKind::DepthwiseConv2d);
    }

    #[test]
    fn test_caller_buffers_survive_runs() {
        let registry = Registry::with_defaults();
        let mut g = GraphData::new();
        let x = g.add_tensor(t("x"));
        // weights with data, neither const nor an entry
        let w = g.add_tensor(Tensor::from_f32(&[1, 4], Layout::NC, vec![1.0; 4]).unwrap());
        let a = g.add_tensor(t("a"));
        let out = g.add_tensor(t("out"));
        g.add_node(OpKind::Relu, SisoParams::default().into(), &[x], a).unwrap();
        g.add_node(OpKind::Add, DisoParams::default().into(), &[a, w], out).unwrap();
        g.setup(&registry).unwrap();

        let mut ctx = KernelContext::serial();
        for (value, expected) in [(2.0, 3.0), (-2.0, 1.0)] {
            g.tensor_mut(x)
                .unwrap()
                .set_data(crate::tensor::Buffer::F32(vec![value; 4]))
                .unwrap();
            g.run(&mut ctx, &[x], &[out]).unwrap();
            assert_eq!(g.tensor(out).unwrap().data::<f32>().unwrap(), &[expected; 4]);
            assert!(g.tensor(w).unwrap().data.is_some());
            assert!(g.tensor(a).unwrap().data.is_none());
        }
    }
}
