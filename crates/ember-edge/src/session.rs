//! Inference session: compiles a model once and runs the full kernel list.

use ember_core::{EmberError, Result, Shape, Tensor};
use ember_kernels::{KernelRegistry, TensorId, Workspace};

use crate::compiler::{compile_graph, CompiledGraph, OutputNodeMap, OutputTensorMap};
use crate::context::Context;
use crate::executor::{Executor, KernelCallBack};
use crate::model::Model;

/// A compiled graph plus the resources needed to run it.
pub struct LiteSession {
    pub(crate) context: Option<Context>,
    pub(crate) pool: Option<rayon::ThreadPool>,
    pub(crate) graph: Option<CompiledGraph>,
    pub(crate) model: Option<Model>,
    pub(crate) workspace: Workspace,
    pub(crate) output_node_map: OutputNodeMap,
    pub(crate) output_tensor_map: OutputTensorMap,
    /// Flat output list, rebuilt from `output_node_map` on every run.
    pub(crate) outputs: Vec<TensorId>,
}

impl Default for LiteSession {
    fn default() -> Self {
        Self::new()
    }
}

impl LiteSession {
    /// A session without an execution context. Compiling or running it fails
    /// with [`EmberError::NullContext`].
    pub fn new() -> Self {
        Self {
            context: None,
            pool: None,
            graph: None,
            model: None,
            workspace: Workspace::default(),
            output_node_map: OutputNodeMap::new(),
            output_tensor_map: OutputTensorMap::new(),
            outputs: Vec::new(),
        }
    }

    /// A session bound to a validated context, with its worker pool started.
    pub fn create(context: Context) -> Result<Self> {
        context.validate()?;
        let pool = context.build_pool()?;
        tracing::info!(threads = context.thread_num, device = ?context.target, "session created");
        Ok(Self {
            context: Some(context),
            pool,
            ..Self::new()
        })
    }

    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    pub(crate) fn require_context(&self) -> Result<&Context> {
        self.context.as_ref().ok_or(EmberError::NullContext)
    }

    pub(crate) fn graph(&self) -> Result<&CompiledGraph> {
        self.graph.as_ref().ok_or(EmberError::NotCompiled)
    }

    /// Compile `model` with the registry as is.
    pub fn compile_graph(&mut self, model: Model, registry: &KernelRegistry) -> Result<()> {
        let context = self.require_context()?.clone();
        let graph = compile_graph(&model, registry, &context)?;
        self.install(model, graph);
        Ok(())
    }

    /// Take ownership of a freshly compiled graph and size the workspace for it.
    pub(crate) fn install(&mut self, model: Model, graph: CompiledGraph) {
        let ws = graph.max_workspace_size();
        self.output_node_map = graph.output_node_map.clone();
        self.output_tensor_map = graph.output_tensor_map.clone();
        self.outputs.clear();
        self.workspace = Workspace::new(ws);
        tracing::info!(
            model = %model.name,
            kernels = graph.kernels.len(),
            tensors = graph.tensors.len(),
            workspace = ws,
            "graph compiled"
        );
        self.graph = Some(graph);
        self.model = Some(model);
    }

    /// Run every kernel.
    pub fn run_graph(
        &mut self,
        before: Option<&mut KernelCallBack<'_>>,
        after: Option<&mut KernelCallBack<'_>>,
    ) -> Result<()> {
        self.require_context()?;
        let count = self.graph()?.kernels.len();
        self.execute(count, before, after)
    }

    /// Rebuild the flat output list and run the first `kernel_count` kernels.
    pub(crate) fn execute(
        &mut self,
        kernel_count: usize,
        before: Option<&mut KernelCallBack<'_>>,
        after: Option<&mut KernelCallBack<'_>>,
    ) -> Result<()> {
        self.require_context()?;
        self.outputs = self.output_node_map.values().flatten().copied().collect();
        let graph = self.graph.as_mut().ok_or(EmberError::NotCompiled)?;
        let n = kernel_count.min(graph.kernels.len());
        let kernels = &mut graph.kernels[..n];
        tracing::debug!(kernels = kernels.len(), outputs = self.outputs.len(), "run graph");
        Executor::new(&mut graph.tensors, &mut self.workspace, self.pool.as_ref()).run(
            &graph.inputs,
            &self.outputs,
            kernels,
            before,
            after,
        )
    }

    /// Re-shape graph inputs and re-derive every kernel's shape-dependent state.
    pub fn resize(&mut self, input_shapes: &[Shape]) -> Result<()> {
        let graph = self.graph.as_mut().ok_or(EmberError::NotCompiled)?;
        if input_shapes.len() != graph.inputs.len() {
            return Err(EmberError::param(format!(
                "resize got {} shapes for {} inputs",
                input_shapes.len(),
                graph.inputs.len()
            )));
        }
        for (&id, shape) in graph.inputs.iter().zip(input_shapes) {
            let t = &mut graph.tensors[id];
            t.set_shape(shape.clone());
            t.ensure_bound();
        }
        for node in graph.kernels.iter_mut() {
            node.kernel.resize(&mut graph.tensors)?;
        }
        let needed = graph.max_workspace_size();
        if self.workspace.grow(needed) {
            tracing::info!(workspace = needed, "workspace grown after resize");
        }
        Ok(())
    }

    pub fn inputs(&self) -> &[TensorId] {
        self.graph.as_ref().map(|g| g.inputs.as_slice()).unwrap_or(&[])
    }

    /// Outputs of the last run, in output-map order.
    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn output_node_map(&self) -> &OutputNodeMap {
        &self.output_node_map
    }

    pub fn output_tensor_map(&self) -> &OutputTensorMap {
        &self.output_tensor_map
    }

    pub fn get_outputs_by_node_name(&self, name: &str) -> Vec<&Tensor> {
        let Some(graph) = &self.graph else { return Vec::new() };
        self.output_node_map
            .get(name)
            .map(|ids| ids.iter().filter_map(|&id| graph.tensors.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_output_by_tensor_name(&self, name: &str) -> Option<&Tensor> {
        let id = *self.output_tensor_map.get(name)?;
        self.graph.as_ref()?.tensors.get(id)
    }

    pub fn tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.graph.as_ref()?.tensors.get(id)
    }

    /// Mutable access for feeding inputs.
    pub fn tensor_mut(&mut self, id: TensorId) -> Option<&mut Tensor> {
        self.graph.as_mut()?.tensors.get_mut(id)
    }

    pub fn workspace_size(&self) -> usize {
        self.workspace.size()
    }

    pub fn kernel_names(&self) -> Vec<&str> {
        self.graph
            .as_ref()
            .map(|g| g.kernels.iter().map(|n| n.kernel.name()).collect())
            .unwrap_or_default()
    }

    /// Serialize the owned model, with constants taken from the live tensors.
    pub fn export_to_buffer(&self) -> Result<Vec<u8>> {
        let graph = self.graph()?;
        let mut model = self.model.clone().ok_or(EmberError::NotCompiled)?;
        for (def, tensor) in model.tensors.iter_mut().zip(&graph.tensors) {
            if def.data.is_some() {
                def.data = Some(tensor.data()?.clone());
            }
        }
        model.export_to_buffer()
    }

    /// Release the compiled graph and hand back the owned model.
    pub fn into_model(mut self) -> Option<Model> {
        self.graph = None;
        self.model.take()
    }
}
