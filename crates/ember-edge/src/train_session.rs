//! Dual-mode graph session.
//!
//! One compiled graph serves both training and evaluation. Train mode runs
//! every kernel and exposes the loss. Eval mode runs only the kernels before
//! the first loss kernel and exposes the network output feeding the loss.
//! Switching modes never recompiles.

use ember_core::{EmberError, Result, Shape, Tensor};
use ember_kernels::{train_creators, KernelMode, KernelRegistry, OpKind, TensorId};

use crate::compiler::{compile_graph, insert_node_output, insert_tensor_output, KernelNode, OutputNodeMap, OutputTensorMap};
use crate::context::Context;
use crate::executor::KernelCallBack;
use crate::model::Model;
use crate::session::LiteSession;

/// Which kernel subset a [`TrainSession`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    Train,
    Eval,
}

pub struct TrainSession {
    session: LiteSession,
    mode: SessionMode,
    /// Output maps produced by the compiler, restored by [`TrainSession::eval`].
    orig_output_node_map: OutputNodeMap,
    orig_output_tensor_map: OutputTensorMap,
}

impl Default for TrainSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainSession {
    /// A session without an execution context.
    pub fn new() -> Self {
        Self::from_session(LiteSession::new())
    }

    /// A session bound to a validated context.
    pub fn create(context: Context) -> Result<Self> {
        Ok(Self::from_session(LiteSession::create(context)?))
    }

    fn from_session(session: LiteSession) -> Self {
        Self {
            session,
            mode: SessionMode::default(),
            orig_output_node_map: OutputNodeMap::new(),
            orig_output_tensor_map: OutputTensorMap::new(),
        }
    }

    fn loss_op(&self) -> OpKind {
        self.session.context.as_ref().map_or(OpKind::SoftmaxCrossEntropy, |c| c.loss_op)
    }

    fn is_loss_kernel(node: &KernelNode, loss_op: OpKind) -> bool {
        node.kernel.op_kind() == loss_op
    }

    /// Compile `model` with the training kernel variants substituted into
    /// `registry`. The registry is back to its previous state when this
    /// returns, whether or not compilation succeeded. On failure the session
    /// is left as it was.
    pub fn compile_train_graph(&mut self, model: Model, registry: &mut KernelRegistry) -> Result<()> {
        let context = self.session.require_context()?.clone();
        let graph = {
            let overrides = registry.override_with(&train_creators());
            let mut graph = compile_graph(&model, &overrides, &context).inspect_err(|e| {
                tracing::error!(model = %model.name, error = %e, "train graph compilation failed");
            })?;
            for &id in &graph.inputs {
                graph.tensors[id].ensure_bound();
            }
            graph
        };

        self.orig_output_node_map = graph.output_node_map.clone();
        self.orig_output_tensor_map = graph.output_tensor_map.clone();
        self.session.install(model, graph);
        self.train();
        Ok(())
    }

    /// Switch every kernel to train mode and expose the loss output.
    pub fn train(&mut self) {
        self.mode = SessionMode::Train;
        let loss_op = self.loss_op();
        let session = &mut self.session;
        session.output_node_map.clear();
        session.output_tensor_map.clear();
        let Some(graph) = session.graph.as_mut() else { return };

        for node in graph.kernels.iter_mut() {
            node.kernel.set_mode(KernelMode::Train);
        }
        for node in graph.kernels.iter().filter(|n| Self::is_loss_kernel(n, loss_op)) {
            let Some(&id) = node.kernel.out_tensors().first() else { continue };
            let Some(tensor) = graph.tensors.get_mut(id) else { continue };
            tensor.ensure_bound();
            insert_node_output(&mut session.output_node_map, node.kernel.name(), id);
            insert_tensor_output(&mut session.output_tensor_map, id);
        }
        tracing::info!(outputs = ?session.output_node_map.keys().collect::<Vec<_>>(), "train mode");
    }

    /// Switch every kernel to eval mode, restore the compiled output maps and
    /// expose the first output of every kernel feeding a loss kernel.
    pub fn eval(&mut self) {
        self.mode = SessionMode::Eval;
        let loss_op = self.loss_op();
        let session = &mut self.session;
        session.output_node_map = self.orig_output_node_map.clone();
        session.output_tensor_map = self.orig_output_tensor_map.clone();
        let Some(graph) = session.graph.as_mut() else { return };

        for node in graph.kernels.iter_mut() {
            node.kernel.set_mode(KernelMode::Eval);
        }
        for node in graph.kernels.iter().filter(|n| Self::is_loss_kernel(n, loss_op)) {
            for &pred in &node.in_kernels {
                let producer = &graph.kernels[pred].kernel;
                if session.output_node_map.contains_key(producer.name()) {
                    continue;
                }
                let Some(&id) = producer.out_tensors().first() else { continue };
                insert_node_output(&mut session.output_node_map, producer.name(), id);
                if id < graph.tensors.len() {
                    insert_tensor_output(&mut session.output_tensor_map, id);
                }
            }
        }
        tracing::info!(outputs = ?session.output_node_map.keys().collect::<Vec<_>>(), "eval mode");
    }

    /// Run the graph for the current mode. Eval stops before the first loss kernel.
    pub fn run_graph(
        &mut self,
        before: Option<&mut KernelCallBack<'_>>,
        after: Option<&mut KernelCallBack<'_>>,
    ) -> Result<()> {
        self.session.require_context()?;
        let loss_op = self.loss_op();
        let graph = self.session.graph()?;
        let count = match self.mode {
            SessionMode::Train => graph.kernels.len(),
            SessionMode::Eval => graph
                .kernels
                .iter()
                .position(|n| Self::is_loss_kernel(n, loss_op))
                .unwrap_or(graph.kernels.len()),
        };
        tracing::debug!(mode = ?self.mode, kernels = count, "run train session");
        self.session.execute(count, before, after)
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn is_train(&self) -> bool {
        self.mode == SessionMode::Train
    }

    pub fn is_compiled(&self) -> bool {
        self.session.graph.is_some()
    }

    pub fn context(&self) -> Option<&Context> {
        self.session.context()
    }

    pub fn resize(&mut self, input_shapes: &[Shape]) -> Result<()> {
        self.session.resize(input_shapes)
    }

    pub fn inputs(&self) -> &[TensorId] {
        self.session.inputs()
    }

    pub fn outputs(&self) -> &[TensorId] {
        self.session.outputs()
    }

    pub fn output_node_map(&self) -> &OutputNodeMap {
        self.session.output_node_map()
    }

    pub fn output_tensor_map(&self) -> &OutputTensorMap {
        self.session.output_tensor_map()
    }

    pub fn get_outputs_by_node_name(&self, name: &str) -> Vec<&Tensor> {
        self.session.get_outputs_by_node_name(name)
    }

    pub fn get_output_by_tensor_name(&self, name: &str) -> Option<&Tensor> {
        self.session.get_output_by_tensor_name(name)
    }

    pub fn tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.session.tensor(id)
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> Option<&mut Tensor> {
        self.session.tensor_mut(id)
    }

    pub fn workspace_size(&self) -> usize {
        self.session.workspace_size()
    }

    pub fn kernel_names(&self) -> Vec<&str> {
        self.session.kernel_names()
    }

    /// Mode flag of every kernel, in execution order.
    pub fn kernel_modes(&self) -> Vec<KernelMode> {
        self.session
            .graph
            .as_ref()
            .map(|g| g.kernels.iter().map(|n| n.kernel.mode()).collect())
            .unwrap_or_default()
    }

    /// Serialize the owned model with current constant values.
    pub fn export_to_buffer(&self) -> Result<Vec<u8>> {
        self.session.export_to_buffer()
    }

    pub fn into_model(self) -> Option<Model> {
        self.session.into_model()
    }
}

impl std::fmt::Debug for TrainSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainSession")
            .field("mode", &self.mode)
            .field("kernels", &self.kernel_names())
            .field("workspace", &self.workspace_size())
            .finish()
    }
}

/// Plain compilation is not offered on a training session.
impl TrainSession {
    pub fn compile_graph(&mut self, _model: Model, _registry: &KernelRegistry) -> Result<()> {
        Err(EmberError::Compilation("use compile_train_graph on a training session".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TensorDef;
    use ember_core::{DType, TensorData};
    use ember_kernels::{ActType, OpDesc, OpParameter};

    /// x -> relu -> sigmoid -> loss(labels)
    fn model() -> Model {
        let mut m = Model::new("mlp");
        let x = m.add_tensor(TensorDef::input("x", DType::Float32, &[2, 2]));
        let a = m.add_tensor(TensorDef::var("a", DType::Float32));
        let b = m.add_tensor(TensorDef::var("b", DType::Float32));
        let labels = m.add_tensor(TensorDef::constant("labels", &[2, 2], TensorData::Float32(vec![1.0, 0.0, 0.0, 1.0])));
        let loss = m.add_tensor(TensorDef::var("loss", DType::Float32));
        let acts = [("relu", ActType::Relu, x, a), ("sigmoid", ActType::Sigmoid, a, b)];
        for (name, act, i, o) in acts {
            m.add_node(OpDesc {
                name: name.into(),
                op: OpKind::Activation,
                param: OpParameter::Activation(act),
                inputs: vec![i],
                outputs: vec![o],
            });
        }
        m.add_node(OpDesc {
            name: "loss".into(),
            op: OpKind::SoftmaxCrossEntropy,
            param: OpParameter::SoftmaxCrossEntropy,
            inputs: vec![b, labels],
            outputs: vec![loss],
        });
        m.inputs = vec![x];
        m.outputs = vec![loss];
        m
    }

    fn compiled() -> TrainSession {
        let mut s = TrainSession::create(Context::default()).unwrap();
        s.compile_train_graph(model(), &mut KernelRegistry::with_defaults()).unwrap();
        s
    }

    #[test]
    fn test_compile_defaults_to_train() {
        let s = compiled();
        assert!(s.is_train());
        assert_eq!(s.output_node_map().keys().collect::<Vec<_>>(), vec!["loss"]);
        assert!(s.kernel_modes().iter().all(|&m| m == KernelMode::Train));
        // inputs are materialized at compile time
        assert!(s.tensor(s.inputs()[0]).unwrap().is_bound());
    }

    #[test]
    fn test_eval_exposes_loss_predecessor() {
        let mut s = compiled();
        s.eval();
        assert_eq!(s.mode(), SessionMode::Eval);
        assert!(s.kernel_modes().iter().all(|&m| m == KernelMode::Eval));
        // compiled outputs (the loss) stay, plus the kernel feeding it
        let names: Vec<_> = s.output_node_map().keys().cloned().collect();
        assert_eq!(names, vec!["loss".to_string(), "sigmoid".to_string()]);
        assert_eq!(s.output_tensor_map().get("2"), Some(&2));
    }

    #[test]
    fn test_eval_run_skips_loss() {
        let mut s = compiled();
        s.eval();
        let mut ran = Vec::new();
        let mut after = |_: &[&Tensor], _: &[&Tensor], p: &crate::executor::CallBackParam<'_>| -> bool {
            ran.push(p.node_name.to_string());
            true
        };
        s.run_graph(None, Some(&mut after)).unwrap();
        assert_eq!(ran, vec!["relu".to_string(), "sigmoid".to_string()]);
    }

    #[test]
    fn test_null_context_and_uncompiled() {
        let mut s = TrainSession::new();
        assert!(matches!(s.run_graph(None, None), Err(EmberError::NullContext)));
        assert!(matches!(
            s.compile_train_graph(model(), &mut KernelRegistry::with_defaults()),
            Err(EmberError::NullContext)
        ));
        assert!(!s.is_compiled());

        let mut s = TrainSession::create(Context::default()).unwrap();
        assert!(matches!(s.run_graph(None, None), Err(EmberError::NotCompiled)));
        s.train();
        s.eval();
        assert!(s.output_node_map().is_empty());
    }

    #[test]
    fn test_plain_compile_refused() {
        let mut s = TrainSession::create(Context::default()).unwrap();
        assert!(matches!(
            s.compile_graph(model(), &KernelRegistry::with_defaults()),
            Err(EmberError::Compilation(_))
        ));
    }
}
