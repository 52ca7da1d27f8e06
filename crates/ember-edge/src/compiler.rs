//! Lowers a [`Model`] into an ordered kernel arena over a tensor table.

use std::collections::BTreeMap;
use std::fmt;

use ember_core::{EmberError, Ownership, Result, Tensor};
use ember_kernels::{Kernel, KernelKey, KernelRegistry, TensorId};

use crate::context::Context;
use crate::model::Model;

/// Kernel name → externally visible output tensors.
pub type OutputNodeMap = BTreeMap<String, Vec<TensorId>>;

/// Tensor index (as a string) → tensor.
pub type OutputTensorMap = BTreeMap<String, TensorId>;

/// One kernel plus its graph edges, stored as arena indices.
pub struct KernelNode {
    pub kernel: Box<dyn Kernel>,
    /// Kernels producing one of this kernel's inputs.
    pub in_kernels: Vec<usize>,
    /// Kernels consuming one of this kernel's outputs.
    pub out_kernels: Vec<usize>,
}

impl fmt::Debug for KernelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelNode")
            .field("name", &self.kernel.name())
            .field("op", &self.kernel.op_kind())
            .field("in_kernels", &self.in_kernels)
            .field("out_kernels", &self.out_kernels)
            .finish()
    }
}

/// Result of [`compile_graph`].
#[derive(Debug)]
pub struct CompiledGraph {
    /// Kernels in execution order.
    pub kernels: Vec<KernelNode>,
    pub tensors: Vec<Tensor>,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub output_node_map: OutputNodeMap,
    pub output_tensor_map: OutputTensorMap,
}

impl CompiledGraph {
    /// Largest workspace any kernel declares.
    pub fn max_workspace_size(&self) -> usize {
        self.kernels.iter().map(|n| n.kernel.workspace_size()).max().unwrap_or(0)
    }
}

/// Insert `id` under `name` unless it is already listed.
pub fn insert_node_output(map: &mut OutputNodeMap, name: &str, id: TensorId) {
    let ids = map.entry(name.to_string()).or_default();
    if !ids.contains(&id) {
        ids.push(id);
    }
}

/// Insert `id` under its index string unless the key already exists.
pub fn insert_tensor_output(map: &mut OutputTensorMap, id: TensorId) {
    map.entry(id.to_string()).or_insert(id);
}

fn node_error(node: &str, err: EmberError) -> EmberError {
    EmberError::Compilation(format!("node '{node}': {err}"))
}

/// Build kernels for every node of `model` using `registry`, link them, run
/// their `init` in order and collect the output maps.
pub fn compile_graph(model: &Model, registry: &KernelRegistry, context: &Context) -> Result<CompiledGraph> {
    let n_tensors = model.tensors.len();
    let check = |id: TensorId, what: &str| -> Result<()> {
        if id >= n_tensors {
            return Err(EmberError::Compilation(format!(
                "{what} references tensor {id} but the model has {n_tensors}"
            )));
        }
        Ok(())
    };
    for &id in model.inputs.iter().chain(&model.outputs) {
        check(id, "graph io")?;
    }
    for node in &model.nodes {
        for &id in node.inputs.iter().chain(&node.outputs) {
            check(id, &format!("node '{}'", node.name))?;
        }
    }

    let mut tensors = model
        .tensors
        .iter()
        .map(|def| def.to_tensor())
        .collect::<Result<Vec<_>>>()
        .map_err(|e| EmberError::Compilation(e.to_string()))?;
    for &id in model.inputs.iter().chain(&model.outputs) {
        tensors[id].set_ownership(Ownership::External);
    }

    let config = context.kernel_config();
    let mut kernels = Vec::with_capacity(model.nodes.len());
    for node in &model.nodes {
        let first = *node
            .inputs
            .first()
            .ok_or_else(|| EmberError::Compilation(format!("node '{}' has no inputs", node.name)))?;
        let key = KernelKey::new(context.target, tensors[first].dtype(), node.op);
        let creator = registry
            .get_creator(&key)
            .ok_or_else(|| EmberError::Compilation(format!("no kernel registered for {key} (node '{}')", node.name)))?;
        let kernel = creator.build(node, &config).map_err(|e| node_error(&node.name, e))?;
        tracing::debug!(node = %node.name, %key, creator = creator.name, "kernel created");
        kernels.push(KernelNode { kernel, in_kernels: Vec::new(), out_kernels: Vec::new() });
    }

    link_kernels(&mut kernels);

    for node in kernels.iter_mut() {
        let name = node.kernel.name().to_string();
        node.kernel.init(&mut tensors).map_err(|e| node_error(&name, e))?;
    }

    let mut output_node_map = OutputNodeMap::new();
    let mut output_tensor_map = OutputTensorMap::new();
    for &id in &model.outputs {
        if let Some(node) = kernels.iter().find(|n| n.kernel.out_tensors().contains(&id)) {
            insert_node_output(&mut output_node_map, node.kernel.name(), id);
        }
        insert_tensor_output(&mut output_tensor_map, id);
    }

    Ok(CompiledGraph {
        kernels,
        tensors,
        inputs: model.inputs.clone(),
        outputs: model.outputs.clone(),
        output_node_map,
        output_tensor_map,
    })
}

/// Fill `in_kernels` / `out_kernels` from producer/consumer tensor sharing.
fn link_kernels(kernels: &mut [KernelNode]) {
    for consumer in 0..kernels.len() {
        for producer in 0..kernels.len() {
            if producer == consumer {
                continue;
            }
            let feeds = kernels[consumer]
                .kernel
                .in_tensors()
                .iter()
                .any(|id| kernels[producer].kernel.out_tensors().contains(id));
            if feeds {
                if !kernels[consumer].in_kernels.contains(&producer) {
                    kernels[consumer].in_kernels.push(producer);
                }
                if !kernels[producer].out_kernels.contains(&consumer) {
                    kernels[producer].out_kernels.push(consumer);
                }
            }
        }
    }
}
