//! Kernel contract shared by every operator implementation.
//!
//! A kernel wraps one operator's parameters plus the indices of its input and
//! output tensors in the graph's tensor table. The capability set is flat:
//! `init`, `resize`, `run`, `workspace_size`, `set_mode`.

use std::fmt;

use serde::{Deserialize, Serialize};

use ember_core::{DType, Result, Tensor};

use crate::param::OpParameter;
use crate::workspace::Workspace;

/// Index of a tensor in the graph's tensor table.
pub type TensorId = usize;

/// Execution target a kernel implementation is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Target {
    #[default]
    Cpu,
    Gpu,
}

/// Operator kinds the runtime can schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Conv2D,
    DepthwiseConv2D,
    Activation,
    SoftmaxCrossEntropy,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Conv2D => write!(f, "Conv2D"),
            OpKind::DepthwiseConv2D => write!(f, "DepthwiseConv2D"),
            OpKind::Activation => write!(f, "Activation"),
            OpKind::SoftmaxCrossEntropy => write!(f, "SoftmaxCrossEntropy"),
        }
    }
}

/// Registry lookup key: (target, numeric type of the first input, operator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelKey {
    pub target: Target,
    pub dtype: DType,
    pub op: OpKind,
}

impl KernelKey {
    pub const fn new(target: Target, dtype: DType, op: OpKind) -> Self {
        Self { target, dtype, op }
    }

    pub const fn cpu(dtype: DType, op: OpKind) -> Self {
        Self::new(Target::Cpu, dtype, op)
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {}, {})", self.target, self.dtype, self.op)
    }
}

/// Train/eval flag carried by every kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KernelMode {
    #[default]
    Train,
    Eval,
}

/// Operator description handed to a kernel creator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpDesc {
    pub name: String,
    pub op: OpKind,
    pub param: OpParameter,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

/// Creation-time settings forwarded from the execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub target: Target,
    /// Worker count for intra-kernel data parallelism.
    pub thread_num: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            target: Target::Cpu,
            thread_num: 1,
        }
    }
}

/// State common to every kernel.
#[derive(Debug, Clone)]
pub struct KernelBase {
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub mode: KernelMode,
    pub thread_num: usize,
}

impl KernelBase {
    pub fn new(desc: &OpDesc, config: &KernelConfig) -> Self {
        Self {
            name: desc.name.clone(),
            op: desc.op,
            inputs: desc.inputs.clone(),
            outputs: desc.outputs.clone(),
            mode: KernelMode::default(),
            thread_num: config.thread_num.max(1),
        }
    }

    /// Fail unless the kernel declares exactly/at least the given tensor counts.
    pub fn expect_arity(&self, min_inputs: usize, max_inputs: usize, min_outputs: usize, max_outputs: usize) -> Result<()> {
        let (ni, no) = (self.inputs.len(), self.outputs.len());
        if ni < min_inputs || ni > max_inputs || no < min_outputs || no > max_outputs {
            return Err(ember_core::EmberError::param(format!(
                "{} '{}' takes {}..={} inputs and {}..={} outputs, got {} and {}",
                self.op, self.name, min_inputs, max_inputs, min_outputs, max_outputs, ni, no
            )));
        }
        Ok(())
    }
}

/// Per-run resources handed to a kernel by the executor.
pub struct RunContext<'a> {
    /// Shared scratch memory, sized to the largest kernel requirement.
    pub workspace: &'a mut Workspace,
    /// Worker pool for intra-kernel parallelism; `None` runs tasks inline.
    pub pool: Option<&'a rayon::ThreadPool>,
}

impl<'a> RunContext<'a> {
    pub fn new(workspace: &'a mut Workspace, pool: Option<&'a rayon::ThreadPool>) -> Self {
        Self { workspace, pool }
    }
}

/// An executable unit implementing one operator over specific tensors.
pub trait Kernel: Send {
    fn base(&self) -> &KernelBase;

    fn base_mut(&mut self) -> &mut KernelBase;

    /// Validate parameters against the tensor table, infer output shapes and
    /// precompute anything that depends only on constant inputs.
    fn init(&mut self, tensors: &mut [Tensor]) -> Result<()>;

    /// Re-derive shape-dependent state after input shapes changed.
    fn resize(&mut self, tensors: &mut [Tensor]) -> Result<()>;

    /// Compute outputs. `outputs` are already bound.
    fn run(&mut self, inputs: &[&Tensor], outputs: &mut [Tensor], ctx: &mut RunContext<'_>) -> Result<()>;

    /// Bytes of shared workspace this kernel needs during `run`.
    fn workspace_size(&self) -> usize {
        0
    }

    fn name(&self) -> &str {
        &self.base().name
    }

    fn op_kind(&self) -> OpKind {
        self.base().op
    }

    fn in_tensors(&self) -> &[TensorId] {
        &self.base().inputs
    }

    fn out_tensors(&self) -> &[TensorId] {
        &self.base().outputs
    }

    fn mode(&self) -> KernelMode {
        self.base().mode
    }

    fn set_mode(&mut self, mode: KernelMode) {
        self.base_mut().mode = mode;
    }
}

/// Run one kernel against the full tensor table.
///
/// Output tensors are moved out of the table for the duration of the call so
/// the kernel can read its inputs and write its outputs without aliasing.
/// They are put back whether or not the kernel succeeds.
pub fn run_kernel(kernel: &mut dyn Kernel, tensors: &mut [Tensor], ctx: &mut RunContext<'_>) -> Result<()> {
    let out_ids = kernel.out_tensors().to_vec();
    let in_ids = kernel.in_tensors().to_vec();
    for &id in in_ids.iter().chain(out_ids.iter()) {
        if id >= tensors.len() {
            return Err(ember_core::EmberError::param(format!(
                "kernel '{}' references tensor {} but the table has {}",
                kernel.name(),
                id,
                tensors.len()
            )));
        }
    }
    if let Some(id) = out_ids.iter().find(|id| in_ids.contains(id)) {
        return Err(ember_core::EmberError::param(format!(
            "kernel '{}' reads and writes tensor {}",
            kernel.name(),
            id
        )));
    }

    let mut outputs: Vec<Tensor> = out_ids
        .iter()
        .map(|&id| {
            let mut t = std::mem::take(&mut tensors[id]);
            t.ensure_bound();
            t
        })
        .collect();

    let result = {
        let inputs: Vec<&Tensor> = in_ids.iter().map(|&id| &tensors[id]).collect();
        kernel.run(&inputs, &mut outputs, ctx)
    };

    for (&id, t) in out_ids.iter().zip(outputs) {
        tensors[id] = t;
    }
    result
}

/// Tile index range owned by `task_id` when `tile_count` tiles are split
/// across `thread_num` workers. Ranges are contiguous, disjoint and cover
/// `0..tile_count`; trailing tasks may receive an empty range.
pub fn task_tile_range(task_id: usize, thread_num: usize, tile_count: usize) -> std::ops::Range<usize> {
    let per_task = tiles_per_task(thread_num, tile_count);
    let start = (task_id * per_task).min(tile_count);
    let end = (start + per_task).min(tile_count);
    start..end
}

/// Number of tiles each task receives (the last non-empty task may get fewer).
pub fn tiles_per_task(thread_num: usize, tile_count: usize) -> usize {
    tile_count.div_ceil(thread_num.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ranges_cover_without_overlap() {
        for tile_count in [0usize, 1, 2, 7, 16, 33, 100] {
            for threads in 1..=9 {
                let mut covered = vec![0u8; tile_count];
                for task in 0..threads {
                    for t in task_tile_range(task, threads, tile_count) {
                        covered[t] += 1;
                    }
                }
                assert!(
                    covered.iter().all(|&c| c == 1),
                    "tiles={} threads={} coverage={:?}",
                    tile_count,
                    threads,
                    covered
                );
            }
        }
    }

    #[test]
    fn test_task_ranges_are_ordered() {
        let r0 = task_tile_range(0, 3, 10);
        let r1 = task_tile_range(1, 3, 10);
        let r2 = task_tile_range(2, 3, 10);
        assert_eq!(r0, 0..4);
        assert_eq!(r1, 4..8);
        assert_eq!(r2, 8..10);
    }

    #[test]
    fn test_kernel_key_display() {
        let key = KernelKey::cpu(DType::Int8, OpKind::Conv2D);
        assert_eq!(key.to_string(), "(Cpu, int8, Conv2D)");
    }
}
