//! Sequential kernel executor.
//!
//! Kernels run strictly in list order; one kernel's (possibly multi-worker)
//! `run` completes before the next starts. The executor owns no tensor data.

use ember_core::{EmberError, Result, Tensor};
use ember_kernels::{run_kernel, OpKind, RunContext, TensorId, Workspace};

use crate::compiler::KernelNode;

/// Per-kernel information handed to callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallBackParam<'a> {
    pub node_name: &'a str,
    pub node_type: OpKind,
}

/// Callback invoked with a kernel's inputs, outputs and identity.
///
/// Before a kernel, returning `false` skips that kernel. After a kernel,
/// returning `false` stops the run (successfully) before the next kernel.
pub type KernelCallBack<'a> = dyn FnMut(&[&Tensor], &[&Tensor], &CallBackParam<'_>) -> bool + 'a;

/// Runs kernel lists against a borrowed tensor table and workspace.
pub struct Executor<'a> {
    tensors: &'a mut [Tensor],
    workspace: &'a mut Workspace,
    pool: Option<&'a rayon::ThreadPool>,
}

impl<'a> Executor<'a> {
    pub fn new(tensors: &'a mut [Tensor], workspace: &'a mut Workspace, pool: Option<&'a rayon::ThreadPool>) -> Self {
        Self { tensors, workspace, pool }
    }

    /// Run `kernels` in order. Stops at the first kernel error and returns it unchanged.
    pub fn run(
        &mut self,
        inputs: &[TensorId],
        outputs: &[TensorId],
        kernels: &mut [KernelNode],
        mut before: Option<&mut KernelCallBack<'_>>,
        mut after: Option<&mut KernelCallBack<'_>>,
    ) -> Result<()> {
        for &id in inputs {
            let t = self
                .tensors
                .get(id)
                .ok_or_else(|| EmberError::param(format!("graph input {id} is not in the tensor table")))?;
            if !t.is_bound() {
                return Err(EmberError::UnboundTensor(t.name().to_string()));
            }
        }
        for &id in outputs {
            if let Some(t) = self.tensors.get_mut(id) {
                t.ensure_bound();
            }
        }

        for node in kernels.iter_mut() {
            let kernel = node.kernel.as_mut();
            let name = kernel.name().to_string();
            let param = CallBackParam { node_name: &name, node_type: kernel.op_kind() };

            if let Some(cb) = before.as_deref_mut() {
                if !invoke(cb, self.tensors, kernel.in_tensors(), kernel.out_tensors(), &param) {
                    tracing::warn!(kernel = %name, "before-callback vetoed kernel, skipping");
                    continue;
                }
            }

            tracing::trace!(kernel = %name, op = %param.node_type, "run kernel");
            let mut ctx = RunContext::new(self.workspace, self.pool);
            if let Err(e) = run_kernel(kernel, self.tensors, &mut ctx) {
                tracing::error!(kernel = %name, error = %e, "kernel failed");
                return Err(e);
            }

            if let Some(cb) = after.as_deref_mut() {
                if !invoke(cb, self.tensors, kernel.in_tensors(), kernel.out_tensors(), &param) {
                    tracing::warn!(kernel = %name, "after-callback stopped execution");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn invoke(
    cb: &mut KernelCallBack<'_>,
    tensors: &[Tensor],
    ins: &[TensorId],
    outs: &[TensorId],
    param: &CallBackParam<'_>,
) -> bool {
    let ins: Vec<&Tensor> = ins.iter().filter_map(|&id| tensors.get(id)).collect();
    let outs: Vec<&Tensor> = outs.iter().filter_map(|&id| tensors.get(id)).collect();
    cb(&ins, &outs, param)
}
