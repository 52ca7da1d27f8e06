//! Execution context: worker count, target and loss operator.

use serde::{Deserialize, Serialize};

use ember_core::{EmberError, Result};
use ember_kernels::{KernelConfig, OpKind, Target};

/// Settings a session is created with.
///
/// Loadable from JSON; every field falls back to its default when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Context {
    /// Workers for intra-kernel data parallelism. Must be at least 1.
    pub thread_num: usize,
    /// Execution target used in kernel lookup keys.
    pub target: Target,
    /// Operator that marks the train/eval boundary.
    pub loss_op: OpKind,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            thread_num: 2,
            target: Target::Cpu,
            loss_op: OpKind::SoftmaxCrossEntropy,
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_num(mut self, thread_num: usize) -> Self {
        self.thread_num = thread_num;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_loss_op(mut self, loss_op: OpKind) -> Self {
        self.loss_op = loss_op;
        self
    }

    /// Parse a context from JSON, then validate it.
    pub fn from_json(text: &str) -> Result<Self> {
        let ctx: Self = serde_json::from_str(text)
            .map_err(|e| EmberError::param(format!("invalid context: {e}")))?;
        ctx.validate()?;
        Ok(ctx)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_num == 0 {
            return Err(EmberError::param("context thread_num must be at least 1"));
        }
        Ok(())
    }

    /// Creation settings forwarded to every kernel.
    pub fn kernel_config(&self) -> KernelConfig {
        KernelConfig {
            target: self.target,
            thread_num: self.thread_num,
        }
    }

    /// Worker pool for `thread_num > 1`; single-threaded contexts run inline.
    pub fn build_pool(&self) -> Result<Option<rayon::ThreadPool>> {
        if self.thread_num <= 1 {
            return Ok(None);
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.thread_num)
            .thread_name(|i| format!("ember-worker-{i}"))
            .build()
            .map(Some)
            .map_err(|e| EmberError::param(format!("cannot start {} workers: {e}", self.thread_num)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let ctx = Context::default();
        assert_eq!(ctx.thread_num, 2);
        assert_eq!(ctx.target, Target::Cpu);
        assert_eq!(ctx.loss_op, OpKind::SoftmaxCrossEntropy);
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let ctx = Context::from_json(r#"{"thread_num": 4}"#).unwrap();
        assert_eq!(ctx.thread_num, 4);
        assert_eq!(ctx.loss_op, OpKind::SoftmaxCrossEntropy);

        let ctx = Context::from_json(r#"{"target": "Gpu", "loss_op": "Activation"}"#).unwrap();
        assert_eq!(ctx.target, Target::Gpu);
        assert_eq!(ctx.loss_op, OpKind::Activation);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(Context::from_json(r#"{"thread_num": 0}"#), Err(EmberError::Parameter(_))));
        assert!(Context::new().with_thread_num(0).validate().is_err());
    }

    #[test]
    fn test_pool() {
        assert!(Context::new().with_thread_num(1).build_pool().unwrap().is_none());
        let pool = Context::new().with_thread_num(3).build_pool().unwrap().unwrap();
        assert_eq!(pool.current_num_threads(), 3);
    }
}
