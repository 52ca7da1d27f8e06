use crate::dtype::DType;

/// All errors raised by the Ember runtime.
#[derive(Debug, thiserror::Error)]
pub enum EmberError {
    /// Malformed shapes, filter sizes, channel counts or quant params.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// The graph compiler could not lower the model into kernels.
    #[error("compilation failed: {0}")]
    Compilation(String),

    /// Execution was requested without an execution context.
    #[error("execution context is null")]
    NullContext,

    /// The session has no compiled graph.
    #[error("session has no compiled graph")]
    NotCompiled,

    /// A tiled compute partition failed.
    #[error("worker {task_id} failed: {reason}")]
    WorkerFailure { task_id: usize, reason: String },

    /// Data was requested from a tensor that has no backing buffer.
    #[error("tensor '{0}' is not bound to a buffer")]
    UnboundTensor(String),

    /// Typed data access with the wrong element type.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Malformed serialized model.
    #[error("model format error: {0}")]
    Format(String),
}

impl EmberError {
    /// Shorthand for a [`EmberError::Parameter`] error.
    pub fn param(msg: impl Into<String>) -> Self {
        EmberError::Parameter(msg.into())
    }

    /// Shorthand for a [`EmberError::WorkerFailure`] error.
    pub fn worker(task_id: usize, reason: impl Into<String>) -> Self {
        EmberError::WorkerFailure {
            task_id,
            reason: reason.into(),
        }
    }
}
