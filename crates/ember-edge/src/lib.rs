//! # ember-edge
//!
//! Graph sessions for on-device inference and training.
//!
//! ## Key Features
//! - Flat, 64-byte aligned model container with a JSON header
//! - Graph compiler: kernel lookup, producer/consumer linking, output maps
//! - Sequential executor with before/after node callbacks
//! - [`LiteSession`] for inference, [`TrainSession`] switching between a
//!   full training pass and an evaluation prefix on one compiled graph
//! - Shared scratch workspace sized to the largest kernel request

pub mod compiler;
pub mod context;
pub mod executor;
pub mod model;
pub mod session;
pub mod train_session;

pub use compiler::{compile_graph, CompiledGraph, KernelNode, OutputNodeMap, OutputTensorMap};
pub use context::Context;
pub use executor::{CallBackParam, Executor, KernelCallBack};
pub use model::{Model, TensorDef};
pub use session::LiteSession;
pub use train_session::{SessionMode, TrainSession};
