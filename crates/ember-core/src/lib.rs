//! # ember-core
//!
//! Tensor primitives shared by the Ember kernels and sessions.
//!
//! Provides:
//! - [`Tensor`] with an explicit `Unbound` / `Bound` backing state
//! - [`DType`] element tags (int8 / int16 / int32 / float32)
//! - [`Shape`] with stack storage for the common NHWC rank
//! - [`QuantParam`] affine quantization parameters
//! - [`EmberError`] and the crate-wide [`Result`]

pub mod dtype;
pub mod error;
pub mod quant;
pub mod shape;
pub mod tensor;

pub use dtype::DType;
pub use error::EmberError;
pub use quant::QuantParam;
pub use shape::Shape;
pub use tensor::{Ownership, Tensor, TensorCategory, TensorData, TensorState};

pub type Result<T> = std::result::Result<T, EmberError>;
