//! # ember-kernels
//!
//! Operator kernels and the registry that constructs them.
//!
//! Provides:
//! - The [`Kernel`] contract (init / resize / run / workspace_size / set_mode)
//! - [`KernelRegistry`] keyed by (target, dtype, op) with scoped overrides
//! - Integer requantization and Winograd F(2×2, 3×3) helpers
//! - Quantized 3×3 Winograd convolution, direct int8 convolution
//! - Float convolution (direct and im2col), activations, softmax cross-entropy

pub mod kernel;
pub mod param;
pub mod registry;
pub mod requant;
pub mod winograd;
pub mod workspace;

pub mod activation;
pub mod conv3x3_int8;
pub mod conv_fp32;
pub mod conv_int8;
pub mod softmax_ce;

pub use kernel::{
    run_kernel, task_tile_range, Kernel, KernelBase, KernelConfig, KernelKey, KernelMode, OpDesc, OpKind,
    RunContext, Target, TensorId,
};
pub use param::{ActType, ConvGeometry, ConvParam, OpParameter, PadMode};
pub use registry::{train_creators, KernelCreator, KernelRegistry, RegistryOverride};
pub use requant::Requantizer;
pub use workspace::Workspace;

pub use activation::ActivationFp32Kernel;
pub use conv3x3_int8::Conv3x3Int8Kernel;
pub use conv_fp32::ConvFp32Kernel;
pub use conv_int8::ConvInt8Kernel;
pub use softmax_ce::SoftmaxCrossEntropyKernel;
