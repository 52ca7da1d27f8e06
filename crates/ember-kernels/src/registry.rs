//! Kernel registry: (target, dtype, op) → kernel constructor.
//!
//! The registry is an explicit value owned by the caller. Temporary
//! substitution goes through [`RegistryOverride`], which puts every replaced
//! entry back when it is dropped, including on early return.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

use ember_core::{DType, Result};

use crate::kernel::{Kernel, KernelConfig, KernelKey, OpDesc, OpKind};
use crate::{activation, conv_fp32, conv_int8, softmax_ce};

/// Signature shared by every kernel constructor.
pub type CreateFn = fn(&OpDesc, &KernelConfig) -> Result<Box<dyn Kernel>>;

/// A named kernel constructor. Two creators are equal when their names are.
#[derive(Clone, Copy)]
pub struct KernelCreator {
    pub name: &'static str,
    pub create: CreateFn,
}

impl KernelCreator {
    pub const fn new(name: &'static str, create: CreateFn) -> Self {
        Self { name, create }
    }

    pub fn build(&self, desc: &OpDesc, config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        (self.create)(desc, config)
    }
}

impl PartialEq for KernelCreator {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for KernelCreator {}

impl fmt::Debug for KernelCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelCreator({})", self.name)
    }
}

/// Mapping from kernel key to constructor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelRegistry {
    creators: HashMap<KernelKey, KernelCreator>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the inference kernels for every built-in operator.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        let conv_f32 = KernelCreator::new("conv_fp32", conv_fp32::create_conv_fp32);
        reg.reg_kernel(KernelKey::cpu(DType::Float32, OpKind::Conv2D), conv_f32);
        reg.reg_kernel(KernelKey::cpu(DType::Float32, OpKind::DepthwiseConv2D), conv_f32);
        reg.reg_kernel(
            KernelKey::cpu(DType::Int8, OpKind::Conv2D),
            KernelCreator::new("conv_int8", conv_int8::create_conv_int8),
        );
        reg.reg_kernel(
            KernelKey::cpu(DType::Float32, OpKind::Activation),
            KernelCreator::new("activation_fp32", activation::create_activation),
        );
        reg.reg_kernel(
            KernelKey::cpu(DType::Float32, OpKind::SoftmaxCrossEntropy),
            KernelCreator::new("softmax_cross_entropy", softmax_ce::create_softmax_ce),
        );
        reg
    }

    pub fn get_creator(&self, key: &KernelKey) -> Option<KernelCreator> {
        self.creators.get(key).copied()
    }

    /// Register `creator` under `key`, returning the entry it replaced.
    pub fn reg_kernel(&mut self, key: KernelKey, creator: KernelCreator) -> Option<KernelCreator> {
        self.creators.insert(key, creator)
    }

    pub fn unregister(&mut self, key: &KernelKey) -> Option<KernelCreator> {
        self.creators.remove(key)
    }

    pub fn len(&self) -> usize {
        self.creators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.creators.is_empty()
    }

    /// Substitute each `(key, creator)` pair until the returned guard drops.
    pub fn override_with(&mut self, entries: &[(KernelKey, KernelCreator)]) -> RegistryOverride<'_> {
        let mut restore = Vec::with_capacity(entries.len());
        for &(key, creator) in entries {
            let prev = self.reg_kernel(key, creator);
            tracing::debug!(%key, to = creator.name, from = ?prev.map(|c| c.name), "override kernel creator");
            restore.push((key, prev));
        }
        RegistryOverride { registry: self, restore }
    }
}

/// Training variants substituted while compiling a training graph.
pub fn train_creators() -> Vec<(KernelKey, KernelCreator)> {
    let conv_train = KernelCreator::new("conv_fp32_train", conv_fp32::create_conv_fp32_train);
    vec![
        (KernelKey::cpu(DType::Float32, OpKind::Conv2D), conv_train),
        (KernelKey::cpu(DType::Float32, OpKind::DepthwiseConv2D), conv_train),
    ]
}

/// Scoped registry substitution. Dropping it restores the previous entries
/// in reverse order, removing keys that did not exist before.
pub struct RegistryOverride<'a> {
    registry: &'a mut KernelRegistry,
    restore: Vec<(KernelKey, Option<KernelCreator>)>,
}

impl Deref for RegistryOverride<'_> {
    type Target = KernelRegistry;

    fn deref(&self) -> &KernelRegistry {
        &*self.registry
    }
}

impl Drop for RegistryOverride<'_> {
    fn drop(&mut self) {
        while let Some((key, prev)) = self.restore.pop() {
            match prev {
                Some(creator) => {
                    self.registry.reg_kernel(key, creator);
                }
                None => {
                    self.registry.unregister(&key);
                }
            }
        }
        tracing::debug!("kernel registry restored");
    }
}
