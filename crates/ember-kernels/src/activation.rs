//! Elementwise float activations.

use ember_core::{DType, EmberError, Result, Tensor};

use crate::kernel::{Kernel, KernelBase, KernelConfig, OpDesc, RunContext};
use crate::param::{ActType, OpParameter};

pub fn create_activation(desc: &OpDesc, config: &KernelConfig) -> Result<Box<dyn Kernel>> {
    Ok(Box::new(ActivationFp32Kernel::new(desc, config)?))
}

pub struct ActivationFp32Kernel {
    base: KernelBase,
    act: ActType,
}

impl ActivationFp32Kernel {
    pub fn new(desc: &OpDesc, config: &KernelConfig) -> Result<Self> {
        let act = match desc.param {
            OpParameter::Activation(act) => act,
            other => {
                return Err(EmberError::param(format!(
                    "activation '{}' got {:?} parameters",
                    desc.name, other
                )))
            }
        };
        Ok(Self { base: KernelBase::new(desc, config), act })
    }
}

impl Kernel for ActivationFp32Kernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }

    fn init(&mut self, tensors: &mut [Tensor]) -> Result<()> {
        self.resize(tensors)
    }

    fn resize(&mut self, tensors: &mut [Tensor]) -> Result<()> {
        self.base.expect_arity(1, 1, 1, 1)?;
        let shape = tensors[self.base.inputs[0]].shape().clone();
        for id in [self.base.inputs[0], self.base.outputs[0]] {
            if tensors[id].dtype() != DType::Float32 {
                return Err(EmberError::DTypeMismatch { expected: DType::Float32, got: tensors[id].dtype() });
            }
        }
        tensors[self.base.outputs[0]].set_shape(shape);
        Ok(())
    }

    fn run(&mut self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &mut RunContext<'_>) -> Result<()> {
        let x = inputs[0].as_f32()?;
        let y = outputs[0].as_f32_mut()?;
        if x.len() != y.len() {
            return Err(EmberError::param(format!(
                "activation '{}' input has {} values, output {}",
                self.base.name,
                x.len(),
                y.len()
            )));
        }
        for (o, &v) in y.iter_mut().zip(x) {
            *o = self.act.apply(v);
        }
        Ok(())
    }
}
