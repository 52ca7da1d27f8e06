//! Softmax cross-entropy loss.
//!
//! Inputs: logits `[.., C]` and one-hot (or soft) labels of the same shape.
//! Output 0 is the mean loss over rows, shape `[1]`. An optional output 1
//! receives `(softmax - labels) / rows` in train mode.

use ember_core::{DType, EmberError, Result, Shape, Tensor};

use crate::kernel::{Kernel, KernelBase, KernelConfig, KernelMode, OpDesc, RunContext};

pub fn create_softmax_ce(desc: &OpDesc, config: &KernelConfig) -> Result<Box<dyn Kernel>> {
    Ok(Box::new(SoftmaxCrossEntropyKernel::new(desc, config)))
}

pub struct SoftmaxCrossEntropyKernel {
    base: KernelBase,
    classes: usize,
}

impl SoftmaxCrossEntropyKernel {
    pub fn new(desc: &OpDesc, config: &KernelConfig) -> Self {
        Self { base: KernelBase::new(desc, config), classes: 0 }
    }
}

impl Kernel for SoftmaxCrossEntropyKernel {
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
        self.base.expect_arity(2, 2, 1, 2)?;
        let logits = &tensors[self.base.inputs[0]];
        let labels = &tensors[self.base.inputs[1]];
        for t in [logits, labels] {
            if t.dtype() != DType::Float32 {
                return Err(EmberError::DTypeMismatch { expected: DType::Float32, got: t.dtype() });
            }
        }
        if logits.shape() != labels.shape() {
            return Err(EmberError::param(format!(
                "loss '{}': logits {} and labels {} differ",
                self.base.name,
                logits.shape(),
                labels.shape()
            )));
        }
        let classes = logits.shape().last_dim();
        if classes == 0 || logits.shape().ndim() == 0 {
            return Err(EmberError::param(format!("loss '{}' needs a class axis", self.base.name)));
        }
        let logits_shape = logits.shape().clone();
        self.classes = classes;

        tensors[self.base.outputs[0]].set_shape(loss_shape());
        if let Some(&grad) = self.base.outputs.get(1) {
            tensors[grad].set_shape(logits_shape);
        }
        Ok(())
    }

    fn run(&mut self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &mut RunContext<'_>) -> Result<()> {
        let logits = inputs[0].as_f32()?;
        let labels = inputs[1].as_f32()?;
        let c = self.classes;
        if c == 0 || logits.len() % c != 0 || labels.len() != logits.len() {
            return Err(EmberError::param(format!(
                "loss '{}' got {} logits for {} classes",
                self.base.name,
                logits.len(),
                c
            )));
        }
        let rows = logits.len() / c;
        let mut probs = vec![0.0f32; logits.len()];
        let mut total = 0.0f64;
        for r in 0..rows {
            let x = &logits[r * c..(r + 1) * c];
            let t = &labels[r * c..(r + 1) * c];
            let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = x.iter().map(|v| (v - max).exp()).sum();
            let log_sum = sum.ln();
            for j in 0..c {
                let log_p = x[j] - max - log_sum;
                probs[r * c + j] = log_p.exp();
                total -= f64::from(t[j] * log_p);
            }
        }
        let mean = if rows == 0 { 0.0 } else { (total / rows as f64) as f32 };
        outputs[0].as_f32_mut()?[0] = mean;

        if self.base.mode == KernelMode::Train {
            if let Some(grad_t) = outputs.get_mut(1) {
                let grad = grad_t.as_f32_mut()?;
                let inv_rows = 1.0 / rows.max(1) as f32;
                for ((g, p), t) in grad.iter_mut().zip(&probs).zip(labels) {
                    *g = (p - t) * inv_rows;
                }
            }
        }
        tracing::trace!(kernel = %self.base.name, loss = mean, rows, "softmax cross-entropy");
        Ok(())
    }
}

/// Shape of the scalar loss output.
pub fn loss_shape() -> Shape {
    Shape::from([1])
}
