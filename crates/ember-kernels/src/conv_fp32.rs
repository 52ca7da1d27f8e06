//! Float NHWC convolution.
//!
//! Two variants share one kernel type. The inference variant walks the
//! filter directly. The training variant lowers each (batch, group) slice to
//! im2col + GEMM through the shared workspace. Both accumulate in the same
//! order (kh, kw, ic from zero, bias last), so they produce the same values.

use rayon::prelude::*;

use ember_core::{DType, EmberError, Result, Tensor};

use crate::kernel::{Kernel, KernelBase, KernelConfig, OpDesc, OpKind, RunContext};
use crate::param::{ConvGeometry, ConvParam};

pub fn create_conv_fp32(desc: &OpDesc, config: &KernelConfig) -> Result<Box<dyn Kernel>> {
    Ok(Box::new(ConvFp32Kernel::new(desc, config, false)?))
}

pub fn create_conv_fp32_train(desc: &OpDesc, config: &KernelConfig) -> Result<Box<dyn Kernel>> {
    Ok(Box::new(ConvFp32Kernel::new(desc, config, true)?))
}

pub struct ConvFp32Kernel {
    base: KernelBase,
    param: ConvParam,
    im2col: bool,
    geometry: Option<ConvGeometry>,
}

impl ConvFp32Kernel {
    pub fn new(desc: &OpDesc, config: &KernelConfig, im2col: bool) -> Result<Self> {
        Ok(Self {
            base: KernelBase::new(desc, config),
            param: *desc.param.as_conv()?,
            im2col,
            geometry: None,
        })
    }

    pub fn uses_im2col(&self) -> bool {
        self.im2col
    }

    fn geometry(&self) -> Result<&ConvGeometry> {
        self.geometry
            .as_ref()
            .ok_or_else(|| EmberError::param(format!("conv '{}' run before init", self.base.name)))
    }

    /// Rows of the im2col matrix (output pixels) and its row length.
    fn im2col_dims(g: &ConvGeometry) -> (usize, usize) {
        (g.out_h * g.out_w, g.kernel_h * g.kernel_w * g.in_c_per_group())
    }
}

impl Kernel for ConvFp32Kernel {
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
        self.base.expect_arity(2, 3, 1, 1)?;
        let input = &tensors[self.base.inputs[0]];
        let weight = &tensors[self.base.inputs[1]];
        for t in [input, weight] {
            if t.dtype() != DType::Float32 {
                return Err(EmberError::DTypeMismatch { expected: DType::Float32, got: t.dtype() });
            }
        }
        let mut param = self.param;
        if self.base.op == OpKind::DepthwiseConv2D {
            let in_c = input.shape().as_nhwc().map_or(0, |[_, _, _, c]| c);
            if param.group <= 1 {
                param.group = in_c;
            } else if param.group != in_c {
                return Err(EmberError::param(format!(
                    "depthwise conv '{}' has group {} but {} input channels",
                    self.base.name, param.group, in_c
                )));
            }
        }
        let g = param.geometry(input.shape(), weight.shape())?;
        if let Some(&id) = self.base.inputs.get(2) {
            let bias = &tensors[id];
            if bias.numel() != g.out_c {
                return Err(EmberError::param(format!(
                    "bias '{}' has {} entries, conv has {} output channels",
                    bias.name(),
                    bias.numel(),
                    g.out_c
                )));
            }
        }
        let output = &mut tensors[self.base.outputs[0]];
        if output.dtype() != DType::Float32 {
            return Err(EmberError::DTypeMismatch { expected: DType::Float32, got: output.dtype() });
        }
        output.set_shape(g.output_shape());
        tracing::debug!(kernel = %self.base.name, im2col = self.im2col, out = %g.output_shape(), "conv fp32 resized");
        self.geometry = Some(g);
        Ok(())
    }

    fn workspace_size(&self) -> usize {
        match (&self.geometry, self.im2col) {
            (Some(g), true) => {
                let (rows, k) = Self::im2col_dims(g);
                rows * k * std::mem::size_of::<f32>()
            }
            _ => 0,
        }
    }

    fn run(&mut self, inputs: &[&Tensor], outputs: &mut [Tensor], ctx: &mut RunContext<'_>) -> Result<()> {
        let g = *self.geometry()?;
        if inputs[0].shape() != &g.input_shape() {
            return Err(EmberError::param(format!(
                "conv '{}' input is {} but was prepared for {}",
                self.base.name,
                inputs[0].shape(),
                g.input_shape()
            )));
        }
        let x = inputs[0].as_f32()?;
        let w = inputs[1].as_f32()?;
        let bias = match inputs.get(2) {
            Some(t) => Some(t.as_f32()?),
            None => None,
        };
        let y = outputs[0].as_f32_mut()?;
        let act = self.param.act_type;

        if self.im2col {
            let (rows, k) = Self::im2col_dims(&g);
            let col = ctx.workspace.f32_mut(rows * k)?;
            let ocg = g.out_c_per_group();
            for b in 0..g.batch {
                for grp in 0..g.group {
                    fill_im2col(&g, x, b, grp, col);
                    for p in 0..rows {
                        let col_row = &col[p * k..(p + 1) * k];
                        let y_base = (b * rows + p) * g.out_c;
                        for oc in grp * ocg..(grp + 1) * ocg {
                            let w_row = &w[oc * k..(oc + 1) * k];
                            let mut acc = 0.0f32;
                            for (a, c) in col_row.iter().zip(w_row) {
                                acc += a * c;
                            }
                            let with_bias = acc + bias.map_or(0.0, |bv| bv[oc]);
                            y[y_base + oc] = act.apply(with_bias);
                        }
                    }
                }
            }
            return Ok(());
        }

        let row_len = g.out_w * g.out_c;
        if row_len == 0 {
            return Ok(());
        }
        let compute = |(row, dst): (usize, &mut [f32])| {
            direct_row(&g, x, w, bias, row, dst);
            for v in dst.iter_mut() {
                *v = act.apply(*v);
            }
        };
        match ctx.pool {
            Some(pool) => pool.install(|| y.par_chunks_mut(row_len).enumerate().for_each(compute)),
            None => y.chunks_mut(row_len).enumerate().for_each(compute),
        }
        Ok(())
    }
}

/// Fill `col` (`[out_h * out_w][kh * kw * icg]`) for image `b`, group `grp`.
fn fill_im2col(g: &ConvGeometry, x: &[f32], b: usize, grp: usize, col: &mut [f32]) {
    let icg = g.in_c_per_group();
    let k = g.kernel_h * g.kernel_w * icg;
    for oh in 0..g.out_h {
        for ow in 0..g.out_w {
            let row = &mut col[(oh * g.out_w + ow) * k..(oh * g.out_w + ow + 1) * k];
            for kh in 0..g.kernel_h {
                for kw in 0..g.kernel_w {
                    let dst = &mut row[(kh * g.kernel_w + kw) * icg..(kh * g.kernel_w + kw + 1) * icg];
                    match (g.input_row(oh, kh), g.input_col(ow, kw)) {
                        (Some(ih), Some(iw)) => {
                            let base = ((b * g.in_h + ih) * g.in_w + iw) * g.in_c + grp * icg;
                            dst.copy_from_slice(&x[base..base + icg]);
                        }
                        _ => dst.fill(0.0),
                    }
                }
            }
        }
    }
}

fn direct_row(g: &ConvGeometry, x: &[f32], w: &[f32], bias: Option<&[f32]>, row: usize, dst: &mut [f32]) {
    let (b, oh) = (row / g.out_h, row % g.out_h);
    let (icg, ocg) = (g.in_c_per_group(), g.out_c_per_group());
    for ow in 0..g.out_w {
        for oc in 0..g.out_c {
            let grp = oc / ocg;
            let mut acc = 0.0f32;
            for kh in 0..g.kernel_h {
                let Some(ih) = g.input_row(oh, kh) else { continue };
                for kw in 0..g.kernel_w {
                    let Some(iw) = g.input_col(ow, kw) else { continue };
                    let x_base = ((b * g.in_h + ih) * g.in_w + iw) * g.in_c + grp * icg;
                    let w_base = ((oc * g.kernel_h + kh) * g.kernel_w + kw) * icg;
                    for ic in 0..icg {
                        acc += x[x_base + ic] * w[w_base + ic];
                    }
                }
            }
            dst[ow * g.out_c + oc] = acc + bias.map_or(0.0, |bv| bv[oc]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::run_kernel;
    use crate::param::{ActType, OpParameter, PadMode};
    use crate::workspace::Workspace;
    use rand::Rng;

    fn desc(op: OpKind, param: ConvParam) -> OpDesc {
        OpDesc {
            name: "conv".into(),
            op,
            param: OpParameter::Conv(param),
            inputs: vec![0, 1, 2],
            outputs: vec![3],
        }
    }

    fn tensors(in_shape: [usize; 4], w_shape: [usize; 4], rng: &mut impl Rng) -> Vec<Tensor> {
        let xn: usize = in_shape.iter().product();
        let wn: usize = w_shape.iter().product();
        let x: Vec<f32> = (0..xn).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let w: Vec<f32> = (0..wn).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let b: Vec<f32> = (0..w_shape[0]).map(|_| rng.gen_range(-1.0..1.0)).collect();
        vec![
            Tensor::from_f32("x", in_shape, &x).unwrap(),
            Tensor::from_f32("w", w_shape, &w).unwrap(),
            Tensor::from_f32("b", [w_shape[0]], &b).unwrap(),
            Tensor::new("y", DType::Float32, [0]),
        ]
    }

    fn run_variant(im2col: bool, op: OpKind, param: ConvParam, mut t: Vec<Tensor>, pool: Option<&rayon::ThreadPool>) -> Vec<f32> {
        let mut k = ConvFp32Kernel::new(&desc(op, param), &KernelConfig::default(), im2col).unwrap();
        k.init(&mut t).unwrap();
        let mut ws = Workspace::new(k.workspace_size());
        run_kernel(&mut k, &mut t, &mut RunContext::new(&mut ws, pool)).unwrap();
        t[3].as_f32().unwrap().to_vec()
    }

    #[test]
    fn test_simple_valid_conv() {
        let param = ConvParam { pad_mode: PadMode::Valid, ..Default::default() };
        let mut t = vec![
            Tensor::from_f32("x", [1, 3, 3, 1], &[1., 2., 3., 4., 5., 6., 7., 8., 9.]).unwrap(),
            Tensor::from_f32("w", [1, 2, 2, 1], &[1., 0., 0., 1.]).unwrap(),
            Tensor::from_f32("b", [1], &[0.5]).unwrap(),
            Tensor::new("y", DType::Float32, [0]),
        ];
        let mut k = ConvFp32Kernel::new(&desc(OpKind::Conv2D, param), &KernelConfig::default(), false).unwrap();
        k.init(&mut t).unwrap();
        assert_eq!(k.workspace_size(), 0);
        let mut ws = Workspace::default();
        run_kernel(&mut k, &mut t, &mut RunContext::new(&mut ws, None)).unwrap();
        assert_eq!(t[3].as_f32().unwrap(), &[6.5, 8.5, 12.5, 14.5]);
    }

    #[test]
    fn test_train_variant_matches_inference() {
        let mut rng = rand::thread_rng();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();
        let cases = [
            (ConvParam::same(3, 1), [2, 5, 6, 3], [4, 3, 3, 3]),
            (ConvParam::same(3, 2), [1, 7, 7, 2], [5, 3, 3, 2]),
            (ConvParam { act_type: ActType::Relu6, ..ConvParam::same(5, 1) }, [1, 6, 6, 1], [2, 5, 5, 1]),
            (
                ConvParam { dilation_h: 2, dilation_w: 2, pad_mode: PadMode::Valid, ..Default::default() },
                [1, 8, 8, 2],
                [3, 3, 3, 2],
            ),
            (ConvParam { group: 2, ..ConvParam::same(3, 1) }, [1, 4, 4, 4], [6, 3, 3, 2]),
        ];
        for (param, in_shape, w_shape) in cases {
            let t = tensors(in_shape, w_shape, &mut rng);
            let direct = run_variant(false, OpKind::Conv2D, param, t.clone(), None);
            let pooled = run_variant(false, OpKind::Conv2D, param, t.clone(), Some(&pool));
            let lowered = run_variant(true, OpKind::Conv2D, param, t, None);
            assert_eq!(direct, lowered, "{param:?}");
            assert_eq!(direct, pooled, "{param:?}");
        }
    }

    #[test]
    fn test_depthwise_infers_group() {
        let mut rng = rand::thread_rng();
        let t = tensors([1, 5, 5, 3], [3, 3, 3, 1], &mut rng);
        let x = t[0].as_f32().unwrap().to_vec();
        let w = t[1].as_f32().unwrap().to_vec();
        let b = t[2].as_f32().unwrap().to_vec();
        let out = run_variant(true, OpKind::DepthwiseConv2D, ConvParam::same(3, 1), t, None);
        // center pixel, channel 1
        let mut acc = 0.0f32;
        for kh in 0..3 {
            for kw in 0..3 {
                acc += x[((1 + kh) * 5 + 1 + kw) * 3 + 1] * w[9 + kh * 3 + kw];
            }
        }
        let got = out[(2 * 5 + 2) * 3 + 1];
        assert!((got - (acc + b[1])).abs() < 1e-5, "{got} vs {}", acc + b[1]);
    }

    #[test]
    fn test_workspace_size_is_im2col_buffer() {
        let mut rng = rand::thread_rng();
        let mut t = tensors([1, 6, 6, 4], [8, 3, 3, 4], &mut rng);
        let mut k = ConvFp32Kernel::new(&desc(OpKind::Conv2D, ConvParam::same(3, 2)), &KernelConfig::default(), true).unwrap();
        k.init(&mut t).unwrap();
        assert_eq!(k.workspace_size(), 3 * 3 * 3 * 3 * 4 * 4);
    }

    #[test]
    fn test_int8_input_rejected() {
        let mut t = vec![
            Tensor::from_i8("x", [1, 3, 3, 1], &[0; 9]).unwrap(),
            Tensor::from_f32("w", [1, 3, 3, 1], &[0.0; 9]).unwrap(),
            Tensor::from_f32("b", [1], &[0.0]).unwrap(),
            Tensor::new("y", DType::Float32, [0]),
        ];
        let mut k = ConvFp32Kernel::new(&desc(OpKind::Conv2D, ConvParam::same(3, 1)), &KernelConfig::default(), false).unwrap();
        assert!(matches!(k.init(&mut t), Err(EmberError::DTypeMismatch { .. })));
    }
}
