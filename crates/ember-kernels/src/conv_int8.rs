//! Direct int8 convolution.
//!
//! Handles any filter size, stride, dilation and group count. The 3×3
//! stride-1 case is routed to [`Conv3x3Int8Kernel`] by the creator.

use rayon::prelude::*;

use ember_core::{DType, EmberError, Result, Tensor};

use crate::conv3x3_int8::Conv3x3Int8Kernel;
use crate::kernel::{Kernel, KernelBase, KernelConfig, OpDesc, RunContext};
use crate::param::{ConvGeometry, ConvParam};
use crate::requant::Requantizer;

/// Everything an int8 convolution derives from its tensors at init/resize.
#[derive(Debug, Clone)]
pub(crate) struct QuantConvSetup {
    pub geometry: ConvGeometry,
    pub requant: Requantizer,
    pub bias: Vec<i32>,
    pub input_zp: i32,
    pub weight_zps: Vec<i32>,
}

/// Zero points must be representable in int8 so `x - zp` fits the i16 tile path.
fn check_zero_point(tensor: &str, zero_point: i32) -> Result<()> {
    if !(i8::MIN as i32..=i8::MAX as i32).contains(&zero_point) {
        return Err(EmberError::param(format!(
            "tensor '{tensor}' zero point {zero_point} is outside [-128, 127]"
        )));
    }
    Ok(())
}

/// Validate int8 conv tensors, set the output shape and build the requantizer.
pub(crate) fn prepare_quant_conv(
    base: &KernelBase,
    param: &ConvParam,
    tensors: &mut [Tensor],
) -> Result<QuantConvSetup> {
    base.expect_arity(2, 3, 1, 1)?;
    let input = &tensors[base.inputs[0]];
    let weight = &tensors[base.inputs[1]];
    for t in [input, weight] {
        if t.dtype() != DType::Int8 {
            return Err(EmberError::DTypeMismatch { expected: DType::Int8, got: t.dtype() });
        }
    }
    let geometry = param.geometry(input.shape(), weight.shape())?;

    let input_q = input
        .quant_param()
        .ok_or_else(|| EmberError::param(format!("input '{}' has no quantization", input.name())))?;
    let weight_q = weight.quant().to_vec();
    if weight_q.is_empty() {
        return Err(EmberError::param(format!("weight '{}' has no quantization", weight.name())));
    }
    check_zero_point(input.name(), input_q.zero_point)?;
    for q in &weight_q {
        check_zero_point(weight.name(), q.zero_point)?;
    }

    let bias = match base.inputs.get(2) {
        Some(&id) => {
            let b = &tensors[id];
            let data = b.as_i32()?;
            if data.len() != geometry.out_c {
                return Err(EmberError::param(format!(
                    "bias has {} entries, conv has {} output channels",
                    data.len(),
                    geometry.out_c
                )));
            }
            data.to_vec()
        }
        None => vec![0; geometry.out_c],
    };

    let output = &mut tensors[base.outputs[0]];
    if output.dtype() != DType::Int8 {
        return Err(EmberError::DTypeMismatch { expected: DType::Int8, got: output.dtype() });
    }
    let output_q = output
        .quant_param()
        .ok_or_else(|| EmberError::param(format!("output '{}' has no quantization", output.name())))?;
    check_zero_point(output.name(), output_q.zero_point)?;
    output.set_shape(geometry.output_shape());

    let requant = Requantizer::new(input_q, &weight_q, output_q, geometry.out_c, param.act_type)?;
    Ok(QuantConvSetup {
        geometry,
        requant,
        bias,
        input_zp: input_q.zero_point,
        weight_zps: weight_q.iter().map(|q| q.zero_point).collect(),
    })
}

/// Creator for `(Cpu, Int8, Conv2D)`: Winograd when the filter is 3×3 with
/// unit stride/dilation and no groups, direct otherwise.
pub fn create_conv_int8(desc: &OpDesc, config: &KernelConfig) -> Result<Box<dyn Kernel>> {
    let p = desc.param.as_conv()?;
    if Conv3x3Int8Kernel::supports(p) {
        Ok(Box::new(Conv3x3Int8Kernel::new(desc, config)?))
    } else {
        Ok(Box::new(ConvInt8Kernel::new(desc, config)?))
    }
}

pub struct ConvInt8Kernel {
    base: KernelBase,
    param: ConvParam,
    setup: Option<QuantConvSetup>,
}

impl ConvInt8Kernel {
    pub fn new(desc: &OpDesc, config: &KernelConfig) -> Result<Self> {
        Ok(Self {
            base: KernelBase::new(desc, config),
            param: *desc.param.as_conv()?,
            setup: None,
        })
    }
}

impl Kernel for ConvInt8Kernel {
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
        self.setup = Some(prepare_quant_conv(&self.base, &self.param, tensors)?);
        Ok(())
    }

    fn run(&mut self, inputs: &[&Tensor], outputs: &mut [Tensor], ctx: &mut RunContext<'_>) -> Result<()> {
        let setup = self
            .setup
            .as_ref()
            .ok_or_else(|| EmberError::param(format!("conv '{}' run before init", self.base.name)))?;
        let g = setup.geometry;
        let x = inputs[0].as_i8()?;
        let w = inputs[1].as_i8()?;
        if inputs[0].shape() != &g.input_shape() {
            return Err(EmberError::param(format!(
                "conv '{}' input is {} but was prepared for {}",
                self.base.name,
                inputs[0].shape(),
                g.input_shape()
            )));
        }
        let y = outputs[0].as_i8_mut()?;
        let row_len = g.out_w * g.out_c;
        if row_len == 0 {
            return Ok(());
        }

        let compute = |(row, dst): (usize, &mut [i8])| direct_row(&g, setup, x, w, row, dst);
        let results: Vec<Result<()>> = match ctx.pool {
            Some(pool) => pool.install(|| y.par_chunks_mut(row_len).enumerate().map(compute).collect()),
            None => y.chunks_mut(row_len).enumerate().map(compute).collect(),
        };
        results.into_iter().collect()
    }
}

/// Compute output row `row` (= batch * out_h + oh) into `dst`.
fn direct_row(
    g: &ConvGeometry,
    setup: &QuantConvSetup,
    x: &[i8],
    w: &[i8],
    row: usize,
    dst: &mut [i8],
) -> Result<()> {
    let (b, oh) = (row / g.out_h, row % g.out_h);
    let (icg, ocg) = (g.in_c_per_group(), g.out_c_per_group());
    for ow in 0..g.out_w {
        for oc in 0..g.out_c {
            let grp = oc / ocg;
            let w_zp = setup.weight_zps.get(oc).or_else(|| setup.weight_zps.first()).copied().unwrap_or(0);
            let mut acc = 0i64;
            for kh in 0..g.kernel_h {
                let Some(ih) = g.input_row(oh, kh) else { continue };
                for kw in 0..g.kernel_w {
                    let Some(iw) = g.input_col(ow, kw) else { continue };
                    let x_base = ((b * g.in_h + ih) * g.in_w + iw) * g.in_c + grp * icg;
                    let w_base = ((oc * g.kernel_h + kh) * g.kernel_w + kw) * icg;
                    for ic in 0..icg {
                        let xv = i64::from(x[x_base + ic]) - i64::from(setup.input_zp);
                        let wv = i64::from(w[w_base + ic]) - i64::from(w_zp);
                        acc += xv * wv;
                    }
                }
            }
            acc += i64::from(setup.bias[oc]);
            let acc = i32::try_from(acc)
                .map_err(|_| EmberError::worker(row, format!("accumulator overflow at channel {oc}")))?;
            dst[ow * g.out_c + oc] = setup.requant.apply(acc, oc);
        }
    }
    Ok(())
}
