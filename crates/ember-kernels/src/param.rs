//! Per-operator parameter payloads.

use serde::{Deserialize, Serialize};

use ember_core::{EmberError, Result, Shape};

/// Padding policy for spatial operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PadMode {
    /// Use `pad_u/pad_d/pad_l/pad_r` as given.
    #[default]
    Explicit,
    /// Output keeps `ceil(in / stride)`; extra padding goes to the bottom/right.
    Same,
    /// No padding.
    Valid,
}

/// Activation applied by the activation kernel or fused into a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActType {
    #[default]
    None,
    Relu,
    Relu6,
    Sigmoid,
}

impl ActType {
    /// Apply the activation to a float value.
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActType::None => x,
            ActType::Relu => x.max(0.0),
            ActType::Relu6 => x.clamp(0.0, 6.0),
            ActType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

/// Convolution parameters. Weights are `[C_out, KH, KW, C_in / group]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvParam {
    /// Filter height; 0 means "take it from the weight tensor".
    pub kernel_h: usize,
    /// Filter width; 0 means "take it from the weight tensor".
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub pad_mode: PadMode,
    pub pad_u: usize,
    pub pad_d: usize,
    pub pad_l: usize,
    pub pad_r: usize,
    pub group: usize,
    pub act_type: ActType,
}

impl Default for ConvParam {
    fn default() -> Self {
        Self {
            kernel_h: 0,
            kernel_w: 0,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            pad_mode: PadMode::Explicit,
            pad_u: 0,
            pad_d: 0,
            pad_l: 0,
            pad_r: 0,
            group: 1,
            act_type: ActType::None,
        }
    }
}

/// Fully resolved convolution geometry for concrete input and weight shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub in_c: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub out_c: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub group: usize,
}

impl ConvGeometry {
    pub fn in_c_per_group(&self) -> usize {
        self.in_c / self.group
    }

    pub fn out_c_per_group(&self) -> usize {
        self.out_c / self.group
    }

    pub fn input_shape(&self) -> Shape {
        Shape::from([self.batch, self.in_h, self.in_w, self.in_c])
    }

    pub fn output_shape(&self) -> Shape {
        Shape::from([self.batch, self.out_h, self.out_w, self.out_c])
    }

    /// Input row for filter tap `kh` of output row `oh`, or `None` inside padding.
    #[inline]
    pub fn input_row(&self, oh: usize, kh: usize) -> Option<usize> {
        (oh * self.stride_h + kh * self.dilation_h)
            .checked_sub(self.pad_top)
            .filter(|&ih| ih < self.in_h)
    }

    /// Input column for filter tap `kw` of output column `ow`, or `None` inside padding.
    #[inline]
    pub fn input_col(&self, ow: usize, kw: usize) -> Option<usize> {
        (ow * self.stride_w + kw * self.dilation_w)
            .checked_sub(self.pad_left)
            .filter(|&iw| iw < self.in_w)
    }
}

impl ConvParam {
    /// Convenience constructor for a square filter with "same" padding.
    pub fn same(kernel: usize, stride: usize) -> Self {
        Self {
            kernel_h: kernel,
            kernel_w: kernel,
            stride_h: stride,
            stride_w: stride,
            pad_mode: PadMode::Same,
            ..Default::default()
        }
    }

    /// Resolve output size and padding for NHWC `input` and `[C_out, KH, KW, C_in/g]` `weight`.
    pub fn geometry(&self, input: &Shape, weight: &Shape) -> Result<ConvGeometry> {
        let [batch, in_h, in_w, in_c] = input
            .as_nhwc()
            .ok_or_else(|| EmberError::param(format!("conv input must be NHWC, got {input}")))?;
        let [out_c, w_kh, w_kw, w_ic] = weight.as_nhwc().ok_or_else(|| {
            EmberError::param(format!("conv weight must be [C_out, KH, KW, C_in], got {weight}"))
        })?;

        if self.stride_h == 0 || self.stride_w == 0 || self.dilation_h == 0 || self.dilation_w == 0 {
            return Err(EmberError::param("stride and dilation must be >= 1"));
        }
        let group = self.group.max(1);
        if in_c % group != 0 || out_c % group != 0 {
            return Err(EmberError::param(format!(
                "channels ({in_c} in, {out_c} out) are not divisible by group {group}"
            )));
        }
        if w_ic != in_c / group {
            return Err(EmberError::param(format!(
                "weight expects {} input channels per group, input has {} / {}",
                w_ic, in_c, group
            )));
        }
        let kernel_h = if self.kernel_h == 0 { w_kh } else { self.kernel_h };
        let kernel_w = if self.kernel_w == 0 { w_kw } else { self.kernel_w };
        if kernel_h != w_kh || kernel_w != w_kw {
            return Err(EmberError::param(format!(
                "filter is {}x{} but weight is {}x{}",
                kernel_h, kernel_w, w_kh, w_kw
            )));
        }

        let dk_h = (kernel_h - 1) * self.dilation_h + 1;
        let dk_w = (kernel_w - 1) * self.dilation_w + 1;

        let (out_h, pad_top) = resolve_axis(self.pad_mode, in_h, dk_h, self.stride_h, self.pad_u, self.pad_d)?;
        let (out_w, pad_left) = resolve_axis(self.pad_mode, in_w, dk_w, self.stride_w, self.pad_l, self.pad_r)?;

        Ok(ConvGeometry {
            batch,
            in_h,
            in_w,
            in_c,
            out_h,
            out_w,
            out_c,
            kernel_h,
            kernel_w,
            stride_h: self.stride_h,
            stride_w: self.stride_w,
            dilation_h: self.dilation_h,
            dilation_w: self.dilation_w,
            pad_top,
            pad_left,
            group,
        })
    }
}

/// Output extent and leading pad along one spatial axis.
fn resolve_axis(
    mode: PadMode,
    input: usize,
    dilated_kernel: usize,
    stride: usize,
    pad_before: usize,
    pad_after: usize,
) -> Result<(usize, usize)> {
    let (padded, lead) = match mode {
        PadMode::Same => {
            let out = input.div_ceil(stride);
            let needed = ((out.max(1) - 1) * stride + dilated_kernel).saturating_sub(input);
            return Ok((out, needed / 2));
        }
        PadMode::Valid => (input, 0),
        PadMode::Explicit => (input + pad_before + pad_after, pad_before),
    };
    if padded < dilated_kernel {
        return Err(EmberError::param(format!(
            "padded extent {padded} is smaller than the dilated filter {dilated_kernel}"
        )));
    }
    Ok(((padded - dilated_kernel) / stride + 1, lead))
}

/// Parameter block of one operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OpParameter {
    Conv(ConvParam),
    Activation(ActType),
    SoftmaxCrossEntropy,
}

impl OpParameter {
    pub fn as_conv(&self) -> Result<&ConvParam> {
        match self {
            OpParameter::Conv(p) => Ok(p),
            other => Err(EmberError::param(format!("expected conv parameters, got {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_padding_stride1() {
        let p = ConvParam::same(3, 1);
        let g = p.geometry(&Shape::from([1, 5, 5, 1]), &Shape::from([1, 3, 3, 1])).unwrap();
        assert_eq!((g.out_h, g.out_w), (5, 5));
        assert_eq!((g.pad_top, g.pad_left), (1, 1));
    }

    #[test]
    fn test_same_padding_stride2() {
        let p = ConvParam::same(3, 2);
        let g = p.geometry(&Shape::from([1, 6, 6, 2]), &Shape::from([4, 3, 3, 2])).unwrap();
        assert_eq!((g.out_h, g.out_w, g.out_c), (3, 3, 4));
        // needed = (3-1)*2 + 3 - 6 = 1 -> top 0, bottom 1
        assert_eq!(g.pad_top, 0);
    }

    #[test]
    fn test_valid_and_explicit() {
        let mut p = ConvParam { pad_mode: PadMode::Valid, ..Default::default() };
        let g = p.geometry(&Shape::from([2, 7, 9, 3]), &Shape::from([8, 3, 3, 3])).unwrap();
        assert_eq!((g.batch, g.out_h, g.out_w), (2, 5, 7));

        p.pad_mode = PadMode::Explicit;
        p.pad_u = 2;
        p.pad_l = 1;
        let g = p.geometry(&Shape::from([1, 4, 4, 3]), &Shape::from([8, 3, 3, 3])).unwrap();
        assert_eq!((g.out_h, g.out_w, g.pad_top, g.pad_left), (4, 3, 2, 1));
    }

    #[test]
    fn test_dilation() {
        let p = ConvParam { dilation_h: 2, dilation_w: 2, pad_mode: PadMode::Valid, ..Default::default() };
        let g = p.geometry(&Shape::from([1, 7, 7, 1]), &Shape::from([1, 3, 3, 1])).unwrap();
        assert_eq!((g.out_h, g.out_w), (3, 3));
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let p = ConvParam::same(3, 1);
        let err = p.geometry(&Shape::from([1, 5, 5, 2]), &Shape::from([1, 3, 3, 3]));
        assert!(matches!(err, Err(EmberError::Parameter(_))));
    }

    #[test]
    fn test_depthwise_geometry() {
        let p = ConvParam { group: 4, ..ConvParam::same(3, 1) };
        let g = p.geometry(&Shape::from([1, 4, 4, 4]), &Shape::from([4, 3, 3, 1])).unwrap();
        assert_eq!(g.in_c_per_group(), 1);
        assert_eq!(g.out_c_per_group(), 1);
    }

    #[test]
    fn test_filter_larger_than_input() {
        let p = ConvParam { pad_mode: PadMode::Valid, ..Default::default() };
        assert!(p.geometry(&Shape::from([1, 2, 2, 1]), &Shape::from([1, 3, 3, 1])).is_err());
    }

    #[test]
    fn test_act_apply() {
        assert_eq!(ActType::Relu.apply(-1.0), 0.0);
        assert_eq!(ActType::Relu6.apply(9.0), 6.0);
        assert!((ActType::Sigmoid.apply(0.0) - 0.5).abs() < 1e-6);
    }
}
