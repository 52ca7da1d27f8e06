//! Integer-only requantization.
//!
//! A real multiplier `in_scale * w_scale / out_scale` is encoded as a Q31
//! fixed-point multiplier plus a power-of-two shift. Every rounding step in
//! this module rounds half away from zero.

use ember_core::{EmberError, QuantParam, Result};

use crate::param::ActType;

/// Encode `real` as `(multiplier, shift)` with `real ≈ multiplier * 2^(shift - 31)`
/// and `multiplier` in `[2^30, 2^31)`. Returns `(0, 0)` for zero and for values
/// too small to represent.
pub fn quantize_multiplier(real: f64) -> Result<(i32, i32)> {
    if !real.is_finite() || real < 0.0 {
        return Err(EmberError::param(format!("invalid requantization scale {real}")));
    }
    if real == 0.0 {
        return Ok((0, 0));
    }
    // frexp: real = q * 2^shift with q in [0.5, 1)
    let mut q = real;
    let mut shift = 0i32;
    while q >= 1.0 {
        q /= 2.0;
        shift += 1;
    }
    while q < 0.5 {
        q *= 2.0;
        shift -= 1;
        if shift < -62 {
            return Ok((0, 0));
        }
    }
    let mut q_fixed = (q * (1i64 << 31) as f64).round() as i64;
    if q_fixed == 1i64 << 31 {
        q_fixed /= 2;
        shift += 1;
    }
    if shift < -31 {
        return Ok((0, 0));
    }
    if shift > 30 {
        return Err(EmberError::param(format!("requantization scale {real} is too large")));
    }
    Ok((q_fixed as i32, shift))
}

/// `round(a * b / 2^31)`, saturating the single overflow case.
#[inline]
pub fn saturating_rounding_doubling_high_mul(a: i32, b: i32) -> i32 {
    if a == i32::MIN && b == i32::MIN {
        return i32::MAX;
    }
    let ab = i64::from(a) * i64::from(b);
    let nudge = if ab >= 0 { 1i64 << 30 } else { -(1i64 << 30) };
    ((ab + nudge) / (1i64 << 31)) as i32
}

/// `round(x / 2^exponent)`.
#[inline]
pub fn rounding_divide_by_pot(x: i32, exponent: i32) -> i32 {
    if exponent <= 0 {
        return x;
    }
    let x = i64::from(x);
    let mask = (1i64 << exponent) - 1;
    let remainder = x & mask;
    let threshold = (mask >> 1) + i64::from(x < 0);
    ((x >> exponent) + i64::from(remainder > threshold)) as i32
}

/// Scale `x` by the fixed-point `(multiplier, shift)` pair.
#[inline]
pub fn multiply_by_quantized_multiplier(x: i32, multiplier: i32, shift: i32) -> i32 {
    let left = shift.max(0);
    let right = (-shift).max(0);
    let shifted = (i128::from(x) << left).clamp(i128::from(i32::MIN), i128::from(i32::MAX)) as i32;
    rounding_divide_by_pot(saturating_rounding_doubling_high_mul(shifted, multiplier), right)
}

/// Quantized clamp bounds for a fused activation.
pub fn quant_activation_range(act: ActType, output: QuantParam) -> Result<(i32, i32)> {
    let lo = i32::from(i8::MIN);
    let hi = i32::from(i8::MAX);
    let zp = output.zero_point;
    match act {
        ActType::None => Ok((lo, hi)),
        ActType::Relu => Ok((zp.clamp(lo, hi), hi)),
        ActType::Relu6 => {
            let six = (6.0 / output.scale).round() as i64 + i64::from(zp);
            Ok((zp.clamp(lo, hi), six.clamp(i64::from(lo), i64::from(hi)) as i32))
        }
        ActType::Sigmoid => Err(EmberError::param("sigmoid cannot be fused into an int8 convolution")),
    }
}

/// Per-output-channel requantization from an int32 accumulator to int8.
#[derive(Debug, Clone, PartialEq)]
pub struct Requantizer {
    multipliers: Vec<i32>,
    shifts: Vec<i32>,
    out_zp: i32,
    act_min: i32,
    act_max: i32,
}

impl Requantizer {
    /// `weights` holds one entry (per-tensor) or `out_c` entries (per-channel).
    pub fn new(
        input: QuantParam,
        weights: &[QuantParam],
        output: QuantParam,
        out_c: usize,
        act: ActType,
    ) -> Result<Self> {
        if weights.len() != 1 && weights.len() != out_c {
            return Err(EmberError::param(format!(
                "weight carries {} quant params, expected 1 or {}",
                weights.len(),
                out_c
            )));
        }
        if output.scale <= 0.0 || input.scale <= 0.0 {
            return Err(EmberError::param("quantization scales must be positive"));
        }
        let mut multipliers = Vec::with_capacity(out_c);
        let mut shifts = Vec::with_capacity(out_c);
        for c in 0..out_c {
            let w = weights[if weights.len() == 1 { 0 } else { c }];
            let (m, s) = quantize_multiplier(input.scale * w.scale / output.scale)?;
            multipliers.push(m);
            shifts.push(s);
        }
        let (act_min, act_max) = quant_activation_range(act, output)?;
        Ok(Self {
            multipliers,
            shifts,
            out_zp: output.zero_point,
            act_min,
            act_max,
        })
    }

    pub fn channels(&self) -> usize {
        self.multipliers.len()
    }

    pub fn activation_range(&self) -> (i32, i32) {
        (self.act_min, self.act_max)
    }

    /// Requantize one accumulator value of output channel `channel`.
    #[inline]
    pub fn apply(&self, acc: i32, channel: usize) -> i8 {
        let scaled = multiply_by_quantized_multiplier(acc, self.multipliers[channel], self.shifts[channel]);
        scaled
            .saturating_add(self.out_zp)
            .clamp(self.act_min, self.act_max) as i8
    }
}
