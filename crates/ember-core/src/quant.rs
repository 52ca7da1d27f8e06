use serde::{Deserialize, Serialize};

/// Affine quantization parameters: `real = scale * (q - zero_point)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParam {
    pub scale: f64,
    pub zero_point: i32,
}

impl QuantParam {
    pub fn new(scale: f64, zero_point: i32) -> Self {
        Self { scale, zero_point }
    }

    /// Quantize a real value into the int8 range (round half away from zero, saturating).
    pub fn quantize(&self, real: f32) -> i8 {
        let q = (f64::from(real) / self.scale).round() as i64 + i64::from(self.zero_point);
        q.clamp(i64::from(i8::MIN), i64::from(i8::MAX)) as i8
    }

    /// Map an int8 value back to a real value.
    pub fn dequantize(&self, q: i8) -> f32 {
        (self.scale * f64::from(i32::from(q) - self.zero_point)) as f32
    }
}

impl Default for QuantParam {
    fn default() -> Self {
        Self {
            scale: 1.0,
            zero_point: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_rounds_half_away_from_zero() {
        let q = QuantParam::new(1.0, 0);
        assert_eq!(q.quantize(2.5), 3);
        assert_eq!(q.quantize(-2.5), -3);
    }

    #[test]
    fn test_quantize_saturates() {
        let q = QuantParam::new(0.5, 10);
        assert_eq!(q.quantize(1000.0), 127);
        assert_eq!(q.quantize(-1000.0), -128);
    }

    #[test]
    fn test_dequantize() {
        let q = QuantParam::new(0.5, 10);
        assert_eq!(q.dequantize(14), 2.0);
    }
}
