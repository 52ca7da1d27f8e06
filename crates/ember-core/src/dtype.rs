use std::fmt;

use serde::{Deserialize, Serialize};

/// Element types a tensor can carry.
///
/// Int8 is the quantized storage type, Int16 the widened staging type used by
/// the transform-based convolution, Int32 the accumulator / bias type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum DType {
    /// 8-bit signed integer (affine quantized)
    Int8,
    /// 16-bit signed integer
    Int16,
    /// 32-bit signed integer
    Int32,
    /// 32-bit IEEE 754 single-precision float
    #[default]
    Float32,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::Int8 => 1,
            DType::Int16 => 2,
            DType::Int32 | DType::Float32 => 4,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Int8 => write!(f, "int8"),
            DType::Int16 => write!(f, "int16"),
            DType::Int32 => write!(f, "int32"),
            DType::Float32 => write!(f, "float32"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DType::Int8.element_size(), 1);
        assert_eq!(DType::Int16.element_size(), 2);
        assert_eq!(DType::Int32.element_size(), 4);
        assert_eq!(DType::Float32.element_size(), 4);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", DType::Float32), "float32");
        assert_eq!(format!("{}", DType::Int8), "int8");
    }
}
