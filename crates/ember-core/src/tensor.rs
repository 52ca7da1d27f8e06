use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::EmberError;
use crate::quant::QuantParam;
use crate::shape::Shape;
use crate::Result;

/// Typed backing buffer of a bound tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Float32(Vec<f32>),
}

impl TensorData {
    /// Zero-filled buffer of `numel` elements.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        match dtype {
            DType::Int8 => TensorData::Int8(vec![0; numel]),
            DType::Int16 => TensorData::Int16(vec![0; numel]),
            DType::Int32 => TensorData::Int32(vec![0; numel]),
            DType::Float32 => TensorData::Float32(vec![0.0; numel]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Int8(_) => DType::Int8,
            TensorData::Int16(_) => DType::Int16,
            TensorData::Int32(_) => DType::Int32,
            TensorData::Float32(_) => DType::Float32,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            TensorData::Int8(v) => v.len(),
            TensorData::Int16(v) => v.len(),
            TensorData::Int32(v) => v.len(),
            TensorData::Float32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode little-endian raw bytes (as stored in a model buffer).
    pub fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        let size = dtype.element_size();
        if bytes.len() % size != 0 {
            return Err(EmberError::Format(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                dtype
            )));
        }
        let data = match dtype {
            DType::Int8 => TensorData::Int8(bytes.iter().map(|&b| b as i8).collect()),
            DType::Int16 => TensorData::Int16(
                bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            DType::Int32 => TensorData::Int32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::Float32 => TensorData::Float32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
        };
        Ok(data)
    }

    /// Encode as little-endian raw bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::Int8(v) => v.iter().map(|&x| x as u8).collect(),
            TensorData::Int16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Int32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Float32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }
}

/// Backing-storage state of a tensor.
///
/// Activations start `Unbound` and receive a buffer the first time
/// [`Tensor::ensure_bound`] is called.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TensorState {
    #[default]
    Unbound,
    Bound(TensorData),
}

/// Who owns the tensor's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Ownership {
    /// Owned by the compiled graph, dropped with it.
    #[default]
    Graph,
    /// Supplied to or read by the caller (graph inputs and outputs).
    External,
}

/// Role of a tensor in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TensorCategory {
    /// Weights, biases and labels baked into the model.
    Const,
    /// Produced by a kernel.
    #[default]
    Var,
    /// Fed by the caller before each run.
    Input,
}

/// An n-dimensional numeric buffer with shape, element type and quantization.
#[derive(Clone, Default)]
pub struct Tensor {
    name: String,
    dtype: DType,
    shape: Shape,
    quant: Vec<QuantParam>,
    category: TensorCategory,
    ownership: Ownership,
    state: TensorState,
    version: u64,
}

macro_rules! typed_access {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty, $dtype:expr) => {
        /// Borrow the bound buffer as a typed slice.
        pub fn $get(&self) -> Result<&[$ty]> {
            match &self.state {
                TensorState::Bound(TensorData::$variant(v)) => Ok(v),
                TensorState::Bound(other) => Err(EmberError::DTypeMismatch {
                    expected: $dtype,
                    got: other.dtype(),
                }),
                TensorState::Unbound => Err(EmberError::UnboundTensor(self.name.clone())),
            }
        }

        /// Mutably borrow the bound buffer as a typed slice. Bumps the version.
        pub fn $get_mut(&mut self) -> Result<&mut [$ty]> {
            match &mut self.state {
                TensorState::Bound(TensorData::$variant(v)) => {
                    self.version += 1;
                    Ok(v)
                }
                TensorState::Bound(other) => Err(EmberError::DTypeMismatch {
                    expected: $dtype,
                    got: other.dtype(),
                }),
                TensorState::Unbound => Err(EmberError::UnboundTensor(self.name.clone())),
            }
        }
    };
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create an unbound tensor.
    pub fn new(name: impl Into<String>, dtype: DType, shape: impl Into<Shape>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: shape.into(),
            ..Default::default()
        }
    }

    /// Create a bound tensor from existing data.
    pub fn with_data(
        name: impl Into<String>,
        shape: impl Into<Shape>,
        data: TensorData,
    ) -> Result<Self> {
        let mut t = Self::new(name, data.dtype(), shape);
        t.bind(data)?;
        Ok(t)
    }

    pub fn from_f32(name: impl Into<String>, shape: impl Into<Shape>, data: &[f32]) -> Result<Self> {
        Self::with_data(name, shape, TensorData::Float32(data.to_vec()))
    }

    pub fn from_i8(name: impl Into<String>, shape: impl Into<Shape>, data: &[i8]) -> Result<Self> {
        Self::with_data(name, shape, TensorData::Int8(data.to_vec()))
    }

    pub fn from_i32(name: impl Into<String>, shape: impl Into<Shape>, data: &[i32]) -> Result<Self> {
        Self::with_data(name, shape, TensorData::Int32(data.to_vec()))
    }

    /// Attach quantization parameters (builder style).
    pub fn with_quant(mut self, quant: Vec<QuantParam>) -> Self {
        self.quant = quant;
        self
    }

    /// Set the graph role (builder style).
    pub fn with_category(mut self, category: TensorCategory) -> Self {
        self.category = category;
        self
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn category(&self) -> TensorCategory {
        self.category
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn set_ownership(&mut self, ownership: Ownership) {
        self.ownership = ownership;
    }

    /// Quantization parameters (empty for float tensors, one per channel when per-channel).
    pub fn quant(&self) -> &[QuantParam] {
        &self.quant
    }

    /// First quantization parameter, if any.
    pub fn quant_param(&self) -> Option<QuantParam> {
        self.quant.first().copied()
    }

    pub fn set_quant(&mut self, quant: Vec<QuantParam>) {
        self.quant = quant;
    }

    /// Monotonic counter bumped on every mutable data access or rebind.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Change the shape. A bound buffer whose size no longer matches is released.
    pub fn set_shape(&mut self, shape: impl Into<Shape>) {
        let shape = shape.into();
        if let TensorState::Bound(data) = &self.state {
            if data.len() != shape.numel() {
                self.state = TensorState::Unbound;
                self.version += 1;
            }
        }
        self.shape = shape;
    }

    // =========================================================================
    // Backing storage
    // =========================================================================

    pub fn state(&self) -> &TensorState {
        &self.state
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.state, TensorState::Bound(_))
    }

    /// Allocate a zero-filled buffer if the tensor is unbound.
    pub fn ensure_bound(&mut self) {
        if !self.is_bound() {
            self.state = TensorState::Bound(TensorData::zeros(self.dtype, self.shape.numel()));
            self.version += 1;
        }
    }

    /// Replace the backing buffer. The data must match dtype and element count.
    pub fn bind(&mut self, data: TensorData) -> Result<()> {
        if data.dtype() != self.dtype {
            return Err(EmberError::DTypeMismatch {
                expected: self.dtype,
                got: data.dtype(),
            });
        }
        if data.len() != self.shape.numel() {
            return Err(EmberError::param(format!(
                "tensor '{}' with shape {} needs {} elements, got {}",
                self.name,
                self.shape,
                self.shape.numel(),
                data.len()
            )));
        }
        self.state = TensorState::Bound(data);
        self.version += 1;
        Ok(())
    }

    /// Release the backing buffer.
    pub fn unbind(&mut self) -> Option<TensorData> {
        match std::mem::take(&mut self.state) {
            TensorState::Bound(data) => {
                self.version += 1;
                Some(data)
            }
            TensorState::Unbound => None,
        }
    }

    /// Borrow the bound buffer.
    pub fn data(&self) -> Result<&TensorData> {
        match &self.state {
            TensorState::Bound(data) => Ok(data),
            TensorState::Unbound => Err(EmberError::UnboundTensor(self.name.clone())),
        }
    }

    typed_access!(as_i8, as_i8_mut, Int8, i8, DType::Int8);
    typed_access!(as_i16, as_i16_mut, Int16, i16, DType::Int16);
    typed_access!(as_i32, as_i32_mut, Int32, i32, DType::Int32);
    typed_access!(as_f32, as_f32_mut, Float32, f32, DType::Float32);
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(name={:?}, shape={}, dtype={}, bound={})",
            self.name,
            self.shape,
            self.dtype,
            self.is_bound()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_until_ensure_bound() {
        let mut t = Tensor::new("act", DType::Float32, [1, 2, 2, 1]);
        assert!(!t.is_bound());
        assert!(matches!(t.as_f32(), Err(EmberError::UnboundTensor(_))));

        t.ensure_bound();
        assert!(t.is_bound());
        assert_eq!(t.as_f32().unwrap(), &[0.0; 4]);
    }

    #[test]
    fn test_ensure_bound_keeps_existing_data() {
        let mut t = Tensor::from_f32("w", [2], &[1.0, 2.0]).unwrap();
        t.ensure_bound();
        assert_eq!(t.as_f32().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_dtype_mismatch() {
        let t = Tensor::from_i8("q", [2], &[1, 2]).unwrap();
        assert!(matches!(
            t.as_f32(),
            Err(EmberError::DTypeMismatch { expected: DType::Float32, got: DType::Int8 })
        ));
    }

    #[test]
    fn test_bind_checks_numel() {
        let mut t = Tensor::new("x", DType::Int32, [3]);
        assert!(t.bind(TensorData::Int32(vec![1, 2])).is_err());
        assert!(t.bind(TensorData::Int32(vec![1, 2, 3])).is_ok());
    }

    #[test]
    fn test_set_shape_releases_mismatched_buffer() {
        let mut t = Tensor::from_f32("x", [4], &[1.0; 4]).unwrap();
        t.set_shape([2, 2]);
        assert!(t.is_bound());
        t.set_shape([3, 3]);
        assert!(!t.is_bound());
    }

    #[test]
    fn test_version_bumps_on_mutation() {
        let mut t = Tensor::from_i8("w", [2], &[1, 2]).unwrap();
        let v0 = t.version();
        let _ = t.as_i8().unwrap();
        assert_eq!(t.version(), v0);
        t.as_i8_mut().unwrap()[0] = 5;
        assert!(t.version() > v0);
    }

    #[test]
    fn test_le_bytes_roundtrip() {
        let data = TensorData::Float32(vec![1.5, -2.0]);
        let bytes = data.to_le_bytes();
        assert_eq!(TensorData::from_le_bytes(DType::Float32, &bytes).unwrap(), data);
        assert!(TensorData::from_le_bytes(DType::Int32, &bytes[..3]).is_err());
    }
}
