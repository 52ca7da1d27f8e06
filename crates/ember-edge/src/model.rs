//! Model container handed to the graph compiler, plus its binary form.
//!
//! Layout:
//! ```text
//! ┌──────────────────────────────────┐
//! │ Magic: "EMBR" (4 bytes)          │
//! │ Version: u32 LE                  │
//! │ Header size: u32 LE              │
//! ├──────────────────────────────────┤
//! │ Header JSON (tensors, nodes, io) │
//! ├──────────────────────────────────┤
//! │ Padding to 64-byte alignment     │
//! ├──────────────────────────────────┤
//! │ Constant blob (64-byte aligned)  │
//! └──────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use ember_core::{DType, EmberError, QuantParam, Result, Shape, Tensor, TensorCategory, TensorData};
use ember_kernels::{OpDesc, TensorId};

/// Magic bytes identifying a serialized model.
pub const MAGIC: &[u8; 4] = b"EMBR";

/// Current format version.
pub const VERSION: u32 = 1;

const PREAMBLE: usize = 12;
const BLOB_ALIGNMENT: usize = 64;

/// One entry of the model's tensor table.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDef {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub category: TensorCategory,
    pub quant: Vec<QuantParam>,
    /// Constant payload; `None` for inputs and activations.
    pub data: Option<TensorData>,
}

impl TensorDef {
    /// A caller-fed graph input.
    pub fn input(name: impl Into<String>, dtype: DType, shape: &[usize]) -> Self {
        Self::new(name, dtype, shape, TensorCategory::Input, None)
    }

    /// A tensor produced by a kernel. The shape is filled in at compile time.
    pub fn var(name: impl Into<String>, dtype: DType) -> Self {
        Self::new(name, dtype, &[0], TensorCategory::Var, None)
    }

    /// A constant (weights, bias, fixed labels).
    pub fn constant(name: impl Into<String>, shape: &[usize], data: TensorData) -> Self {
        Self::new(name, data.dtype(), shape, TensorCategory::Const, Some(data))
    }

    fn new(
        name: impl Into<String>,
        dtype: DType,
        shape: &[usize],
        category: TensorCategory,
        data: Option<TensorData>,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: shape.to_vec(),
            category,
            quant: Vec::new(),
            data,
        }
    }

    pub fn with_quant(mut self, quant: Vec<QuantParam>) -> Self {
        self.quant = quant;
        self
    }

    /// Materialize as a runtime tensor. Constants come back bound.
    pub fn to_tensor(&self) -> Result<Tensor> {
        let mut t = Tensor::new(self.name.clone(), self.dtype, Shape::new(&self.shape))
            .with_quant(self.quant.clone())
            .with_category(self.category);
        if let Some(data) = &self.data {
            t.bind(data.clone())?;
        }
        Ok(t)
    }
}

/// A graph description: tensor table, topologically ordered nodes, and the
/// indices of graph inputs and outputs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Model {
    pub name: String,
    pub tensors: Vec<TensorDef>,
    pub nodes: Vec<OpDesc>,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Append a tensor, returning its index.
    pub fn add_tensor(&mut self, def: TensorDef) -> TensorId {
        self.tensors.push(def);
        self.tensors.len() - 1
    }

    pub fn add_node(&mut self, node: OpDesc) {
        self.nodes.push(node);
    }

    pub fn tensor_index(&self, name: &str) -> Option<TensorId> {
        self.tensors.iter().position(|t| t.name == name)
    }

    /// Serialize to a single buffer.
    pub fn export_to_buffer(&self) -> Result<Vec<u8>> {
        let mut blob = Vec::new();
        let mut entries = Vec::with_capacity(self.tensors.len());
        for t in &self.tensors {
            let range = match &t.data {
                Some(data) => {
                    blob.resize(align_up(blob.len(), BLOB_ALIGNMENT), 0);
                    let bytes = data.to_le_bytes();
                    let range = BlobRange { offset: blob.len(), nbytes: bytes.len() };
                    blob.extend_from_slice(&bytes);
                    Some(range)
                }
                None => None,
            };
            entries.push(TensorEntry {
                name: t.name.clone(),
                dtype: t.dtype,
                shape: t.shape.clone(),
                category: t.category,
                quant: t.quant.clone(),
                blob: range,
            });
        }
        let header = ModelHeader {
            name: self.name.clone(),
            tensors: entries,
            nodes: self.nodes.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        };
        let header_json = serde_json::to_vec(&header).map_err(|e| EmberError::Format(e.to_string()))?;
        let header_size = u32::try_from(header_json.len())
            .map_err(|_| EmberError::Format(format!("header of {} bytes is too large", header_json.len())))?;

        let blob_start = align_up(PREAMBLE + header_json.len(), BLOB_ALIGNMENT);
        let mut buf = Vec::with_capacity(blob_start + blob.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&header_size.to_le_bytes());
        buf.extend_from_slice(&header_json);
        buf.resize(blob_start, 0);
        buf.extend_from_slice(&blob);
        Ok(buf)
    }

    /// Parse a buffer produced by [`Model::export_to_buffer`].
    pub fn from_buffer(data: &[u8]) -> Result<Self> {
        if data.len() < PREAMBLE {
            return Err(EmberError::Format(format!("buffer of {} bytes is too small", data.len())));
        }
        if &data[0..4] != MAGIC {
            return Err(EmberError::Format("invalid magic bytes (expected EMBR)".into()));
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != VERSION {
            return Err(EmberError::Format(format!("unsupported version: {version}")));
        }
        let header_size = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        let header_end = PREAMBLE
            .checked_add(header_size)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| EmberError::Format("truncated header".into()))?;
        let header: ModelHeader = serde_json::from_slice(&data[PREAMBLE..header_end])
            .map_err(|e| EmberError::Format(format!("invalid header: {e}")))?;

        let blob_start = align_up(header_end, BLOB_ALIGNMENT).min(data.len());
        let blob = &data[blob_start..];

        let mut tensors = Vec::with_capacity(header.tensors.len());
        for entry in header.tensors {
            let numel = entry
                .shape
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| EmberError::Format(format!("tensor '{}' shape {:?} overflows", entry.name, entry.shape)))?;
            let data = match entry.blob {
                Some(BlobRange { offset, nbytes }) => {
                    let bytes = offset
                        .checked_add(nbytes)
                        .and_then(|end| blob.get(offset..end))
                        .ok_or_else(|| EmberError::Format(format!("tensor '{}' data is out of range", entry.name)))?;
                    let expected = numel.checked_mul(entry.dtype.element_size());
                    if expected != Some(bytes.len()) {
                        return Err(EmberError::Format(format!(
                            "tensor '{}' has {} bytes, shape {:?} needs {} elements",
                            entry.name,
                            bytes.len(),
                            entry.shape,
                            numel
                        )));
                    }
                    Some(TensorData::from_le_bytes(entry.dtype, bytes)?)
                }
                None => None,
            };
            tensors.push(TensorDef {
                name: entry.name,
                dtype: entry.dtype,
                shape: entry.shape,
                category: entry.category,
                quant: entry.quant,
                data,
            });
        }
        Ok(Self {
            name: header.name,
            tensors,
            nodes: header.nodes,
            inputs: header.inputs,
            outputs: header.outputs,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelHeader {
    name: String,
    tensors: Vec<TensorEntry>,
    nodes: Vec<OpDesc>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorEntry {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    category: TensorCategory,
    #[serde(default)]
    quant: Vec<QuantParam>,
    #[serde(default)]
    blob: Option<BlobRange>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BlobRange {
    offset: usize,
    nbytes: usize,
}

/// Round `n` up to the next multiple of `align`.
fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
