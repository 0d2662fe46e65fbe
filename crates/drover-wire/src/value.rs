//! Payload values — scalars, byte blobs, and shaped numeric tensors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from tensor construction and arithmetic.
#[derive(Debug, Error)]
pub enum TensorError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DtypeMismatch { expected: Dtype, got: Dtype },

    #[error("buffer of {got} elements does not match shape {shape:?} ({expected} elements)")]
    LengthMismatch {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },

    #[error("slab index {index} out of range for leading dimension {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Element type of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    F32,
    F64,
    I64,
}

/// Flat tensor buffer tagged with its element type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            TensorData::F32(_) => Dtype::F32,
            TensorData::F64(_) => Dtype::F64,
            TensorData::I64(_) => Dtype::I64,
        }
    }

    /// Element-wise add of a same-dtype buffer slice into a region of self.
    fn add_region(&mut self, offset: usize, other: &TensorData) -> Result<(), TensorError> {
        match (self, other) {
            (TensorData::F32(dst), TensorData::F32(src)) => {
                for (d, s) in dst[offset..offset + src.len()].iter_mut().zip(src) {
                    *d += *s;
                }
                Ok(())
            }
            (TensorData::F64(dst), TensorData::F64(src)) => {
                for (d, s) in dst[offset..offset + src.len()].iter_mut().zip(src) {
                    *d += *s;
                }
                Ok(())
            }
            (TensorData::I64(dst), TensorData::I64(src)) => {
                for (d, s) in dst[offset..offset + src.len()].iter_mut().zip(src) {
                    *d += *s;
                }
                Ok(())
            }
            (dst, src) => Err(TensorError::DtypeMismatch {
                expected: dst.dtype(),
                got: src.dtype(),
            }),
        }
    }
}

/// Dense n-dimensional array, row-major.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

/// Deserialization routes through [`Tensor::new`] so the shape/buffer
/// invariant holds for tensors arriving off the wire, not just
/// constructed ones.
impl<'de> Deserialize<'de> for Tensor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            shape: Vec<usize>,
            data: TensorData,
        }
        let raw = Raw::deserialize(deserializer)?;
        Tensor::new(raw.shape, raw.data).map_err(serde::de::Error::custom)
    }
}

impl Tensor {
    /// Build a tensor after checking the buffer length against the shape.
    /// A shape whose element count overflows `usize` is rejected outright.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, TensorError> {
        let expected = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim));
        match expected {
            Some(n) if n == data.len() => Ok(Self { shape, data }),
            _ => Err(TensorError::LengthMismatch {
                expected: expected.unwrap_or(usize::MAX),
                got: data.len(),
                shape,
            }),
        }
    }

    /// Zero-filled f32 tensor of the given shape.
    pub fn zeros_f32(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: TensorData::F32(vec![0.0; len]),
        }
    }

    /// Tensor from an f32 buffer.
    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<Self, TensorError> {
        Self::new(shape.to_vec(), TensorData::F32(data))
    }

    /// Rank-1 f32 tensor.
    pub fn vector_f32(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data: TensorData::F32(data),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dtype(&self) -> Dtype {
        self.data.dtype()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            TensorData::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Element count of one slab, i.e. everything under the leading
    /// dimension.
    pub fn slab_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Element-wise `self += other`. Shapes, dtypes, and buffer lengths
    /// must match.
    pub fn add_assign(&mut self, other: &Tensor) -> Result<(), TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        if other.data.len() != self.data.len() {
            return Err(TensorError::LengthMismatch {
                shape: other.shape.clone(),
                expected: self.data.len(),
                got: other.data.len(),
            });
        }
        self.data.add_region(0, &other.data)
    }

    /// `self[index] += slab`, where `slab`'s shape must equal this
    /// tensor's shape with the leading dimension stripped.
    pub fn add_slab(&mut self, index: usize, slab: &Tensor) -> Result<(), TensorError> {
        let expected = self.shape.get(1..).unwrap_or(&[]);
        if slab.shape != expected {
            return Err(TensorError::ShapeMismatch {
                expected: expected.to_vec(),
                got: slab.shape.clone(),
            });
        }
        let slab_len = self.slab_len();
        if slab.data.len() != slab_len {
            return Err(TensorError::LengthMismatch {
                shape: slab.shape.clone(),
                expected: slab_len,
                got: slab.data.len(),
            });
        }
        let leading = self.shape.first().copied().unwrap_or(0);
        if index >= leading {
            return Err(TensorError::IndexOutOfRange {
                index,
                len: leading,
            });
        }
        self.data.add_region(index * slab_len, &slab.data)
    }
}

/// A single named field's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tensor(Tensor),
}

impl Value {
    /// Human-readable tag for log messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tensor(_) => "tensor",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Tensor> for Value {
    fn from(v: Tensor) -> Self {
        Value::Tensor(v)
    }
}
