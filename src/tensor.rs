//! Owned tensor values exchanged with inference graphs.

use ndarray::{ArrayD, Axis, IxDyn, Slice, concatenate};

use crate::error::{EngineError, Result};

/// A dense tensor in one of the two element types graphs use.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    Float(ArrayD<f32>),
    Int(ArrayD<i32>),
}

impl Tensor {
    /// Build a float tensor from a shape and row-major data.
    ///
    /// # Errors
    /// Returns a shape error if `data.len()` does not match the shape.
    pub fn float(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        ArrayD::from_shape_vec(IxDyn(shape), data).map(Tensor::Float).map_err(|e| EngineError::shape(format!("float tensor {:?}: {}", shape, e)))
    }

    /// Build an int tensor from a shape and row-major data.
    ///
    /// # Errors
    /// Returns a shape error if `data.len()` does not match the shape.
    pub fn int(shape: &[usize], data: Vec<i32>) -> Result<Self> {
        ArrayD::from_shape_vec(IxDyn(shape), data).map(Tensor::Int).map_err(|e| EngineError::shape(format!("int tensor {:?}: {}", shape, e)))
    }

    /// A one-element float tensor of shape `[1]`.
    pub fn scalar_f32(value: f32) -> Self {
        Tensor::Float(ArrayD::from_elem(IxDyn(&[1]), value))
    }

    /// A one-element int tensor of shape `[1]`.
    pub fn scalar_i32(value: i32) -> Self {
        Tensor::Int(ArrayD::from_elem(IxDyn(&[1]), value))
    }

    /// Float zeros with the given shape.
    pub fn zeros_f32(shape: &[usize]) -> Self {
        Tensor::Float(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::Float(a) => a.shape(),
            Tensor::Int(a) => a.shape(),
        }
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        match self {
            Tensor::Float(a) => a.len(),
            Tensor::Int(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            Tensor::Float(_) => "f32",
            Tensor::Int(_) => "i32",
        }
    }

    /// Borrow the float array.
    ///
    /// # Errors
    /// Returns a shape error for int tensors.
    pub fn as_float(&self) -> Result<&ArrayD<f32>> {
        match self {
            Tensor::Float(a) => Ok(a),
            Tensor::Int(_) => Err(EngineError::shape("expected f32 tensor, got i32")),
        }
    }

    /// Borrow the int array.
    ///
    /// # Errors
    /// Returns a shape error for float tensors.
    pub fn as_int(&self) -> Result<&ArrayD<i32>> {
        match self {
            Tensor::Int(a) => Ok(a),
            Tensor::Float(_) => Err(EngineError::shape("expected i32 tensor, got f32")),
        }
    }

    /// Flatten to f32 in logical order. Int elements are cast.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Tensor::Float(a) => a.iter().copied().collect(),
            Tensor::Int(a) => a.iter().map(|&v| v as f32).collect(),
        }
    }

    /// Flatten to i32 in logical order. Float elements are truncated.
    pub fn to_i32_vec(&self) -> Vec<i32> {
        match self {
            Tensor::Int(a) => a.iter().copied().collect(),
            Tensor::Float(a) => a.iter().map(|&v| v as i32).collect(),
        }
    }

    /// First element read as i32, used for scalar control tensors.
    ///
    /// # Errors
    /// Returns a shape error if the tensor is empty.
    pub fn first_i32(&self) -> Result<i32> {
        let value = match self {
            Tensor::Int(a) => a.iter().next().copied(),
            Tensor::Float(a) => a.iter().next().map(|&v| v as i32),
        };
        value.ok_or_else(|| EngineError::shape("empty scalar tensor"))
    }

    /// First element read as f32.
    ///
    /// # Errors
    /// Returns a shape error if the tensor is empty.
    pub fn first_f32(&self) -> Result<f32> {
        let value = match self {
            Tensor::Float(a) => a.iter().next().copied(),
            Tensor::Int(a) => a.iter().next().map(|&v| v as f32),
        };
        value.ok_or_else(|| EngineError::shape("empty scalar tensor"))
    }
}

/// Slice a float array along `axis` with a half-open range.
///
/// Out-of-range bounds are clamped, so a request longer than the axis
/// yields the whole axis.
pub fn slice_axis(array: &ArrayD<f32>, axis: usize, start: usize, end: usize) -> ArrayD<f32> {
    let len = array.len_of(Axis(axis));
    let end = end.min(len);
    let start = start.min(end);
    array.slice_axis(Axis(axis), Slice::from(start..end)).to_owned()
}

/// Keep the trailing `count` entries of `axis` (all of them when shorter).
pub fn tail_axis(array: &ArrayD<f32>, axis: usize, count: usize) -> ArrayD<f32> {
    let len = array.len_of(Axis(axis));
    slice_axis(array, axis, len.saturating_sub(count), len)
}

/// Concatenate float arrays along `axis`.
///
/// # Errors
/// Returns a shape error when the non-concatenated axes disagree.
pub fn concat_axis(axis: usize, parts: &[&ArrayD<f32>]) -> Result<ArrayD<f32>> {
    let views: Vec<_> = parts.iter().map(|a| a.view()).collect();
    concatenate(Axis(axis), &views).map_err(|e| EngineError::shape(format!("concat along axis {}: {}", axis, e)))
}
