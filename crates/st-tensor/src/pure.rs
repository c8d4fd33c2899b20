// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust N-dimensional tensor used by the SpiralTorch vision stack.
//!
//! Tensors are thin wrappers over `ndarray` storage plus a gradient-tracking
//! flag. The flag follows the data through every operator: the result of an
//! op tracks gradients whenever any of its operands does, and can be scoped
//! with [`GradMode`]. There is no recorded graph: layers recompute from their
//! inputs and call the `*_backward` operators here to propagate gradients.

pub mod random;
pub mod spatial;

use core::fmt;
use ndarray::{concatenate, Array3, ArrayD, ArrayView2, Axis, Ix2, Ix3, IxDyn, Slice};
use std::error::Error;

/// Result alias used throughout the pure module.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received a shape with a zero-length axis.
    InvalidDimensions { shape: Vec<usize> },
    /// Data provided to a constructor does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },
    /// An operator expected a tensor of a different rank.
    RankMismatch { expected: usize, got: usize },
    /// An index (class label, axis, split point) fell outside its bound.
    IndexOutOfRange { index: usize, bound: usize },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Numeric guard detected a non-finite or degenerate value.
    NonFiniteValue { label: &'static str, value: f32 },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { shape } => {
                write!(
                    f,
                    "invalid tensor dimensions {shape:?}; every axis must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::RankMismatch { expected, got } => {
                write!(f, "rank mismatch: expected rank {expected}, got {got}")
            }
            TensorError::IndexOutOfRange { index, bound } => {
                write!(f, "index {index} out of range for bound {bound}")
            }
            TensorError::EmptyInput(label) => {
                write!(f, "empty input supplied to {label}")
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "{label} produced a degenerate value: {value}")
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value for {label}")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "parameter '{name}' missing from state dict")
            }
        }
    }
}

impl Error for TensorError {}

/// Gradient-tracking scope applied to a single computation.
///
/// `Enabled` lets tracking flow from inputs and trainable parameters into the
/// result, `Disabled` detaches the result regardless of what fed it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GradMode {
    #[default]
    Enabled,
    Disabled,
}

impl GradMode {
    pub fn is_enabled(self) -> bool {
        matches!(self, GradMode::Enabled)
    }

    /// Applies the scope to a computation result.
    pub fn scope(self, tensor: Tensor) -> Tensor {
        match self {
            GradMode::Enabled => tensor,
            GradMode::Disabled => tensor.detach(),
        }
    }
}

impl From<bool> for GradMode {
    fn from(enabled: bool) -> Self {
        if enabled {
            GradMode::Enabled
        } else {
            GradMode::Disabled
        }
    }
}

/// Dense `f32` tensor in standard (row-major) layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: ArrayD<f32>,
    requires_grad: bool,
}

fn validate_shape(shape: &[usize]) -> PureResult<()> {
    if shape.is_empty() || shape.iter().any(|&axis| axis == 0) {
        return Err(TensorError::InvalidDimensions {
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

impl Tensor {
    /// Wraps an existing array. Every axis must be non-empty.
    pub fn from_array(data: ArrayD<f32>) -> PureResult<Self> {
        validate_shape(data.shape())?;
        Ok(Self {
            data: data.as_standard_layout().into_owned(),
            requires_grad: false,
        })
    }

    /// Create a tensor from raw row-major data.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> PureResult<Self> {
        validate_shape(shape)?;
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        let data = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| {
            TensorError::DataLength {
                expected,
                got: expected,
            }
        })?;
        Ok(Self {
            data,
            requires_grad: false,
        })
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: &[usize]) -> PureResult<Self> {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: &[usize], value: f32) -> PureResult<Self> {
        validate_shape(shape)?;
        Ok(Self {
            data: ArrayD::from_elem(IxDyn(shape), value),
            requires_grad: false,
        })
    }

    /// Builds a `[labels.len(), classes]` one-hot matrix.
    pub fn one_hot(labels: &[usize], classes: usize) -> PureResult<Self> {
        if labels.is_empty() {
            return Err(TensorError::EmptyInput("one_hot"));
        }
        let mut out = Self::zeros(&[labels.len(), classes])?;
        for (row, &label) in labels.iter().enumerate() {
            if label >= classes {
                return Err(TensorError::IndexOutOfRange {
                    index: label,
                    bound: classes,
                });
            }
            out.data[&[row, label][..]] = 1.0;
        }
        Ok(out)
    }

    /// Returns the tensor shape.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    /// Total number of elements stored in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.data
    }

    /// Copies the values out in row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, flag: bool) {
        self.requires_grad = flag;
    }

    pub fn with_requires_grad(mut self, flag: bool) -> Self {
        self.requires_grad = flag;
        self
    }

    /// Returns a copy that no longer tracks gradients.
    pub fn detach(&self) -> Self {
        Self {
            data: self.data.clone(),
            requires_grad: false,
        }
    }

    /// Wraps the result of an operator, inheriting tracking from its operands.
    pub(crate) fn derive(&self, data: ArrayD<f32>, operands: &[&Tensor]) -> Tensor {
        let requires_grad = self.requires_grad || operands.iter().any(|t| t.requires_grad);
        Tensor {
            data,
            requires_grad,
        }
    }

    pub fn expect_rank(&self, rank: usize) -> PureResult<()> {
        if self.ndim() != rank {
            return Err(TensorError::RankMismatch {
                expected: rank,
                got: self.ndim(),
            });
        }
        Ok(())
    }

    /// Returns `(rows, cols)` for a matrix.
    pub fn dims2(&self) -> PureResult<(usize, usize)> {
        self.expect_rank(2)?;
        let shape = self.shape();
        Ok((shape[0], shape[1]))
    }

    /// Returns `(batch, channels, height, width)` for an image batch.
    pub fn dims4(&self) -> PureResult<(usize, usize, usize, usize)> {
        self.expect_rank(4)?;
        let shape = self.shape();
        Ok((shape[0], shape[1], shape[2], shape[3]))
    }

    fn ensure_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: other.shape().to_vec(),
            });
        }
        Ok(())
    }

    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.ensure_same_shape(other)?;
        Ok(self.derive(&self.data + &other.data, &[other]))
    }

    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.ensure_same_shape(other)?;
        Ok(self.derive(&self.data - &other.data, &[other]))
    }

    pub fn mul(&self, other: &Tensor) -> PureResult<Tensor> {
        self.ensure_same_shape(other)?;
        Ok(self.derive(&self.data * &other.data, &[other]))
    }

    /// Adds `other` after broadcasting it to `self`'s shape.
    pub fn add_broadcast(&self, other: &Tensor) -> PureResult<Tensor> {
        let view = other
            .data
            .broadcast(self.data.raw_dim())
            .ok_or_else(|| TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: other.shape().to_vec(),
            })?;
        Ok(self.derive(&self.data + &view, &[other]))
    }

    /// Multiplies by `other` after broadcasting it to `self`'s shape.
    pub fn mul_broadcast(&self, other: &Tensor) -> PureResult<Tensor> {
        let view = other
            .data
            .broadcast(self.data.raw_dim())
            .ok_or_else(|| TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: other.shape().to_vec(),
            })?;
        Ok(self.derive(&self.data * &view, &[other]))
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        self.derive(&self.data * factor, &[])
    }

    pub fn add_scalar(&self, value: f32) -> Tensor {
        self.derive(&self.data + value, &[])
    }

    /// Applies `f` elementwise.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        self.derive(self.data.mapv(f), &[])
    }

    pub fn relu(&self) -> Tensor {
        self.map(|v| v.max(0.0))
    }

    pub fn leaky_relu(&self, slope: f32) -> Tensor {
        self.map(|v| if v >= 0.0 { v } else { v * slope })
    }

    pub fn tanh(&self) -> Tensor {
        self.map(f32::tanh)
    }

    /// Reinterprets the data with a new shape of the same volume.
    pub fn reshape(&self, shape: &[usize]) -> PureResult<Tensor> {
        validate_shape(shape)?;
        let volume: usize = shape.iter().product();
        if volume != self.len() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: shape.to_vec(),
            });
        }
        let data = self
            .data
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(shape))
            .map_err(|_| TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: shape.to_vec(),
            })?;
        Ok(self.derive(data, &[]))
    }

    fn view2(&self) -> PureResult<ArrayView2<'_, f32>> {
        self.data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| TensorError::RankMismatch {
                expected: 2,
                got: self.ndim(),
            })
    }

    /// Matrix product of two rank-2 tensors.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        let lhs = self.view2()?;
        let rhs = other.view2()?;
        if lhs.ncols() != rhs.nrows() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: other.shape().to_vec(),
            });
        }
        Ok(self.derive(lhs.dot(&rhs).into_dyn(), &[other]))
    }

    /// Transpose of a rank-2 tensor.
    pub fn transpose(&self) -> PureResult<Tensor> {
        let view = self.view2()?;
        Ok(self.derive(view.t().as_standard_layout().into_owned().into_dyn(), &[]))
    }

    /// Batched matrix product: `[b, n, k] x [b, k, m] -> [b, n, m]`.
    pub fn bmm(&self, other: &Tensor) -> PureResult<Tensor> {
        let lhs = self
            .data
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| TensorError::RankMismatch {
                expected: 3,
                got: self.ndim(),
            })?;
        let rhs = other
            .data
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| TensorError::RankMismatch {
                expected: 3,
                got: other.ndim(),
            })?;
        let (batch, rows, inner) = lhs.dim();
        let (rhs_batch, rhs_inner, cols) = rhs.dim();
        if batch != rhs_batch || inner != rhs_inner {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: other.shape().to_vec(),
            });
        }
        let mut out = Array3::<f32>::zeros((batch, rows, cols));
        for b in 0..batch {
            let product = lhs.index_axis(Axis(0), b).dot(&rhs.index_axis(Axis(0), b));
            out.index_axis_mut(Axis(0), b).assign(&product);
        }
        Ok(self.derive(out.into_dyn(), &[other]))
    }

    /// Swaps the last two axes of a rank-3 tensor.
    pub fn transpose_last2(&self) -> PureResult<Tensor> {
        self.expect_rank(3)?;
        let permuted = self.data.view().permuted_axes(IxDyn(&[0, 2, 1]));
        Ok(self.derive(permuted.as_standard_layout().into_owned(), &[]))
    }

    /// Softmax over the last axis.
    pub fn softmax_last(&self) -> Tensor {
        let last = Axis(self.ndim() - 1);
        let mut out = self.data.clone();
        for mut lane in out.lanes_mut(last) {
            let max = lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            lane.mapv_inplace(|v| (v - max).exp());
            let sum = lane.sum();
            if sum > 0.0 {
                lane.mapv_inplace(|v| v / sum);
            }
        }
        self.derive(out, &[])
    }

    /// Gradient of [`Tensor::softmax_last`], called on the softmax output.
    pub fn softmax_last_backward(&self, grad_output: &Tensor) -> PureResult<Tensor> {
        self.ensure_same_shape(grad_output)?;
        let last = self.ndim() - 1;
        let projection = self.mul(grad_output)?.sum_axis(last, true)?;
        grad_output
            .add_broadcast(&projection.scale(-1.0))?
            .mul(self)
    }

    /// Sums a broadcast result back down to `shape`: leading extra axes are
    /// dropped and axes of extent one in `shape` are summed with `keepdim`.
    pub fn sum_to_shape(&self, shape: &[usize]) -> PureResult<Tensor> {
        validate_shape(shape)?;
        if shape.len() > self.ndim() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: shape.to_vec(),
            });
        }
        let mut out = self.clone();
        while out.ndim() > shape.len() {
            out = out.sum_axis(0, false)?;
        }
        for (axis, &extent) in shape.iter().enumerate() {
            if extent == 1 && out.shape()[axis] != 1 {
                out = out.sum_axis(axis, true)?;
            }
        }
        if out.shape() != shape {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: shape.to_vec(),
            });
        }
        Ok(out)
    }

    /// Sums along `axis`, optionally keeping it as a length-one axis.
    pub fn sum_axis(&self, axis: usize, keepdim: bool) -> PureResult<Tensor> {
        if axis >= self.ndim() {
            return Err(TensorError::IndexOutOfRange {
                index: axis,
                bound: self.ndim(),
            });
        }
        if self.ndim() == 1 && !keepdim {
            return Err(TensorError::InvalidValue {
                label: "sum_axis_rank",
            });
        }
        let mut summed = self.data.sum_axis(Axis(axis));
        if keepdim {
            summed.insert_axis_inplace(Axis(axis));
        }
        Ok(self.derive(summed, &[]))
    }

    /// Mean along `axis`, keeping it as a length-one axis.
    pub fn mean_axis_keepdim(&self, axis: usize) -> PureResult<Tensor> {
        let count = *self.shape().get(axis).ok_or(TensorError::IndexOutOfRange {
            index: axis,
            bound: self.ndim(),
        })?;
        Ok(self.sum_axis(axis, true)?.scale(1.0 / count as f32))
    }

    pub fn sum_all(&self) -> f32 {
        self.data.sum()
    }

    pub fn min_value(&self) -> f32 {
        self.data.fold(f32::INFINITY, |acc, &v| acc.min(v))
    }

    pub fn max_value(&self) -> f32 {
        self.data.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v))
    }

    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Concatenates tensors along `axis`.
    pub fn concat(tensors: &[&Tensor], axis: usize) -> PureResult<Tensor> {
        let first = tensors.first().ok_or(TensorError::EmptyInput("concat"))?;
        if axis >= first.ndim() {
            return Err(TensorError::IndexOutOfRange {
                index: axis,
                bound: first.ndim(),
            });
        }
        let views: Vec<_> = tensors.iter().map(|t| t.data.view()).collect();
        let data = concatenate(Axis(axis), &views).map_err(|_| TensorError::ShapeMismatch {
            left: first.shape().to_vec(),
            right: tensors
                .iter()
                .find(|t| t.shape() != first.shape())
                .map(|t| t.shape().to_vec())
                .unwrap_or_default(),
        })?;
        Ok(first.derive(data, &tensors[1..]))
    }

    /// Splits along `axis` into consecutive pieces of the given sizes.
    pub fn split(&self, sizes: &[usize], axis: usize) -> PureResult<Vec<Tensor>> {
        let extent = *self.shape().get(axis).ok_or(TensorError::IndexOutOfRange {
            index: axis,
            bound: self.ndim(),
        })?;
        let total: usize = sizes.iter().sum();
        if total != extent || sizes.iter().any(|&size| size == 0) {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: sizes.to_vec(),
            });
        }
        let mut start = 0usize;
        let mut pieces = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let slice = self
                .data
                .slice_axis(Axis(axis), Slice::from(start..start + size))
                .to_owned();
            pieces.push(self.derive(slice, &[]));
            start += size;
        }
        Ok(pieces)
    }
}
