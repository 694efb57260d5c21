use std::{fmt::Debug, sync::Arc};

use crate::{
    dtype::{DType, ElemKind, HostData},
    shape::numel,
    Error, Result,
};

/// A host-resident n dimensional array.
///
/// Cloning is cheap: the element data is shared and never mutated in place.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Arc<HostData>,
}

impl Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("elem", &self.elem())
            .field("shape", &self.shape)
            .finish()
    }
}

impl Tensor {
    pub fn new(shape: impl Into<Vec<usize>>, data: HostData) -> Result<Self> {
        let shape = shape.into();
        if numel(&shape) != data.len() {
            return Err(Error::shape(
                "tensor",
                format!("shape {shape:?} needs {} elements, got {}", numel(&shape), data.len()),
            ));
        }
        Ok(Self {
            shape,
            data: Arc::new(data),
        })
    }

    pub fn from_vec<T: DType>(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        Self::new(shape, T::wrap(data))
    }

    /// A rank 1 tensor.
    pub fn vector<T: DType>(data: Vec<T>) -> Self {
        let len = data.len();
        Self {
            shape: vec![len],
            data: Arc::new(T::wrap(data)),
        }
    }

    /// A rank 0 tensor.
    pub fn scalar<T: DType>(v: T) -> Self {
        Self {
            shape: vec![],
            data: Arc::new(T::wrap(vec![v])),
        }
    }

    pub fn zeros(elem: ElemKind, shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        Self {
            data: Arc::new(HostData::zeros(elem, numel(&shape))),
            shape,
        }
    }

    pub fn full<T: DType>(v: T, shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        Self {
            data: Arc::new(T::wrap(vec![v; numel(&shape)])),
            shape,
        }
    }

    pub(crate) fn from_shared(shape: Vec<usize>, data: Arc<HostData>) -> Self {
        Self { shape, data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn elem(&self) -> ElemKind {
        self.data.kind()
    }

    pub fn data(&self) -> &HostData {
        &self.data
    }

    pub(crate) fn shared_data(&self) -> &Arc<HostData> {
        &self.data
    }

    /// Copy the elements out as `T`, which must be the stored kind.
    pub fn to_vec<T: DType>(&self) -> Result<Vec<T>> {
        Ok(self.data.as_slice::<T>()?.to_vec())
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.data.to_f64_vec()
    }

    pub fn cast(&self, elem: ElemKind) -> Self {
        Self {
            shape: self.shape.clone(),
            data: Arc::new(self.data.cast(elem)),
        }
    }

    pub fn reshape(&self, shape: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = shape.into();
        if numel(&shape) != self.numel() {
            return Err(Error::shape(
                "reshape",
                format!("cannot view {:?} as {shape:?}", self.shape),
            ));
        }
        Ok(Self {
            shape,
            data: self.data.clone(),
        })
    }

    /// Elementwise `|a - b| <= atol + rtol * |b|`, with matching shapes. NaNs compare equal.
    pub fn all_close(&self, other: &Tensor, rtol: f64, atol: f64) -> bool {
        if self.shape != other.shape {
            return false;
        }
        let a = self.to_f64_vec();
        let b = other.to_f64_vec();
        a.iter().zip(&b).all(|(x, y)| {
            (x.is_nan() && y.is_nan()) || x == y || (x - y).abs() <= atol + rtol * y.abs()
        })
    }

    /// Largest absolute elementwise difference.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f64> {
        if self.shape != other.shape {
            return Err(Error::shape(
                "compare",
                format!("{:?} vs {:?}", self.shape, other.shape),
            ));
        }
        let a = self.to_f64_vec();
        let b = other.to_f64_vec();
        Ok(a.iter()
            .zip(&b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max))
    }
}
