use half::{bf16, f16};

use super::{DType, ElemKind};
use crate::{Error, Result};

/// Type-erased, contiguous host memory for one of the supported element kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    U8(Vec<u8>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Run `$body` with `$v` bound to the typed vector inside a [`HostData`].
macro_rules! with_host_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            $crate::dtype::HostData::U8($v) => $body,
            $crate::dtype::HostData::U32($v) => $body,
            $crate::dtype::HostData::I32($v) => $body,
            $crate::dtype::HostData::I64($v) => $body,
            $crate::dtype::HostData::F16($v) => $body,
            $crate::dtype::HostData::BF16($v) => $body,
            $crate::dtype::HostData::F32($v) => $body,
            $crate::dtype::HostData::F64($v) => $body,
        }
    };
}

/// Run `$body` with the type alias `$t` naming the Rust type of an [`ElemKind`].
macro_rules! with_elem_kind {
    ($kind:expr, $t:ident => $body:expr) => {
        match $kind {
            $crate::dtype::ElemKind::U8 => {
                type $t = u8;
                $body
            }
            $crate::dtype::ElemKind::U32 => {
                type $t = u32;
                $body
            }
            $crate::dtype::ElemKind::I32 => {
                type $t = i32;
                $body
            }
            $crate::dtype::ElemKind::I64 => {
                type $t = i64;
                $body
            }
            $crate::dtype::ElemKind::F16 => {
                type $t = half::f16;
                $body
            }
            $crate::dtype::ElemKind::BF16 => {
                type $t = half::bf16;
                $body
            }
            $crate::dtype::ElemKind::F32 => {
                type $t = f32;
                $body
            }
            $crate::dtype::ElemKind::F64 => {
                type $t = f64;
                $body
            }
        }
    };
}

pub(crate) use with_elem_kind;
pub(crate) use with_host_data;

impl HostData {
    pub fn kind(&self) -> ElemKind {
        match self {
            Self::U8(_) => ElemKind::U8,
            Self::U32(_) => ElemKind::U32,
            Self::I32(_) => ElemKind::I32,
            Self::I64(_) => ElemKind::I64,
            Self::F16(_) => ElemKind::F16,
            Self::BF16(_) => ElemKind::BF16,
            Self::F32(_) => ElemKind::F32,
            Self::F64(_) => ElemKind::F64,
        }
    }

    pub fn len(&self) -> usize {
        with_host_data!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.kind().size_in_bytes()
    }

    pub fn zeros(kind: ElemKind, len: usize) -> Self {
        with_elem_kind!(kind, T => T::wrap(vec![T::ZERO; len]))
    }

    pub fn from_f64(kind: ElemKind, values: &[f64]) -> Self {
        with_elem_kind!(kind, T => T::wrap(values.iter().map(|x| T::from_f64(*x)).collect()))
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_host_data!(self, v => v.iter().map(|x| x.to_f64()).collect())
    }

    /// Typed view of the data, failing when `T` is not the stored kind.
    pub fn as_slice<T: DType>(&self) -> Result<&[T]> {
        T::as_slice(self).ok_or_else(|| {
            Error::type_error(
                "access",
                format!("data holds {} but {} was requested", self.kind(), T::KIND),
            )
        })
    }

    pub fn as_mut_slice<T: DType>(&mut self) -> Result<&mut [T]> {
        let kind = self.kind();
        T::as_mut_slice(self).ok_or_else(|| {
            Error::type_error(
                "access",
                format!("data holds {kind} but {} was requested", T::KIND),
            )
        })
    }

    /// A copy of the first `numel` elements.
    pub fn prefix(&self, numel: usize) -> Result<Self> {
        if numel > self.len() {
            return Err(Error::shape(
                "prefix",
                format!("{numel} elements requested from a buffer of {}", self.len()),
            ));
        }
        Ok(with_host_data!(self, v => HostData::from(v[..numel].to_vec())))
    }

    /// Overwrite the first `src.len()` elements with `src`.
    pub fn copy_prefix_from(&mut self, src: &HostData, numel: usize) -> Result<()> {
        if src.kind() != self.kind() {
            return Err(Error::type_error(
                "copy",
                format!("cannot copy {} into {}", src.kind(), self.kind()),
            ));
        }
        if numel > src.len() || numel > self.len() {
            return Err(Error::shape(
                "copy",
                format!(
                    "{numel} elements do not fit (source {}, destination {})",
                    src.len(),
                    self.len()
                ),
            ));
        }
        with_host_data!(self, dst => copy_typed(dst, src, numel))
    }

    /// Convert every element into `kind`, going through `f64`.
    pub fn cast(&self, kind: ElemKind) -> Self {
        if kind == self.kind() {
            return self.clone();
        }
        with_host_data!(self, src => {
            with_elem_kind!(kind, T => T::wrap(src.iter().map(|x| T::from_f64(x.to_f64())).collect()))
        })
    }
}

fn copy_typed<T: DType>(dst: &mut [T], src: &HostData, numel: usize) -> Result<()> {
    let src = src.as_slice::<T>()?;
    dst[..numel].copy_from_slice(&src[..numel]);
    Ok(())
}

macro_rules! from_vec {
    ($t:ty, $variant:ident) => {
        impl From<Vec<$t>> for HostData {
            fn from(v: Vec<$t>) -> Self {
                HostData::$variant(v)
            }
        }
    };
}

from_vec!(u8, U8);
from_vec!(u32, U32);
from_vec!(i32, I32);
from_vec!(i64, I64);
from_vec!(f16, F16);
from_vec!(bf16, BF16);
from_vec!(f32, F32);
from_vec!(f64, F64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cast_truncates_toward_zero() {
        let data = HostData::from(vec![1.7f32, -2.5, 3.0]);
        assert_eq!(data.cast(ElemKind::I32), HostData::I32(vec![1, -2, 3]));
    }

    #[test]
    fn prefix_copy() {
        let mut dst = HostData::zeros(ElemKind::F32, 4);
        dst.copy_prefix_from(&HostData::from(vec![1f32, 2.]), 2).unwrap();
        assert_eq!(dst, HostData::F32(vec![1., 2., 0., 0.]));
        assert_eq!(dst.prefix(2).unwrap(), HostData::F32(vec![1., 2.]));
        assert!(dst.prefix(5).is_err());
    }
}
