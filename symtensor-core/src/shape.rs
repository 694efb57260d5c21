//! Runtime shape helpers. Static types only carry a rank; concrete extents are known
//! once inputs are bound at call time.

use crate::{Error, Result};

pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Shape of an elementwise result. Operands either agree exactly or are rank 0.
pub fn broadcast(op: &str, a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    if a == b || b.is_empty() {
        Ok(a.to_vec())
    } else if a.is_empty() {
        Ok(b.to_vec())
    } else {
        Err(Error::shape(op, format!("cannot broadcast {a:?} with {b:?}")))
    }
}

/// Row-major strides for a contiguous tensor.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert!(contiguous_strides(&[]).is_empty());
    }

    #[test]
    fn broadcast_scalar() {
        assert_eq!(broadcast("add", &[3, 2], &[]).unwrap(), vec![3, 2]);
        assert!(broadcast("add", &[3, 2], &[2, 3]).is_err());
    }
}
