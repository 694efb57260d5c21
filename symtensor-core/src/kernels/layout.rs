use rayon::iter::{IndexedParallelIterator, IntoParallelRefMutIterator, ParallelIterator};

use super::{kernel_mismatch, require_input, KernelArgs};
use crate::{
    dtype::{with_host_data, DType},
    graph::OpKind,
    shape::{contiguous_strides, numel},
    Error, Result,
};

/// Data is row-major and contiguous, so a reshape only copies.
pub(crate) fn reshape(op: &OpKind, args: KernelArgs<'_>) -> Result<()> {
    if !matches!(op, OpKind::Reshape { .. }) {
        return Err(kernel_mismatch("reshape", op));
    }
    let src = require_input(op, &args.inputs[0])?;
    let n = numel(args.out_shape);
    if numel(&args.shapes[0]) != n {
        return Err(Error::shape(
            "reshape",
            format!("cannot reshape {:?} into {:?}", args.shapes[0], args.out_shape),
        ));
    }
    args.out.copy_prefix_from(src, n)
}

pub(crate) fn transpose(op: &OpKind, args: KernelArgs<'_>) -> Result<()> {
    let OpKind::Transpose { perm } = op else {
        return Err(kernel_mismatch("transpose", op));
    };
    let src = require_input(op, &args.inputs[0])?;
    let in_shape = &args.shapes[0];
    if perm.len() != in_shape.len() || args.out_shape.len() != in_shape.len() {
        return Err(Error::shape(
            "transpose",
            format!("{perm:?} does not match {in_shape:?}"),
        ));
    }
    let in_strides = contiguous_strides(in_shape);
    // Stride in the input of each output axis.
    let gather = perm.iter().map(|p| in_strides[*p]).collect::<Vec<_>>();
    let out_shape = args.out_shape;
    let n = numel(out_shape);
    with_host_data!(&mut *args.out, o => {
        let x = src.as_slice()?;
        gather_typed(x, &mut o[..n], out_shape, &gather);
    });
    Ok(())
}

fn gather_typed<T: DType>(x: &[T], out: &mut [T], out_shape: &[usize], gather: &[usize]) {
    out.par_iter_mut().enumerate().for_each(|(i, o)| {
        let mut rem = i;
        let mut offset = 0;
        for (dim, stride) in out_shape.iter().zip(gather).rev() {
            offset += (rem % dim) * stride;
            rem /= dim;
        }
        *o = x[offset];
    });
}

#[cfg(test)]
mod tests {
    use crate::{
        graph::OpKind,
        kernels::{KernelRegistry, MathMode},
        tensor::Tensor,
    };

    #[test]
    fn transpose_rank3() {
        let x = Tensor::from_vec(vec![2, 1, 3], (0..6).collect::<Vec<i64>>()).unwrap();
        let out = KernelRegistry::host()
            .run(
                &OpKind::Transpose {
                    perm: vec![2, 0, 1],
                },
                &[&x],
                MathMode::default(),
            )
            .unwrap();
        assert_eq!(out.shape(), &[3, 2, 1]);
        assert_eq!(out.to_vec::<i64>().unwrap(), vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn reshape_keeps_order() {
        let x = Tensor::vector(vec![1u8, 2, 3, 4]);
        let out = KernelRegistry::host()
            .run(
                &OpKind::Reshape {
                    shape: vec![2, 2],
                },
                &[&x],
                MathMode::default(),
            )
            .unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.to_vec::<u8>().unwrap(), vec![1, 2, 3, 4]);
    }
}
