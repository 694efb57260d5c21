use rayon::iter::{IndexedParallelIterator, IntoParallelRefMutIterator, ParallelIterator};

use super::{kernel_mismatch, require_input, KernelArgs, MathMode};
use crate::{
    dtype::{with_host_data, DType},
    graph::{OpKind, ReduceOpType},
    shape::numel,
    Error, Result,
};

/// Below this length a pairwise sum falls back to a plain loop.
const PAIRWISE_BLOCK: usize = 8;

pub(crate) fn reduce(op: &OpKind, args: KernelArgs<'_>) -> Result<()> {
    let OpKind::Reduce { op: rop, axis } = op else {
        return Err(kernel_mismatch("reduce", op));
    };
    let src = require_input(op, &args.inputs[0])?;
    let shape = &args.shapes[0];
    let (outer, len, inner) = match *axis {
        None => (1, numel(shape), 1),
        Some(a) if a < shape.len() => (
            numel(&shape[..a]),
            shape[a],
            numel(&shape[a + 1..]),
        ),
        Some(a) => {
            return Err(Error::shape(
                op.name(),
                format!("axis {a} out of range for {shape:?}"),
            ))
        }
    };
    let n = numel(args.out_shape);
    if n != outer * inner {
        return Err(Error::shape(
            op.name(),
            format!("{:?} is not a reduction of {shape:?}", args.out_shape),
        ));
    }
    let math = args.math;
    with_host_data!(&mut *args.out, o => {
        let x = src.as_slice()?;
        reduce_typed(*rop, x, &mut o[..n], len, inner, math);
    });
    Ok(())
}

fn reduce_typed<T: DType>(
    op: ReduceOpType,
    x: &[T],
    out: &mut [T],
    len: usize,
    inner: usize,
    math: MathMode,
) {
    out.par_iter_mut().enumerate().for_each(|(idx, o)| {
        let (outer_idx, inner_idx) = (idx / inner, idx % inner);
        let base = outer_idx * len * inner + inner_idx;
        let lane = (0..len).map(|j| x[base + j * inner]);
        let v = match op {
            ReduceOpType::Sum | ReduceOpType::Mean => {
                let sum = if math.pairwise_sum {
                    pairwise(&lane.collect::<Vec<_>>())
                } else {
                    lane.fold(T::ZERO, T::elem_add)
                };
                if op == ReduceOpType::Mean {
                    sum.elem_div(T::from_f64(len as f64))
                } else {
                    sum
                }
            }
            ReduceOpType::Max => lane.reduce(T::elem_max).unwrap_or(T::ZERO),
            ReduceOpType::Min => lane.reduce(T::elem_min).unwrap_or(T::ZERO),
        };
        *o = math.finish(v);
    });
}

fn pairwise<T: DType>(xs: &[T]) -> T {
    if xs.len() <= PAIRWISE_BLOCK {
        xs.iter().fold(T::ZERO, |acc, x| acc.elem_add(*x))
    } else {
        let (l, r) = xs.split_at(xs.len() / 2);
        pairwise(l).elem_add(pairwise(r))
    }
}
