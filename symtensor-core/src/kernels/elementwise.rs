use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, IntoParallelRefMutIterator, ParallelIterator};

use super::{kernel_mismatch, require_input, KernelArgs, MathMode, Operand, Src};
use crate::{
    dtype::{with_host_data, DType},
    graph::{BinaryOpType, OpKind, UnaryOpType},
    shape::numel,
    Result,
};

pub(crate) fn unary(op: &OpKind, args: KernelArgs<'_>) -> Result<()> {
    let OpKind::Unary(u) = op else {
        return Err(kernel_mismatch("unary", op));
    };
    let KernelArgs {
        inputs,
        shapes,
        out,
        out_shape,
        math,
    } = args;
    let n = numel(out_shape);
    with_host_data!(out, o => unary_typed(*u, &inputs[0], &shapes[0], &mut o[..n], math))
}

fn unary_typed<T: DType>(
    u: UnaryOpType,
    input: &Operand<'_>,
    shape: &[usize],
    out: &mut [T],
    math: MathMode,
) -> Result<()> {
    let f = u.as_closure::<T>(math.fast_transcendentals);
    let src = Src::<T>::new(input, shape, out.len())?;
    out.par_iter_mut()
        .enumerate()
        .for_each(|(i, o)| *o = math.finish(f(src.at(i, *o))));
    Ok(())
}

pub(crate) fn binary(op: &OpKind, args: KernelArgs<'_>) -> Result<()> {
    let OpKind::Binary(b) = op else {
        return Err(kernel_mismatch("binary", op));
    };
    let KernelArgs {
        inputs,
        shapes,
        out,
        out_shape,
        math,
    } = args;
    let n = numel(out_shape);
    with_host_data!(out, o => binary_typed(*b, inputs, shapes, &mut o[..n], math))
}

fn binary_typed<T: DType>(
    b: BinaryOpType,
    inputs: &[Operand<'_>],
    shapes: &[Vec<usize>],
    out: &mut [T],
    math: MathMode,
) -> Result<()> {
    let f = b.as_closure::<T>();
    let n = out.len();
    let lhs = Src::<T>::new(&inputs[0], &shapes[0], n)?;
    let rhs = Src::<T>::new(&inputs[1], &shapes[1], n)?;
    out.par_iter_mut().enumerate().for_each(|(i, o)| {
        let cur = *o;
        *o = math.finish(f(lhs.at(i, cur), rhs.at(i, cur)));
    });
    Ok(())
}

pub(crate) fn cast(op: &OpKind, args: KernelArgs<'_>) -> Result<()> {
    if !matches!(op, OpKind::Cast { .. }) {
        return Err(kernel_mismatch("cast", op));
    }
    let src = require_input(op, &args.inputs[0])?;
    let n = numel(args.out_shape);
    with_host_data!(src, s => with_host_data!(&mut *args.out, d => cast_typed(&s[..n], &mut d[..n])));
    Ok(())
}

fn cast_typed<S: DType, D: DType>(src: &[S], dst: &mut [D]) {
    dst.par_iter_mut()
        .zip(src.par_iter())
        .for_each(|(d, s)| *d = D::from_f64(s.to_f64()));
}
