use rayon::{iter::IndexedParallelIterator, iter::ParallelIterator, slice::ParallelSliceMut};

use super::{kernel_mismatch, KernelArgs, MathMode, Operand, Src};
use crate::{
    dtype::{with_host_data, DType},
    graph::{FusedExpr, FusedInstr, OpKind},
    shape::numel,
    Error, Result,
};

const CHUNK: usize = 4096;

/// Evaluates a fused expression chunk by chunk, keeping one register per instruction.
pub(crate) fn fused(op: &OpKind, args: KernelArgs<'_>) -> Result<()> {
    let OpKind::Fused { expr } = op else {
        return Err(kernel_mismatch("fused", op));
    };
    if args.inputs.len() != expr.n_inputs {
        return Err(Error::shape(
            "fused",
            format!(
                "expression takes {} inputs, got {}",
                expr.n_inputs,
                args.inputs.len()
            ),
        ));
    }
    let KernelArgs {
        inputs,
        shapes,
        out,
        out_shape,
        math,
    } = args;
    let n = numel(out_shape);
    with_host_data!(out, o => run(expr, inputs, shapes, &mut o[..n], math))
}

fn run<T: DType>(
    expr: &FusedExpr,
    inputs: &[Operand<'_>],
    shapes: &[Vec<usize>],
    out: &mut [T],
    math: MathMode,
) -> Result<()> {
    let n = out.len();
    let srcs = inputs
        .iter()
        .zip(shapes)
        .map(|(operand, shape)| Src::<T>::new(operand, shape, n))
        .collect::<Result<Vec<_>>>()?;
    let unary = expr
        .instrs
        .iter()
        .map(|i| match i {
            FusedInstr::Unary(u, _) => Some(u.as_closure::<T>(math.fast_transcendentals)),
            _ => None,
        })
        .collect::<Vec<_>>();
    let binary = expr
        .instrs
        .iter()
        .map(|i| match i {
            FusedInstr::Binary(b, _, _) => Some(b.as_closure::<T>()),
            _ => None,
        })
        .collect::<Vec<_>>();

    out.par_chunks_mut(CHUNK).enumerate().for_each(|(c, chunk)| {
        let base = c * CHUNK;
        let len = chunk.len();
        let mut regs = vec![vec![T::ZERO; len]; expr.instrs.len()];
        for (r, instr) in expr.instrs.iter().enumerate() {
            let (done, rest) = regs.split_at_mut(r);
            let dst = &mut rest[0];
            match *instr {
                FusedInstr::Input(k) => {
                    for (j, d) in dst.iter_mut().enumerate() {
                        *d = srcs[k].at(base + j, chunk[j]);
                    }
                }
                FusedInstr::Unary(_, a) => {
                    if let Some(f) = unary[r] {
                        for (d, x) in dst.iter_mut().zip(&done[a]) {
                            *d = math.finish(f(*x));
                        }
                    }
                }
                FusedInstr::Binary(_, a, b) => {
                    if let Some(f) = binary[r] {
                        for ((d, x), y) in dst.iter_mut().zip(&done[a]).zip(&done[b]) {
                            *d = math.finish(f(*x, *y));
                        }
                    }
                }
            }
        }
        if let Some(result) = regs.last() {
            chunk.copy_from_slice(result);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dtype::HostData,
        graph::{BinaryOpType, UnaryOpType},
        kernels::KernelRegistry,
        tensor::Tensor,
    };

    #[test]
    fn evaluates_across_chunks() {
        // add(exp(in0), in1)
        let expr = FusedExpr {
            instrs: vec![
                FusedInstr::Input(0),
                FusedInstr::Unary(UnaryOpType::Exp, 0),
                FusedInstr::Input(1),
                FusedInstr::Binary(BinaryOpType::Add, 1, 2),
            ],
            n_inputs: 2,
        };
        let n = CHUNK * 2 + 17;
        let x = Tensor::vector((0..n).map(|i| (i % 7) as f64 * 0.1).collect::<Vec<_>>());
        let one = Tensor::scalar(1.0f64);
        let out = KernelRegistry::host()
            .run(&OpKind::Fused { expr }, &[&x, &one], MathMode::default())
            .unwrap();
        let got = out.to_vec::<f64>().unwrap();
        for (i, v) in got.iter().enumerate() {
            let want = ((i % 7) as f64 * 0.1).exp() + 1.0;
            assert!((v - want).abs() < 1e-12);
        }
    }

    #[test]
    fn in_place_operand_reads_before_write() {
        let expr = FusedExpr {
            instrs: vec![
                FusedInstr::Input(0),
                FusedInstr::Unary(UnaryOpType::Neg, 0),
                FusedInstr::Input(1),
                FusedInstr::Binary(BinaryOpType::Mul, 1, 2),
            ],
            n_inputs: 2,
        };
        let mut out = HostData::from(vec![1i32, 2, 3]);
        let rhs = HostData::from(vec![4i32, 5, 6]);
        let inputs = [Operand::Out, Operand::In(&rhs)];
        fused(
            &OpKind::Fused { expr },
            KernelArgs {
                inputs: &inputs,
                shapes: &[vec![3], vec![3]],
                out: &mut out,
                out_shape: &[3],
                math: MathMode::default(),
            },
        )
        .unwrap();
        assert_eq!(out, HostData::I32(vec![-4, -10, -18]));
    }
}
