use gemm::{gemm, Parallelism};
use half::{bf16, f16};

use super::{kernel_mismatch, require_input, KernelArgs};
use crate::{
    dtype::{with_host_data, DType, DTypeOps},
    graph::OpKind,
    Error, Result,
};

pub trait MatMulDispatch: Sized {
    /// `(B x M x K) * (B x K x N) = (B x M x N)`, all operands contiguous.
    /// Overwrites `out`.
    fn launch_matmul(lhs: &[Self], rhs: &[Self], dims: (usize, usize, usize, usize), out: &mut [Self]);
}

macro_rules! instantiate_matmul {
    ($rt:ident, NAIVE) => {
        impl MatMulDispatch for $rt {
            fn launch_matmul(
                lhs: &[Self],
                rhs: &[Self],
                (b, m, n, k): (usize, usize, usize, usize),
                out: &mut [Self],
            ) {
                for batch in 0..b {
                    let lhs = &lhs[batch * m * k..];
                    let rhs = &rhs[batch * k * n..];
                    let out = &mut out[batch * m * n..];
                    for i in 0..m {
                        for j in 0..n {
                            let mut sum = <$rt as DType>::ZERO;
                            for p in 0..k {
                                sum = sum.elem_add(lhs[i * k + p].elem_mul(rhs[p * n + j]));
                            }
                            out[i * n + j] = sum;
                        }
                    }
                }
            }
        }
    };

    ($rt:ident, GEMM) => {
        impl MatMulDispatch for $rt {
            fn launch_matmul(
                lhs: &[Self],
                rhs: &[Self],
                (b, m, n, k): (usize, usize, usize, usize),
                out: &mut [Self],
            ) {
                let num_threads = num_cpus::get();
                let parallelism = if num_threads > 1 {
                    Parallelism::Rayon(num_threads)
                } else {
                    Parallelism::None
                };

                debug_assert!(lhs.len() >= b * m * k);
                debug_assert!(rhs.len() >= b * k * n);
                debug_assert!(out.len() >= b * m * n);

                for b in 0..b {
                    let lhs_p = &lhs[b * m * k..];
                    let rhs_p = &rhs[b * k * n..];
                    let out_p = &mut out[b * m * n..];

                    // SAFETY: each operand slice covers its row-major m x k, k x n and
                    // m x n block, which is all gemm reads or writes with these strides.
                    unsafe {
                        gemm(
                            /* m: usize = */ m,
                            /* n: usize = */ n,
                            /* k: usize = */ k,
                            /* dst: *mut T = */ out_p.as_mut_ptr(),
                            /* dst_cs: isize = */ 1,
                            /* dst_rs: isize = */ n as isize,
                            /* read_dst: bool = */ false,
                            /* lhs: *const T = */ lhs_p.as_ptr(),
                            /* lhs_cs: isize = */ 1,
                            /* lhs_rs: isize = */ k as isize,
                            /* rhs: *const T = */ rhs_p.as_ptr(),
                            /* rhs_cs: isize = */ 1,
                            /* rhs_rs: isize = */ n as isize,
                            /* alpha: T = */ 0.,
                            /* beta: T = */ 1.,
                            /* conj_dst: bool = */ false,
                            /* conj_lhs: bool = */ false,
                            /* conj_rhs: bool = */ false,
                            parallelism,
                        )
                    }
                }
            }
        }
    };
}

instantiate_matmul!(u8, NAIVE);
instantiate_matmul!(u32, NAIVE);
instantiate_matmul!(i32, NAIVE);
instantiate_matmul!(i64, NAIVE);
// Half precision uses the naive loop to avoid the SIMD half-precision paths in gemm.
instantiate_matmul!(f16, NAIVE);
instantiate_matmul!(bf16, NAIVE);
instantiate_matmul!(f32, GEMM);
instantiate_matmul!(f64, GEMM);

pub(crate) fn matmul(op: &OpKind, args: KernelArgs<'_>) -> Result<()> {
    if *op != OpKind::MatMul {
        return Err(kernel_mismatch("matmul", op));
    }
    let lhs = require_input(op, &args.inputs[0])?;
    let rhs = require_input(op, &args.inputs[1])?;
    let (ls, rs) = (&args.shapes[0], &args.shapes[1]);
    let dims = match (ls.as_slice(), rs.as_slice()) {
        ([m, k], [k2, n]) if k == k2 => (1, *m, *n, *k),
        ([b, m, k], [b2, k2, n]) if b == b2 && k == k2 => (*b, *m, *n, *k),
        _ => {
            return Err(Error::shape(
                "matmul",
                format!("cannot multiply {ls:?} by {rs:?}"),
            ))
        }
    };
    let (b, m, n, _) = dims;
    with_host_data!(&mut *args.out, o => {
        let l = lhs.as_slice()?;
        let r = rhs.as_slice()?;
        launch(l, r, dims, &mut o[..b * m * n]);
    });
    Ok(())
}

fn launch<T: DType + MatMulDispatch>(lhs: &[T], rhs: &[T], dims: (usize, usize, usize, usize), out: &mut [T]) {
    T::launch_matmul(lhs, rhs, dims, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batched_f64() {
        // Two batches of [2, 2] x [2, 1].
        let lhs = [1f64, 2., 3., 4., 1., 0., 0., 1.];
        let rhs = [1f64, 1., 5., 6.];
        let mut out = [0f64; 4];
        f64::launch_matmul(&lhs, &rhs, (2, 2, 1, 2), &mut out);
        assert_eq!(out, [3., 7., 5., 6.]);
    }

    #[test]
    fn naive_wraps_integers() {
        let lhs = [200u8, 100];
        let rhs = [1u8, 1];
        let mut out = [0u8; 1];
        u8::launch_matmul(&lhs, &rhs, (1, 1, 1, 2), &mut out);
        assert_eq!(out, [44]);
    }
}
