//! Reference host kernels: the kernel provider for backends whose memory the host
//! can address.
//!
//! Every kernel has the same signature, [`KernelFn`]. Kernels write exactly the first
//! `numel(out_shape)` elements of `out` and read exactly the first `numel(shape)`
//! elements of each input, so buffers may be larger than the values they hold.

use std::collections::HashMap;

use crate::{
    dtype::{DType, HostData},
    graph::{OpClass, OpKind},
    shape::numel,
    tensor::Tensor,
    Error, Result,
};

mod elementwise;
mod fused;
mod layout;
mod linalg;
mod reduce;

/// Relaxed-math and accumulation options forwarded to kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MathMode {
    pub fast_transcendentals: bool,
    pub flush_denormals: bool,
    /// Sum reductions as a balanced tree instead of left to right.
    pub pairwise_sum: bool,
}

impl MathMode {
    #[inline]
    pub(crate) fn finish<T: DType>(&self, v: T) -> T {
        if self.flush_denormals {
            v.flush_denormal()
        } else {
            v
        }
    }
}

/// A kernel input.
pub enum Operand<'a> {
    In(&'a HostData),
    /// The input is the output buffer itself (in-place execution).
    Out,
}

pub struct KernelArgs<'a> {
    pub inputs: &'a [Operand<'a>],
    pub shapes: &'a [Vec<usize>],
    pub out: &'a mut HostData,
    pub out_shape: &'a [usize],
    pub math: MathMode,
}

pub type KernelFn = fn(&OpKind, KernelArgs<'_>) -> Result<()>;

/// Resolved per-element view of an input.
pub(crate) enum Src<'a, T> {
    Slice(&'a [T]),
    Scalar(T),
    Out,
}

impl<'a, T: DType> Src<'a, T> {
    pub(crate) fn new(operand: &Operand<'a>, shape: &[usize], n: usize) -> Result<Self> {
        match *operand {
            Operand::Out => Ok(Src::Out),
            Operand::In(data) => {
                let s = data.as_slice::<T>()?;
                let len = numel(shape);
                if len > s.len() {
                    Err(Error::shape(
                        "kernel",
                        format!("{shape:?} exceeds a buffer of {} elements", s.len()),
                    ))
                } else if len == n {
                    Ok(Src::Slice(&s[..n]))
                } else if len == 1 {
                    Ok(Src::Scalar(s[0]))
                } else {
                    Err(Error::shape(
                        "kernel",
                        format!("input {shape:?} does not cover {n} output elements"),
                    ))
                }
            }
        }
    }

    #[inline]
    pub(crate) fn at(&self, i: usize, current: T) -> T {
        match self {
            Src::Slice(s) => s[i],
            Src::Scalar(v) => *v,
            Src::Out => current,
        }
    }
}

pub(crate) fn kernel_mismatch(expected: &str, op: &OpKind) -> Error {
    Error::msg(format!("{expected} kernel invoked for {op}"))
}

pub(crate) fn require_input<'a>(op: &OpKind, operand: &Operand<'a>) -> Result<&'a HostData> {
    match *operand {
        Operand::In(data) => Ok(data),
        Operand::Out => Err(Error::msg(format!("{op} cannot run in place"))),
    }
}

/// Maps op classes to kernels.
#[derive(Clone)]
pub struct KernelRegistry {
    kernels: HashMap<OpClass, KernelFn>,
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut classes = self.kernels.keys().collect::<Vec<_>>();
        classes.sort();
        f.debug_struct("KernelRegistry")
            .field("classes", &classes)
            .finish()
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::host()
    }
}

impl KernelRegistry {
    pub fn empty() -> Self {
        Self {
            kernels: HashMap::new(),
        }
    }

    /// The reference kernels for every class except transfers.
    pub fn host() -> Self {
        let mut registry = Self::empty();
        registry.register(OpClass::Unary, elementwise::unary);
        registry.register(OpClass::Binary, elementwise::binary);
        registry.register(OpClass::Cast, elementwise::cast);
        registry.register(OpClass::Fused, fused::fused);
        registry.register(OpClass::Reduce, reduce::reduce);
        registry.register(OpClass::MatMul, linalg::matmul);
        registry.register(OpClass::Reshape, layout::reshape);
        registry.register(OpClass::Transpose, layout::transpose);
        registry
    }

    /// Install or replace the kernel for `class`.
    pub fn register(&mut self, class: OpClass, kernel: KernelFn) {
        self.kernels.insert(class, kernel);
    }

    pub fn get(&self, class: OpClass) -> Option<KernelFn> {
        self.kernels.get(&class).copied()
    }

    pub fn lookup(&self, op: &OpKind) -> Result<KernelFn> {
        self.get(op.class())
            .ok_or_else(|| Error::msg(format!("no kernel registered for {op}")))
    }

    /// Evaluate `op` on host tensors.
    pub fn run(&self, op: &OpKind, inputs: &[&Tensor], math: MathMode) -> Result<Tensor> {
        let kernel = self.lookup(op)?;
        let shapes = inputs.iter().map(|t| t.shape().to_vec()).collect::<Vec<_>>();
        let out_shape = op.output_shape(&shapes.iter().map(Vec::as_slice).collect::<Vec<_>>())?;
        let elem = match op {
            OpKind::Cast { to } => *to,
            _ => inputs
                .first()
                .map(|t| t.elem())
                .ok_or_else(|| Error::msg(format!("{op} has no inputs")))?,
        };
        let mut out = HostData::zeros(elem, numel(&out_shape));
        let operands = inputs
            .iter()
            .map(|t| Operand::In(t.data()))
            .collect::<Vec<_>>();
        kernel(
            op,
            KernelArgs {
                inputs: &operands,
                shapes: &shapes,
                out: &mut out,
                out_shape: &out_shape,
                math,
            },
        )?;
        Tensor::new(out_shape, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BinaryOpType, ReduceOpType, UnaryOpType};

    fn run(op: OpKind, inputs: &[&Tensor]) -> Tensor {
        KernelRegistry::host()
            .run(&op, inputs, MathMode::default())
            .unwrap()
    }

    #[test]
    fn binary_broadcasts_scalars() {
        let a = Tensor::vector(vec![1f32, 2., 3.]);
        let s = Tensor::scalar(10f32);
        let out = run(OpKind::Binary(BinaryOpType::Sub), &[&s, &a]);
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![9., 8., 7.]);
    }

    #[test]
    fn reductions() {
        let x = Tensor::from_vec(vec![2, 3], vec![1i32, 2, 3, 4, 5, 6]).unwrap();
        let rows = run(
            OpKind::Reduce {
                op: ReduceOpType::Sum,
                axis: Some(1),
            },
            &[&x],
        );
        assert_eq!(rows.to_vec::<i32>().unwrap(), vec![6, 15]);
        let cols = run(
            OpKind::Reduce {
                op: ReduceOpType::Max,
                axis: Some(0),
            },
            &[&x],
        );
        assert_eq!(cols.to_vec::<i32>().unwrap(), vec![4, 5, 6]);
    }

    #[test]
    fn transpose_and_matmul() {
        let a = Tensor::from_vec(vec![2, 3], vec![1f32, 2., 3., 4., 5., 6.]).unwrap();
        let t = run(OpKind::Transpose { perm: vec![1, 0] }, &[&a]);
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1., 4., 2., 5., 3., 6.]);
        let p = run(OpKind::MatMul, &[&a, &t]);
        assert_eq!(p.to_vec::<f32>().unwrap(), vec![14., 32., 32., 77.]);
        let ai = a.cast(crate::dtype::ElemKind::I64);
        let ti = t.cast(crate::dtype::ElemKind::I64);
        let pi = run(OpKind::MatMul, &[&ai, &ti]);
        assert_eq!(pi.to_vec::<i64>().unwrap(), vec![14, 32, 32, 77]);
    }

    #[test]
    fn unary_on_buffer_prefix() {
        let x = Tensor::vector(vec![0f64, 1.]);
        let out = run(OpKind::Unary(UnaryOpType::Exp), &[&x]);
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![1.0, std::f64::consts::E]);
    }
}
