use std::fmt::Display;

use crate::{
    capability::Capability,
    dtype::{DTypeOps, ElemKind},
    shape::{self, numel},
    types::{broadcast_rank, Type},
    Error, Result,
};

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum UnaryOpType {
    Neg,
    Abs,
    Relu,
    Exp,
    Log,
    Sqrt,
    Tanh,
    Sigmoid,
}

impl UnaryOpType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Relu => "relu",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Tanh => "tanh",
            Self::Sigmoid => "sigmoid",
        }
    }

    /// Ops only defined on floats. Integer inputs are cast to the graph's float kind.
    pub fn is_transcendental(&self) -> bool {
        matches!(
            self,
            Self::Exp | Self::Log | Self::Sqrt | Self::Tanh | Self::Sigmoid
        )
    }

    pub(crate) fn accepts(&self, elem: ElemKind) -> std::result::Result<(), String> {
        if *self == Self::Neg && !elem.is_signed() {
            return Err(format!("neg is undefined for unsigned {elem}"));
        }
        if self.is_transcendental() && !elem.is_float() {
            return Err(format!("{} needs a float input, got {elem}", self.name()));
        }
        Ok(())
    }

    pub fn as_closure<T: DTypeOps>(&self, fast_exp: bool) -> fn(T) -> T {
        match self {
            Self::Neg => T::elem_neg,
            Self::Abs => T::elem_abs,
            Self::Relu => T::elem_relu,
            Self::Exp if fast_exp => T::elem_fast_exp,
            Self::Exp => T::elem_exp,
            Self::Log => T::elem_ln,
            Self::Sqrt => T::elem_sqrt,
            Self::Tanh => T::elem_tanh,
            Self::Sigmoid => T::elem_sigmoid,
        }
    }
}

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum BinaryOpType {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Pow,
}

impl BinaryOpType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Max => "max",
            Self::Min => "min",
            Self::Pow => "pow",
        }
    }

    pub fn is_commutative(&self) -> bool {
        matches!(self, Self::Add | Self::Mul | Self::Max | Self::Min)
    }

    pub fn as_closure<T: DTypeOps>(&self) -> fn(T, T) -> T {
        match self {
            Self::Add => T::elem_add,
            Self::Sub => T::elem_sub,
            Self::Mul => T::elem_mul,
            Self::Div => T::elem_div,
            Self::Max => T::elem_max,
            Self::Min => T::elem_min,
            Self::Pow => T::elem_pow,
        }
    }
}

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum ReduceOpType {
    Sum,
    Max,
    Min,
    Mean,
}

impl ReduceOpType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Max => "max_reduce",
            Self::Min => "min_reduce",
            Self::Mean => "mean",
        }
    }
}

/// One step of a fused elementwise expression. Operands index earlier steps.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum FusedInstr {
    Input(usize),
    Unary(UnaryOpType, usize),
    Binary(BinaryOpType, usize, usize),
}

/// A tree of elementwise operations evaluated by a single kernel. The last
/// instruction is the result.
#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub struct FusedExpr {
    pub instrs: Vec<FusedInstr>,
    pub n_inputs: usize,
}

impl FusedExpr {
    pub(crate) fn validate(&self, elem: ElemKind) -> std::result::Result<(), String> {
        if self.instrs.is_empty() {
            return Err("empty fused expression".to_string());
        }
        for (i, instr) in self.instrs.iter().enumerate() {
            let ok = match *instr {
                FusedInstr::Input(k) => k < self.n_inputs,
                FusedInstr::Unary(u, a) => {
                    u.accepts(elem)?;
                    a < i
                }
                FusedInstr::Binary(_, a, b) => a < i && b < i,
            };
            if !ok {
                return Err(format!("instruction {i} ({instr:?}) is out of range"));
            }
        }
        Ok(())
    }

    /// Render the expression, e.g. `add(exp(in0), in1)`.
    pub fn describe(&self) -> String {
        fn go(expr: &FusedExpr, i: usize) -> String {
            match expr.instrs[i] {
                FusedInstr::Input(k) => format!("in{k}"),
                FusedInstr::Unary(u, a) => format!("{}({})", u.name(), go(expr, a)),
                FusedInstr::Binary(b, l, r) => {
                    format!("{}({}, {})", b.name(), go(expr, l), go(expr, r))
                }
            }
        }
        match self.instrs.len() {
            0 => String::new(),
            n => go(self, n - 1),
        }
    }
}

/// Kernel family of an operation. Kernels and per-op capability overrides are keyed by it.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, PartialOrd, Ord)]
pub enum OpClass {
    Unary,
    Binary,
    Cast,
    Fused,
    Reduce,
    MatMul,
    Transfer,
    Reshape,
    Transpose,
}

impl OpClass {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Unary | Self::Binary | Self::Cast | Self::Fused => Capability::Elementwise,
            Self::Reduce => Capability::Reduction,
            Self::MatMul => Capability::LinearAlgebra,
            Self::Transfer => Capability::Transfer,
            Self::Reshape | Self::Transpose => Capability::Indexing,
        }
    }
}

#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub enum OpKind {
    Unary(UnaryOpType),
    Binary(BinaryOpType),
    Cast { to: ElemKind },
    Fused { expr: FusedExpr },
    /// Reduce along `axis`, or over every element when `None`.
    Reduce { op: ReduceOpType, axis: Option<usize> },
    /// `[m, k] x [k, n]`, or batched `[b, m, k] x [b, k, n]`.
    MatMul,
    ToDevice(usize),
    ToHost,
    Reshape { shape: Vec<usize> },
    Transpose { perm: Vec<usize> },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unary(u) => u.name(),
            Self::Binary(b) => b.name(),
            Self::Cast { .. } => "cast",
            Self::Fused { .. } => "fused",
            Self::Reduce { op, .. } => op.name(),
            Self::MatMul => "matmul",
            Self::ToDevice(_) => "to_device",
            Self::ToHost => "to_host",
            Self::Reshape { .. } => "reshape",
            Self::Transpose { .. } => "transpose",
        }
    }

    pub fn class(&self) -> OpClass {
        match self {
            Self::Unary(_) => OpClass::Unary,
            Self::Binary(_) => OpClass::Binary,
            Self::Cast { .. } => OpClass::Cast,
            Self::Fused { .. } => OpClass::Fused,
            Self::Reduce { .. } => OpClass::Reduce,
            Self::MatMul => OpClass::MatMul,
            Self::ToDevice(_) | Self::ToHost => OpClass::Transfer,
            Self::Reshape { .. } => OpClass::Reshape,
            Self::Transpose { .. } => OpClass::Transpose,
        }
    }

    pub fn capability(&self) -> Capability {
        self.class().capability()
    }

    pub fn is_transfer(&self) -> bool {
        matches!(self, Self::ToDevice(_) | Self::ToHost)
    }

    /// Unary, binary and fused ops: the candidates for fusion and in-place reuse.
    pub fn is_fusable(&self) -> bool {
        matches!(self, Self::Unary(_) | Self::Binary(_) | Self::Fused { .. })
    }

    pub fn arity(&self) -> usize {
        match self {
            Self::Binary(_) | Self::MatMul => 2,
            Self::Fused { expr } => expr.n_inputs,
            _ => 1,
        }
    }

    /// Whether the op is defined for `elem` at all, independent of any device.
    pub fn accepts(&self, elem: ElemKind) -> std::result::Result<(), String> {
        match self {
            Self::Unary(u) => u.accepts(elem),
            Self::Fused { expr } => expr.validate(elem),
            Self::Reduce {
                op: ReduceOpType::Mean,
                ..
            } if !elem.is_float() => Err(format!("mean needs a float input, got {elem}")),
            _ => Ok(()),
        }
    }

    /// Result type for inputs that already share an element kind.
    pub fn infer(&self, inputs: &[Type]) -> Result<Type> {
        let name = self.name();
        if inputs.len() != self.arity() {
            return Err(Error::construction(
                name,
                format!("expected {} inputs, got {}", self.arity(), inputs.len()),
            ));
        }
        let first = inputs[0];
        if let Some(other) = inputs.iter().find(|t| t.elem != first.elem) {
            if !matches!(self, Self::Cast { .. }) {
                return Err(Error::type_error(
                    name,
                    format!("operands mix {} and {}", first.elem, other.elem),
                ));
            }
        }
        self.accepts(first.elem)
            .map_err(|reason| Error::type_error(name, reason))?;
        let rank_err = |msg: String| Error::construction(name, msg);
        let rank = match self {
            Self::Unary(_) | Self::Cast { .. } | Self::ToDevice(_) | Self::ToHost => first.rank,
            Self::Binary(_) | Self::Fused { .. } => {
                inputs.iter().skip(1).try_fold(first.rank, |acc, t| {
                    broadcast_rank(acc, t.rank).ok_or_else(|| {
                        rank_err(format!("incompatible ranks {acc} and {}", t.rank))
                    })
                })?
            }
            Self::Reduce { axis, .. } => match axis {
                Some(a) if *a >= first.rank => {
                    return Err(rank_err(format!(
                        "axis {a} out of range for rank {}",
                        first.rank
                    )))
                }
                Some(_) => first.rank - 1,
                None => 0,
            },
            Self::MatMul => {
                let r = inputs[1].rank;
                if first.rank != r || !(first.rank == 2 || first.rank == 3) {
                    return Err(rank_err(format!(
                        "expected two rank 2 or two rank 3 operands, got {} and {r}",
                        first.rank
                    )));
                }
                r
            }
            Self::Reshape { shape } => shape.len(),
            Self::Transpose { perm } => {
                let mut seen = perm.clone();
                seen.sort_unstable();
                if perm.len() != first.rank || seen.iter().enumerate().any(|(i, p)| i != *p) {
                    return Err(rank_err(format!(
                        "{perm:?} is not a permutation of rank {}",
                        first.rank
                    )));
                }
                first.rank
            }
        };
        let elem = match self {
            Self::Cast { to } => *to,
            _ => first.elem,
        };
        Ok(Type::new(elem, rank))
    }

    /// Concrete output shape for concrete input shapes.
    pub fn output_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        let name = self.name();
        if inputs.len() != self.arity() {
            return Err(Error::shape(
                name,
                format!("expected {} inputs, got {}", self.arity(), inputs.len()),
            ));
        }
        let first = inputs[0];
        match self {
            Self::Unary(_) | Self::Cast { .. } | Self::ToDevice(_) | Self::ToHost => {
                Ok(first.to_vec())
            }
            Self::Binary(_) | Self::Fused { .. } => inputs
                .iter()
                .skip(1)
                .try_fold(first.to_vec(), |acc, s| shape::broadcast(name, &acc, s)),
            Self::Reduce { axis, .. } => match axis {
                Some(a) if *a < first.len() => {
                    let mut out = first.to_vec();
                    out.remove(*a);
                    Ok(out)
                }
                Some(a) => Err(Error::shape(name, format!("axis {a} out of range"))),
                None => Ok(vec![]),
            },
            Self::MatMul => {
                let (l, r) = (first, inputs[1]);
                let ok = l.len() == r.len()
                    && match l.len() {
                        2 => l[1] == r[0],
                        3 => l[0] == r[0] && l[2] == r[1],
                        _ => false,
                    };
                if !ok {
                    return Err(Error::shape(
                        name,
                        format!("cannot multiply {l:?} by {r:?}"),
                    ));
                }
                Ok(match l.len() {
                    2 => vec![l[0], r[1]],
                    _ => vec![l[0], l[1], r[2]],
                })
            }
            Self::Reshape { shape } => {
                if numel(shape) != numel(first) {
                    return Err(Error::shape(
                        name,
                        format!("cannot reshape {first:?} into {shape:?}"),
                    ));
                }
                Ok(shape.clone())
            }
            Self::Transpose { perm } => {
                if perm.len() != first.len() {
                    return Err(Error::shape(
                        name,
                        format!("{perm:?} does not match {first:?}"),
                    ));
                }
                Ok(perm.iter().map(|p| first[*p]).collect())
            }
        }
    }
}

impl Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cast { to } => write!(f, "cast<{to}>"),
            Self::Fused { expr } => write!(f, "fused[{}]", expr.describe()),
            Self::Reduce { op, axis: Some(a) } => write!(f, "{}(axis={a})", op.name()),
            Self::ToDevice(n) => write!(f, "to_device{n}"),
            Self::Reshape { shape } => write!(f, "reshape{shape:?}"),
            Self::Transpose { perm } => write!(f, "transpose{perm:?}"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_shapes() {
        let op = OpKind::MatMul;
        assert_eq!(op.output_shape(&[&[2, 3], &[3, 4]]).unwrap(), vec![2, 4]);
        assert_eq!(
            op.output_shape(&[&[5, 2, 3], &[5, 3, 4]]).unwrap(),
            vec![5, 2, 4]
        );
        assert!(op.output_shape(&[&[2, 3], &[4, 4]]).is_err());
    }

    #[test]
    fn transpose_needs_permutation() {
        let op = OpKind::Transpose { perm: vec![0, 0] };
        let t = Type::new(ElemKind::F32, 2);
        assert!(matches!(
            op.infer(&[t]).unwrap_err(),
            Error::GraphConstruction { .. }
        ));
    }

    #[test]
    fn fused_describe() {
        let expr = FusedExpr {
            instrs: vec![
                FusedInstr::Input(0),
                FusedInstr::Unary(UnaryOpType::Exp, 0),
                FusedInstr::Input(1),
                FusedInstr::Binary(BinaryOpType::Add, 1, 2),
            ],
            n_inputs: 2,
        };
        assert_eq!(expr.describe(), "add(exp(in0), in1)");
        assert!(expr.validate(ElemKind::F32).is_ok());
        assert!(expr.validate(ElemKind::I32).is_err());
    }
}
