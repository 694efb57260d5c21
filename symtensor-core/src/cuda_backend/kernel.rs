use std::hash::{DefaultHasher, Hash, Hasher};

use crate::{
    dtype::{with_elem_kind, DType, ElemKind},
    graph::{BinaryOpType, FusedInstr, OpKind, UnaryOpType},
};

/// Source of one JIT elementwise kernel, before it is given a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct JitKernel {
    prefix: &'static str,
    includes: Vec<&'static str>,
    params: Vec<String>,
    out_ty: &'static str,
    body: Vec<String>,
    result: String,
}

fn c_dep(kind: ElemKind) -> Option<&'static str> {
    with_elem_kind!(kind, T => T::C_DEP)
}

/// Widen `x` to `double` for arithmetic.
fn acc(kind: ElemKind, x: &str) -> String {
    match kind {
        ElemKind::F64 => format!("({x})"),
        ElemKind::F16 | ElemKind::BF16 | ElemKind::F32 => {
            format!("static_cast<double>(static_cast<float>({x}))")
        }
        _ => format!("static_cast<double>({x})"),
    }
}

/// Narrow a `double` expression back to `kind`.
fn back(kind: ElemKind, v: &str) -> String {
    match kind {
        ElemKind::F16 => format!("__float2half(static_cast<float>({v}))"),
        ElemKind::BF16 => format!("__float2bfloat16(static_cast<float>({v}))"),
        other => format!("static_cast<{}>({v})", other.c_name()),
    }
}

fn unary(op: UnaryOpType, kind: ElemKind, x: &str) -> String {
    let t = kind.c_name();
    let float = |f: &str| back(kind, &format!("{f}({})", acc(kind, x)));
    match op {
        UnaryOpType::Neg if kind.is_float() => back(kind, &format!("-{}", acc(kind, x))),
        UnaryOpType::Neg => format!("static_cast<{t}>(-({x}))"),
        UnaryOpType::Abs if kind.is_float() => float("fabs"),
        UnaryOpType::Abs if kind.is_signed() => {
            format!("(({x}) < 0 ? static_cast<{t}>(-({x})) : ({x}))")
        }
        UnaryOpType::Abs => format!("({x})"),
        UnaryOpType::Relu if kind.is_float() => {
            back(kind, &format!("fmax({}, 0.0)", acc(kind, x)))
        }
        UnaryOpType::Relu => format!("(({x}) > 0 ? ({x}) : static_cast<{t}>(0))"),
        UnaryOpType::Exp => float("exp"),
        UnaryOpType::Log => float("log"),
        UnaryOpType::Sqrt => float("sqrt"),
        UnaryOpType::Tanh => float("tanh"),
        UnaryOpType::Sigmoid => back(kind, &format!("1.0 / (1.0 + exp(-{}))", acc(kind, x))),
    }
}

fn binary(op: BinaryOpType, kind: ElemKind, a: &str, b: &str) -> String {
    let t = kind.c_name();
    let (la, lb) = (acc(kind, a), acc(kind, b));
    if kind.is_float() {
        let v = match op {
            BinaryOpType::Add => format!("{la} + {lb}"),
            BinaryOpType::Sub => format!("{la} - {lb}"),
            BinaryOpType::Mul => format!("{la} * {lb}"),
            BinaryOpType::Div => format!("{la} / {lb}"),
            BinaryOpType::Max => format!("fmax({la}, {lb})"),
            BinaryOpType::Min => format!("fmin({la}, {lb})"),
            BinaryOpType::Pow => format!("pow({la}, {lb})"),
        };
        return back(kind, &v);
    }
    match op {
        BinaryOpType::Add => format!("static_cast<{t}>(({a}) + ({b}))"),
        BinaryOpType::Sub => format!("static_cast<{t}>(({a}) - ({b}))"),
        BinaryOpType::Mul => format!("static_cast<{t}>(({a}) * ({b}))"),
        // Integer division by zero yields zero, as on the host.
        BinaryOpType::Div => {
            format!("(({b}) == 0 ? static_cast<{t}>(0) : static_cast<{t}>(({a}) / ({b})))")
        }
        BinaryOpType::Max => format!("(({a}) > ({b}) ? ({a}) : ({b}))"),
        BinaryOpType::Min => format!("(({a}) < ({b}) ? ({a}) : ({b}))"),
        BinaryOpType::Pow => format!("static_cast<{t}>(pow({la}, {lb}))"),
    }
}

fn cast(from: ElemKind, to: ElemKind, x: &str) -> String {
    if from.is_integral() && to.is_integral() {
        format!("static_cast<{}>({x})", to.c_name())
    } else {
        back(to, &acc(from, x))
    }
}

/// Kernel for an elementwise op. `scalars[k]` marks inputs broadcast from one element.
/// `None` for ops without a JIT kernel.
pub(crate) fn elementwise(
    op: &OpKind,
    elem: ElemKind,
    out: ElemKind,
    scalars: &[bool],
) -> Option<JitKernel> {
    let load = |k: usize| {
        let idx = if scalars.get(k).copied().unwrap_or(false) {
            "0"
        } else {
            "i"
        };
        format!("in{k}[{idx}]")
    };
    let mut body = Vec::new();
    let result = match op {
        OpKind::Unary(u) => unary(*u, elem, &load(0)),
        OpKind::Binary(b) => binary(*b, elem, &load(0), &load(1)),
        OpKind::Cast { to } => cast(elem, *to, &load(0)),
        OpKind::Fused { expr } => {
            let t = elem.c_name();
            for (r, instr) in expr.instrs.iter().enumerate() {
                let v = match *instr {
                    FusedInstr::Input(k) => load(k),
                    FusedInstr::Unary(u, a) => unary(u, elem, &format!("r{a}")),
                    FusedInstr::Binary(b, l, r) => {
                        binary(b, elem, &format!("r{l}"), &format!("r{r}"))
                    }
                };
                body.push(format!("const {t} r{r} = {v};"));
            }
            format!("r{}", expr.instrs.len().checked_sub(1)?)
        }
        _ => return None,
    };
    let mut includes = Vec::new();
    for kind in [elem, out] {
        if let Some(dep) = c_dep(kind) {
            if !includes.contains(&dep) {
                includes.push(dep);
            }
        }
    }
    Some(JitKernel {
        prefix: op.name(),
        includes,
        params: (0..op.arity())
            .map(|k| format!("const {} *in{k}", elem.c_name()))
            .collect(),
        out_ty: out.c_name(),
        body,
        result,
    })
}

impl JitKernel {
    /// Function name derived from the source and compile flags.
    pub(crate) fn name(&self, flags: &[bool]) -> String {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        flags.hash(&mut hasher);
        format!("{}_{:016x}", self.prefix, hasher.finish())
    }

    pub(crate) fn render(&self, name: &str) -> String {
        let mut params = self.params.clone();
        params.push(format!("{} *out", self.out_ty));
        params.push("const size_t numel".to_string());
        let params = params.join(", ");
        format!(
            r#"
            typedef unsigned char uint8_t;
            typedef unsigned int uint32_t;
            typedef long long int int64_t;
            {includes}

            extern "C" __global__ void {name}({params}) {{
                for (size_t i = blockIdx.x * blockDim.x + threadIdx.x; i < numel;
                    i += (size_t)blockDim.x * gridDim.x) {{
                    {body}
                    out[i] = {result};
                }}
            }}
            "#,
            includes = self.includes.join("\n"),
            body = self.body.join("\n                    "),
            result = self.result,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FusedExpr;

    #[test]
    fn fused_source() {
        let op = OpKind::Fused {
            expr: FusedExpr {
                instrs: vec![
                    FusedInstr::Input(0),
                    FusedInstr::Unary(UnaryOpType::Exp, 0),
                    FusedInstr::Input(1),
                    FusedInstr::Binary(BinaryOpType::Add, 1, 2),
                ],
                n_inputs: 2,
            },
        };
        let k = elementwise(&op, ElemKind::F16, ElemKind::F16, &[false, true]).unwrap();
        let name = k.name(&[true, false]);
        let src = k.render(&name);
        assert!(src.contains("cuda_fp16.h"));
        assert!(src.contains("in1[0]"));
        assert!(src.contains("out[i] = r3;"));
        assert_ne!(name, k.name(&[false, false]));
    }

    #[test]
    fn no_kernel_for_reductions() {
        let op = OpKind::Reduce {
            op: crate::graph::ReduceOpType::Sum,
            axis: None,
        };
        assert!(elementwise(&op, ElemKind::F32, ElemKind::F32, &[false]).is_none());
    }
}
