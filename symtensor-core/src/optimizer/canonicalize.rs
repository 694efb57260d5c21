use std::collections::HashMap;

use log::debug;

use super::{rewrite::Rewriter, Pass, PassContext};
use crate::{
    graph::{Graph, OpKind, Program, UnaryOpType, VarId},
    kernels::{KernelRegistry, MathMode},
    shape::numel,
    tensor::Tensor,
    Result,
};

/// Constant folding, commutative operand ordering, `neg(neg(x)) -> x` and common
/// subexpression elimination.
#[derive(Debug, Clone, Copy, Default)]
pub struct Canonicalize;

impl Pass for Canonicalize {
    fn name(&self) -> &'static str {
        "canonicalize"
    }

    fn run(&self, program: &Program, cx: &PassContext) -> Result<Program> {
        let live = program.live_nodes();
        let kernels = cx.ctx().kernels();
        let limit = cx.config().fold_limit;
        let mut rw = Rewriter::new(program)?;
        let mut seen: HashMap<(OpKind, Vec<VarId>), VarId> = HashMap::new();

        for node in program.graph().nodes().iter().filter(|n| live[n.id.0]) {
            let mut inputs = rw.vars(&node.inputs)?;

            if node.op == OpKind::Unary(UnaryOpType::Neg) {
                let inner = rw
                    .graph()
                    .producer(inputs[0])
                    .filter(|p| p.op == node.op)
                    .map(|p| p.inputs[0]);
                if let Some(x) = inner {
                    rw.alias(node.output(), x);
                    continue;
                }
            }

            if let OpKind::Binary(b) = node.op {
                if b.is_commutative() {
                    inputs.sort();
                }
            }

            if let Some(folded) = fold(rw.graph(), &node.op, &inputs, kernels, limit) {
                let c = rw.constant(folded);
                rw.alias(node.output(), c);
                continue;
            }

            let key = (node.op.clone(), inputs.clone());
            if let Some(existing) = seen.get(&key) {
                rw.alias(node.output(), *existing);
                continue;
            }
            let out = rw.emit(node.op.clone(), inputs, node.placement, node.inplace)?;
            rw.alias(node.output(), out);
            seen.insert(key, out);
        }
        rw.finish()
    }
}

/// Evaluate `op` on the host when every input is a constant and the result is small.
fn fold(
    graph: &Graph,
    op: &OpKind,
    inputs: &[VarId],
    kernels: &KernelRegistry,
    limit: usize,
) -> Option<Tensor> {
    if op.is_transfer() {
        return None;
    }
    let consts = inputs
        .iter()
        .map(|v| graph.var(*v).ok()?.as_constant())
        .collect::<Option<Vec<_>>>()?;
    let shapes = consts.iter().map(|t| t.shape()).collect::<Vec<_>>();
    let out_shape = op.output_shape(&shapes).ok()?;
    if numel(&out_shape) > limit {
        return None;
    }
    match kernels.run(op, &consts, MathMode::default()) {
        Ok(t) => Some(t),
        Err(e) => {
            debug!("not folding {op}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::CompileConfig, context::ExecutionContext, dtype::ElemKind};

    fn canonicalize(p: &Program) -> Program {
        let ctx = ExecutionContext::new(&CompileConfig::host()).unwrap();
        Canonicalize.run(p, &PassContext::new(&ctx)).unwrap()
    }

    #[test]
    fn folds_constants_and_double_negation() {
        let mut g = Graph::new();
        let x = g.input(ElemKind::F32, 1);
        let two = g.scalar(2f32);
        let three = g.scalar(3f32);
        let six = g.mul(two, three).unwrap();
        let n = g.neg(x).unwrap();
        let nn = g.neg(n).unwrap();
        let y = g.mul(nn, six).unwrap();
        let p = Program::new(g, &[x], &[y], &[]).unwrap();
        let out = canonicalize(&p);
        // The inner neg is left for dead-code elimination; the multiply reads x and
        // the folded 6.
        assert_eq!(out.node_count(), 2);
        let node = out.graph().nodes().last().unwrap();
        let c = node
            .inputs
            .iter()
            .find_map(|v| out.graph().var(*v).unwrap().as_constant())
            .unwrap();
        assert_eq!(c.to_vec::<f32>().unwrap(), vec![6.0]);
        assert!(node.inputs.contains(&out.inputs()[0]));
    }

    #[test]
    fn commutative_cse() {
        let mut g = Graph::new();
        let a = g.input(ElemKind::F32, 1);
        let b = g.input(ElemKind::F32, 1);
        let ab = g.add(a, b).unwrap();
        let ba = g.add(b, a).unwrap();
        let s1 = g.sub(a, b).unwrap();
        let s2 = g.sub(b, a).unwrap();
        let y = g.mul(ab, ba).unwrap();
        let z = g.mul(s1, s2).unwrap();
        let p = Program::new(g, &[a, b], &[y, z], &[]).unwrap();
        let out = canonicalize(&p);
        // add merged, the two subs kept.
        assert_eq!(out.node_count(), 5);
        let once = canonicalize(&out);
        assert_eq!(once.node_count(), out.node_count());
    }
}
