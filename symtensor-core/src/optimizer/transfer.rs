use std::collections::HashMap;

use super::{dce::prune, rewrite::Rewriter, Pass, PassContext};
use crate::{
    graph::{OpKind, Program, VarId},
    types::Location,
    Result,
};

/// Upper bound on rewrite rounds. Every round that changes the program removes at
/// least one transfer, so this is never reached on real programs.
const MAX_ROUNDS: usize = 16;

/// Removes redundant transfers:
/// - `to_host(to_device(x))` and `to_device(to_host(x))` become `x`;
/// - duplicate transfers of one value are merged;
/// - `T'(L(T(x)))` becomes `L(x)` for a reshape or transpose `L` the other side runs;
/// - transfers nothing reads any more are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferElimination;

impl Pass for TransferElimination {
    fn name(&self) -> &'static str {
        "transfer"
    }

    fn run(&self, program: &Program, cx: &PassContext) -> Result<Program> {
        let mut current = sweep(program, cx)?;
        for _ in 0..MAX_ROUNDS {
            let next = sweep(&current, cx)?;
            if (next.node_count(), next.transfer_count())
                == (current.node_count(), current.transfer_count())
            {
                return Ok(next);
            }
            current = next;
        }
        Ok(current)
    }
}

fn sweep(program: &Program, cx: &PassContext) -> Result<Program> {
    let live = program.live_nodes();
    let mut rw = Rewriter::new(program)?;
    let mut moved: HashMap<(VarId, Location), VarId> = HashMap::new();

    for node in program.graph().nodes().iter().filter(|n| live[n.id.0]) {
        let dest = match node.placement.location() {
            Some(dest) if node.op.is_transfer() => dest,
            _ => {
                rw.copy_node(node)?;
                continue;
            }
        };
        let x = rw.var(node.inputs[0])?;
        let out = match moved.get(&(x, dest)) {
            Some(v) => *v,
            None => match simplify(&mut rw, x, dest, cx)? {
                Some(v) => v,
                None => rw.emit(node.op.clone(), vec![x], node.placement, None)?,
            },
        };
        moved.insert((x, dest), out);
        rw.alias(node.output(), out);
    }
    prune(&rw.finish()?)
}

/// A value equal to `x` moved to `dest` that needs no new transfer, if there is one.
fn simplify(
    rw: &mut Rewriter,
    x: VarId,
    dest: Location,
    cx: &PassContext,
) -> Result<Option<VarId>> {
    if rw.location(x)? == Some(dest) {
        return Ok(Some(x));
    }
    let graph = rw.graph();
    let Some(producer) = graph.producer(x) else {
        return Ok(None);
    };
    if producer.op.is_transfer() {
        let y = producer.inputs[0];
        if rw.location(y)? == Some(dest) {
            return Ok(Some(y));
        }
        return Ok(None);
    }
    if !matches!(producer.op, OpKind::Reshape { .. } | OpKind::Transpose { .. }) {
        return Ok(None);
    }
    let layout = producer.op.clone();
    let Some(inner) = graph
        .producer(producer.inputs[0])
        .filter(|t| t.op.is_transfer())
    else {
        return Ok(None);
    };
    let w = inner.inputs[0];
    if rw.location(w)? != Some(dest) {
        return Ok(None);
    }
    let elem = graph.ty(w)?.elem;
    if cx.capabilities(dest)?.supports(&layout, &[elem]).is_err() {
        return Ok(None);
    }
    Ok(Some(rw.emit(layout, vec![w], dest.into(), None)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CompileConfig, context::ExecutionContext, dtype::ElemKind, graph::Graph,
        types::DeviceAffinity,
    };

    #[test]
    fn cancels_round_trips_and_sinks_layout() {
        let ctx = ExecutionContext::new(&CompileConfig::sim(0)).unwrap();
        let cx = PassContext::new(&ctx);
        let mut g = Graph::new();
        let x = g.input(ElemKind::F32, 2);
        let d = g.to_device(x, 0).unwrap();
        let t = g.transpose(d, [1, 0]).unwrap();
        let h = g.to_host(t).unwrap();
        let y = g.exp(h).unwrap();
        let p = Program::new(g, &[x], &[y], &[]).unwrap();
        let placed = crate::optimizer::Placement.run(&p, &cx).unwrap();
        let out = TransferElimination.run(&placed, &cx).unwrap();
        // The transpose runs on the host where x lives; only exp's input goes up.
        assert_eq!(out.transfer_count(), 1);
        let again = TransferElimination.run(&out, &cx).unwrap();
        assert_eq!(again.node_count(), out.node_count());
        let transpose = out
            .graph()
            .nodes()
            .iter()
            .find(|n| matches!(n.op, OpKind::Transpose { .. }))
            .unwrap();
        assert_eq!(transpose.placement, DeviceAffinity::Host);
    }
}
