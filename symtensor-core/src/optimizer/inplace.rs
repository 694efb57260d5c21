use log::debug;

use super::{rewrite::Rewriter, Pass, PassContext};
use crate::{
    capability::Capability,
    graph::{Node, Program},
    Result,
};

/// Marks elementwise nodes that may write their result over one of their inputs:
/// the input must be an intermediate of the same type whose last reader is the node.
#[derive(Debug, Clone, Copy, Default)]
pub struct InPlace;

impl InPlace {
    fn candidate(
        program: &Program,
        node: &Node,
        last_reader: &[Option<usize>],
        position: usize,
        cx: &PassContext,
    ) -> Result<Option<usize>> {
        let graph = program.graph();
        if node.op.is_transfer() || node.op.capability() != Capability::Elementwise {
            return Ok(None);
        }
        let Some(loc) = node.placement.location() else {
            return Ok(None);
        };
        if !cx.capabilities(loc)?.supports_inplace(Capability::Elementwise) {
            return Ok(None);
        }
        let out = graph.ty(node.output())?;
        for (i, v) in node.inputs.iter().enumerate() {
            let Some(producer) = graph.producer(*v) else {
                continue;
            };
            // Cached constant uploads are reused across calls.
            if producer.op.is_transfer() && graph.var(producer.inputs[0])?.as_constant().is_some() {
                continue;
            }
            let ty = graph.ty(*v)?;
            if program.is_root(*v)
                || ty.elem != out.elem
                || ty.rank != out.rank
                || last_reader[v.0] != Some(position)
            {
                continue;
            }
            return Ok(Some(i));
        }
        Ok(None)
    }
}

impl Pass for InPlace {
    fn name(&self) -> &'static str {
        "inplace"
    }

    fn run(&self, program: &Program, cx: &PassContext) -> Result<Program> {
        let graph = program.graph();
        let order = program.schedule_order()?;
        let mut last_reader: Vec<Option<usize>> = vec![None; graph.vars().len()];
        for (pos, id) in order.iter().enumerate() {
            for v in &graph.node(*id)?.inputs {
                last_reader[v.0] = Some(pos);
            }
        }
        let mut position = vec![None; graph.nodes().len()];
        for (pos, id) in order.iter().enumerate() {
            position[id.0] = Some(pos);
        }

        let mut rw = Rewriter::new(program)?;
        let mut marked = 0;
        for node in graph.nodes() {
            let Some(pos) = position[node.id.0] else {
                continue;
            };
            let inplace = match Self::candidate(program, node, &last_reader, pos, cx)? {
                Some(i) => {
                    marked += 1;
                    Some(i)
                }
                None => None,
            };
            let inputs = rw.vars(&node.inputs)?;
            let out = rw.emit(node.op.clone(), inputs, node.placement, inplace)?;
            rw.alias(node.output(), out);
        }
        debug!("{marked} nodes run in place");
        rw.finish()
    }
}
