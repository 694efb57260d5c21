use super::{rewrite::Rewriter, Pass, PassContext};
use crate::{graph::Program, Result};

/// Drops every node and constant the outputs and updates do not depend on. Program
/// inputs are kept even when unused, so the call signature does not change.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&self, program: &Program, _cx: &PassContext) -> Result<Program> {
        prune(program)
    }
}

pub(crate) fn prune(program: &Program) -> Result<Program> {
    let live = program.live_nodes();
    let mut rw = Rewriter::new(program)?;
    for node in program.graph().nodes().iter().filter(|n| live[n.id.0]) {
        rw.copy_node(node)?;
    }
    rw.finish()
}
