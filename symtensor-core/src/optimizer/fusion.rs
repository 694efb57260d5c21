use super::{rewrite::Rewriter, Pass, PassContext};
use crate::{
    graph::{FusedExpr, FusedInstr, Node, NodeId, OpKind, Program, VarId},
    types::Location,
    Error, Result,
};

/// Merges trees of unary, binary and fused nodes into one fused kernel. Only
/// intermediates with a single reader are absorbed, so a value read twice (a diamond)
/// is still computed once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fusion;

/// Which values may be folded into their reader.
struct Absorb<'p> {
    program: &'p Program,
    absorbable: Vec<bool>,
}

impl<'p> Absorb<'p> {
    fn analyze(program: &'p Program, cx: &PassContext) -> Result<Self> {
        let graph = program.graph();
        let live = program.live_nodes();
        let uses = program.use_counts();
        let mut reader: Vec<Option<NodeId>> = vec![None; graph.vars().len()];
        for node in graph.nodes().iter().filter(|n| live[n.id.0]) {
            for v in &node.inputs {
                reader[v.0] = Some(node.id);
            }
        }
        let candidate = OpKind::Fused {
            expr: FusedExpr {
                instrs: vec![FusedInstr::Input(0)],
                n_inputs: 1,
            },
        };

        let mut absorbable = vec![false; graph.vars().len()];
        for (i, flag) in absorbable.iter_mut().enumerate() {
            let v = VarId(i);
            let Some(producer) = graph.producer(v) else {
                continue;
            };
            let Some(consumer) = reader[i] else {
                continue;
            };
            let consumer = graph.node(consumer)?;
            if !producer.op.is_fusable()
                || !consumer.op.is_fusable()
                || uses[i] != 1
                || program.is_root(v)
                || producer.placement != consumer.placement
            {
                continue;
            }
            let elem = graph.ty(v)?.elem;
            if graph.ty(consumer.output())?.elem != elem {
                continue;
            }
            let loc = producer.placement.location().unwrap_or(Location::Host);
            *flag = cx.capabilities(loc)?.supports(&candidate, &[elem]).is_ok();
        }
        Ok(Self {
            program,
            absorbable,
        })
    }

    fn get(&self, v: VarId) -> bool {
        self.absorbable[v.0]
    }
}

/// A fused expression under construction. `inputs` are variables of the source graph.
#[derive(Default)]
struct Tree {
    instrs: Vec<FusedInstr>,
    inputs: Vec<VarId>,
    loaded: Vec<Option<usize>>,
}

impl Tree {
    fn push(&mut self, instr: FusedInstr) -> usize {
        self.instrs.push(instr);
        self.instrs.len() - 1
    }

    fn leaf(&mut self, v: VarId) -> usize {
        let k = match self.inputs.iter().position(|i| *i == v) {
            Some(k) => k,
            None => {
                self.inputs.push(v);
                self.loaded.push(None);
                self.inputs.len() - 1
            }
        };
        if let Some(i) = self.loaded[k] {
            return i;
        }
        let i = self.push(FusedInstr::Input(k));
        self.loaded[k] = Some(i);
        i
    }

    fn expand(&mut self, node: &Node, absorb: &Absorb) -> Result<usize> {
        let graph = absorb.program.graph();
        let mut args = Vec::with_capacity(node.inputs.len());
        for v in &node.inputs {
            let arg = match graph.producer(*v) {
                Some(producer) if absorb.get(*v) => self.expand(producer, absorb)?,
                _ => self.leaf(*v),
            };
            args.push(arg);
        }
        match &node.op {
            OpKind::Unary(u) => Ok(self.push(FusedInstr::Unary(*u, args[0]))),
            OpKind::Binary(b) => Ok(self.push(FusedInstr::Binary(*b, args[0], args[1]))),
            OpKind::Fused { expr } => {
                let mut map = Vec::with_capacity(expr.instrs.len());
                for instr in &expr.instrs {
                    let i = match *instr {
                        FusedInstr::Input(k) => args[k],
                        FusedInstr::Unary(u, a) => self.push(FusedInstr::Unary(u, map[a])),
                        FusedInstr::Binary(b, l, r) => {
                            self.push(FusedInstr::Binary(b, map[l], map[r]))
                        }
                    };
                    map.push(i);
                }
                map.last()
                    .copied()
                    .ok_or_else(|| Error::msg(format!("{} has an empty expression", node.label())))
            }
            other => Err(Error::msg(format!("{other} cannot be fused"))),
        }
    }
}

impl Pass for Fusion {
    fn name(&self) -> &'static str {
        "fusion"
    }

    fn run(&self, program: &Program, cx: &PassContext) -> Result<Program> {
        let absorb = Absorb::analyze(program, cx)?;
        let live = program.live_nodes();
        let mut rw = Rewriter::new(program)?;

        for node in program.graph().nodes().iter().filter(|n| live[n.id.0]) {
            if absorb.get(node.output()) {
                // Emitted as part of its reader.
                continue;
            }
            if !node.op.is_fusable() || !node.inputs.iter().any(|v| absorb.get(*v)) {
                rw.copy_node(node)?;
                continue;
            }
            let mut tree = Tree::default();
            tree.expand(node, &absorb)?;
            let expr = FusedExpr {
                n_inputs: tree.inputs.len(),
                instrs: tree.instrs,
            };
            let inputs = rw.vars(&tree.inputs)?;
            let out = rw.emit(OpKind::Fused { expr }, inputs, node.placement, None)?;
            rw.alias(node.output(), out);
        }
        rw.finish()
    }
}
