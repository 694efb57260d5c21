use crate::{
    capability::Capability,
    context::ExecutionContext,
    dtype::ElemKind,
    graph::{NodeId, OpKind, Program, SharedValue, VarId, VarOrigin},
    kernels::{KernelFn, MathMode},
    optimizer::PipelineReport,
    tensor::Tensor,
    types::{Location, Type},
    Error, Result,
};

/// A value as the scheduler sees it: the variable giving its shape and the slot
/// holding its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Operand {
    pub var: VarId,
    pub slot: usize,
}

/// One dispatch of a compiled function.
#[derive(Clone)]
pub(crate) struct Thunk {
    pub node: NodeId,
    pub label: String,
    pub op: OpKind,
    pub location: Location,
    pub elem: ElemKind,
    pub inputs: Vec<Operand>,
    pub output: Operand,
    /// Input whose buffer the output overwrites.
    pub inplace: Option<usize>,
    pub kernel: Option<KernelFn>,
    /// Upload of a constant, done by the first call only.
    pub cached: bool,
    pub math: MathMode,
}

/// What a thunk does and where, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThunkInfo {
    pub label: String,
    pub op: String,
    pub capability: Capability,
    pub location: Location,
}

impl From<&Thunk> for ThunkInfo {
    fn from(t: &Thunk) -> Self {
        Self {
            label: t.label.clone(),
            op: t.op.to_string(),
            capability: t.op.capability(),
            location: t.location,
        }
    }
}

/// The immutable part of a compiled function: dispatch order, slot assignment and
/// static read counts. Shared between forks.
pub(crate) struct Schedule {
    pub program: Program,
    pub report: PipelineReport,
    pub thunks: Vec<Thunk>,
    pub static_reads: Vec<usize>,
    pub pinned: Vec<bool>,
    pub inputs: Vec<(Operand, Type)>,
    pub constants: Vec<(Operand, Tensor)>,
    pub shared: Vec<(Operand, SharedValue)>,
    pub outputs: Vec<Operand>,
    pub updates: Vec<(SharedValue, Operand)>,
}

struct SlotMap {
    slots: Vec<Option<usize>>,
    next: usize,
}

impl SlotMap {
    fn get(&self, v: VarId) -> Result<usize> {
        self.slots[v.0].ok_or_else(|| Error::msg(format!("{v} has no slot")))
    }

    fn operand(&self, v: VarId) -> Result<Operand> {
        Ok(Operand {
            var: v,
            slot: self.get(v)?,
        })
    }

    fn assign(&mut self, v: VarId) -> usize {
        if let Some(slot) = self.slots[v.0] {
            return slot;
        }
        let slot = self.next;
        self.next += 1;
        self.slots[v.0] = Some(slot);
        slot
    }

    fn share(&mut self, v: VarId, with: VarId) -> Result<()> {
        self.slots[v.0] = Some(self.get(with)?);
        Ok(())
    }
}

impl Schedule {
    pub fn build(program: Program, ctx: &ExecutionContext, report: PipelineReport) -> Result<Self> {
        let graph = program.graph();
        let order = program.schedule_order()?;
        let mut slots = SlotMap {
            slots: vec![None; graph.vars().len()],
            next: 0,
        };

        for v in program.inputs() {
            slots.assign(*v);
        }
        for id in &order {
            let node = graph.node(*id)?;
            for v in &node.inputs {
                slots.assign(*v);
            }
            match node.inplace {
                Some(i) => slots.share(node.output(), node.inputs[i])?,
                None => {
                    slots.assign(node.output());
                }
            }
        }
        let roots = program.roots();
        for v in &roots {
            slots.assign(*v);
        }

        let mut static_reads = vec![0; slots.next];
        let mut pinned = vec![false; slots.next];
        for v in &roots {
            pinned[slots.get(*v)?] = true;
        }

        let mut thunks = Vec::with_capacity(order.len());
        for id in &order {
            let node = graph.node(*id)?;
            let label = node.label();
            let location = node
                .placement
                .location()
                .ok_or_else(|| Error::msg(format!("{label} was never placed")))?;
            let device = ctx.device(location)?;
            let inputs = node
                .inputs
                .iter()
                .map(|v| slots.operand(*v))
                .collect::<Result<Vec<_>>>()?;
            for o in &inputs {
                static_reads[o.slot] += 1;
            }
            let output = slots.operand(node.output())?;
            let cached = matches!(node.op, OpKind::ToDevice(_))
                && graph.var(node.inputs[0])?.as_constant().is_some();
            if cached {
                pinned[output.slot] = true;
            }
            let kernel = if !node.op.is_transfer() && device.uses_host_kernels() {
                Some(ctx.kernels().lookup(&node.op)?)
            } else {
                None
            };
            thunks.push(Thunk {
                node: node.id,
                label,
                op: node.op.clone(),
                location,
                elem: graph.ty(node.output())?.elem,
                inputs,
                output,
                inplace: node.inplace,
                kernel,
                cached,
                math: ctx.math_mode(location)?,
            });
        }

        let mut inputs = Vec::new();
        for v in program.inputs() {
            inputs.push((slots.operand(*v)?, graph.ty(*v)?));
        }
        let mut constants = Vec::new();
        let mut shared = Vec::new();
        for (i, var) in graph.vars().iter().enumerate() {
            let v = VarId(i);
            if slots.slots[i].is_none() {
                continue;
            }
            match &var.origin {
                VarOrigin::Constant(t) => constants.push((slots.operand(v)?, t.clone())),
                VarOrigin::Shared(value) => shared.push((slots.operand(v)?, value.clone())),
                VarOrigin::Input | VarOrigin::Output { .. } => {}
            }
        }
        let outputs = program
            .outputs()
            .iter()
            .map(|v| slots.operand(*v))
            .collect::<Result<Vec<_>>>()?;
        let mut updates = Vec::new();
        for (target, value) in program.updates() {
            let VarOrigin::Shared(shared_value) = &graph.var(*target)?.origin else {
                return Err(Error::construction(
                    "update",
                    format!("{target} is not a persistent value"),
                ));
            };
            updates.push((shared_value.clone(), slots.operand(*value)?));
        }

        Ok(Self {
            report,
            thunks,
            static_reads,
            pinned,
            inputs,
            constants,
            shared,
            outputs,
            updates,
            program,
        })
    }

    pub fn thunks(&self) -> &[Thunk] {
        &self.thunks
    }

    pub fn slot_count(&self) -> usize {
        self.static_reads.len()
    }
}
