use std::collections::HashSet;

use log::info;

use crate::{
    context::ExecutionContext,
    exec::{Function, Schedule},
    graph::{Graph, NodeId, VarId, VarOrigin},
    optimizer::{PassContext, Pipeline},
    Error, Result,
};

/// A graph together with its interface: the unit the optimizer rewrites.
#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) graph: Graph,
    pub(crate) inputs: Vec<VarId>,
    pub(crate) outputs: Vec<VarId>,
    /// `(shared target, new value)`
    pub(crate) updates: Vec<(VarId, VarId)>,
}

impl Program {
    pub fn new(
        graph: Graph,
        inputs: &[VarId],
        outputs: &[VarId],
        updates: &[(VarId, VarId)],
    ) -> Result<Self> {
        let program = Self::from_parts(graph, inputs.to_vec(), outputs.to_vec(), updates.to_vec());
        program.validate()?;
        Ok(program)
    }

    pub(crate) fn from_parts(
        graph: Graph,
        inputs: Vec<VarId>,
        outputs: Vec<VarId>,
        updates: Vec<(VarId, VarId)>,
    ) -> Self {
        Self {
            graph,
            inputs,
            outputs,
            updates,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    pub fn updates(&self) -> &[(VarId, VarId)] {
        &self.updates
    }

    /// Values that must be materialized: outputs followed by update values.
    pub(crate) fn roots(&self) -> Vec<VarId> {
        self.outputs
            .iter()
            .copied()
            .chain(self.updates.iter().map(|(_, v)| *v))
            .collect()
    }

    /// Outputs and update values. Their buffers outlive the call.
    pub(crate) fn is_root(&self, v: VarId) -> bool {
        self.outputs.contains(&v) || self.updates.iter().any(|(_, u)| *u == v)
    }

    pub(crate) fn live_nodes(&self) -> Vec<bool> {
        self.graph.reachable(&self.roots())
    }

    /// Number of reads of each variable by live nodes.
    pub(crate) fn use_counts(&self) -> Vec<usize> {
        let live = self.live_nodes();
        let mut uses = vec![0; self.graph.vars().len()];
        for node in self.graph.nodes().iter().filter(|n| live[n.id.0]) {
            for v in &node.inputs {
                uses[v.0] += 1;
            }
        }
        uses
    }

    pub(crate) fn schedule_order(&self) -> Result<Vec<NodeId>> {
        self.graph.topological_order(&self.roots())
    }

    pub fn node_count(&self) -> usize {
        self.graph.nodes().len()
    }

    pub fn transfer_count(&self) -> usize {
        self.graph
            .nodes()
            .iter()
            .filter(|n| n.op.is_transfer())
            .count()
    }

    pub fn validate(&self) -> Result<()> {
        let graph = &self.graph;
        graph.validate()?;
        if self.outputs.is_empty() && self.updates.is_empty() {
            return Err(Error::construction(
                "program",
                "a program needs at least one output or update",
            ));
        }
        for v in self.outputs.iter().chain(&self.inputs) {
            graph.var(*v)?;
        }

        let mut seen = HashSet::new();
        for v in &self.inputs {
            if !matches!(graph.var(*v)?.origin, VarOrigin::Input) {
                return Err(Error::construction(
                    "program",
                    format!("{v} is listed as an input but is not an input placeholder"),
                ));
            }
            if !seen.insert(*v) {
                return Err(Error::construction(
                    "program",
                    format!("input {v} is listed twice"),
                ));
            }
        }

        let mut targets = HashSet::new();
        for (target, value) in &self.updates {
            let t = graph.var(*target)?;
            let u = graph.var(*value)?;
            if !matches!(t.origin, VarOrigin::Shared(_)) {
                return Err(Error::construction(
                    "program",
                    format!("update target {target} is not a persistent value"),
                ));
            }
            if !targets.insert(*target) {
                return Err(Error::construction(
                    "program",
                    format!("{target} is updated twice"),
                ));
            }
            if t.ty.elem != u.ty.elem {
                return Err(Error::type_error(
                    "update",
                    format!("{target} holds {} but {value} is {}", t.ty.elem, u.ty.elem),
                ));
            }
            if t.ty.rank != u.ty.rank {
                return Err(Error::construction(
                    "update",
                    format!("{target} has rank {} but {value} has rank {}", t.ty.rank, u.ty.rank),
                ));
            }
        }

        // Every placeholder the roots depend on must be bound by the caller.
        let live = self.live_nodes();
        let reads = graph
            .nodes()
            .iter()
            .filter(|n| live[n.id.0])
            .flat_map(|n| n.inputs.iter().copied())
            .chain(self.roots());
        for v in reads {
            if matches!(graph.var(v)?.origin, VarOrigin::Input) && !seen.contains(&v) {
                return Err(Error::construction(
                    "program",
                    format!("input placeholder {v} is used but not listed as an input"),
                ));
            }
        }
        Ok(())
    }

    /// Optimize for the context's device and build an executable [`Function`].
    pub fn compile(self, ctx: &ExecutionContext) -> Result<Function> {
        self.validate()?;
        let (nodes_before, transfers_before) = (self.node_count(), self.transfer_count());
        let pipeline = Pipeline::standard(ctx.config())?;
        let cx = PassContext::new(ctx);
        let (optimized, report) = pipeline.run(self, &cx)?;
        let schedule = Schedule::build(optimized, ctx, report)?;
        info!(
            "compiled for {}: {} nodes ({} transfers) -> {} thunks, {} slots",
            ctx.target_name(),
            nodes_before,
            transfers_before,
            schedule.thunks().len(),
            schedule.slot_count(),
        );
        Ok(Function::new(schedule, ctx.clone()))
    }
}
