use crate::{
    graph::{Graph, Node, OpKind, Program, VarId, VarOrigin, Variable},
    tensor::Tensor,
    types::{DeviceAffinity, Location, Type},
    Error, Result,
};

/// Rebuilds a program's graph node by node. Variables of the source graph are mapped
/// to variables of the new one; leaves are copied the first time they are read.
pub(crate) struct Rewriter<'a> {
    src: &'a Program,
    graph: Graph,
    map: Vec<Option<VarId>>,
    leaf_affinity: Option<DeviceAffinity>,
}

impl<'a> Rewriter<'a> {
    pub fn new(src: &'a Program) -> Result<Self> {
        Self::build(src, None)
    }

    /// Like [`Rewriter::new`], placing every copied leaf at `affinity`.
    pub fn with_leaf_affinity(src: &'a Program, affinity: DeviceAffinity) -> Result<Self> {
        Self::build(src, Some(affinity))
    }

    fn build(src: &'a Program, leaf_affinity: Option<DeviceAffinity>) -> Result<Self> {
        let mut rw = Self {
            src,
            graph: src.graph.empty_like(),
            map: vec![None; src.graph.vars().len()],
            leaf_affinity,
        };
        // Inputs keep their relative order and are never dropped.
        for v in &src.inputs {
            rw.var(*v)?;
        }
        Ok(rw)
    }

    pub fn src(&self) -> &'a Program {
        self.src
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The new variable standing for `old`.
    pub fn var(&mut self, old: VarId) -> Result<VarId> {
        if let Some(new) = self.map.get(old.0).copied().flatten() {
            return Ok(new);
        }
        let src = self.src;
        let var = src.graph.var(old)?;
        if !var.is_leaf() {
            return Err(Error::msg(format!("{old} is read before it was rewritten")));
        }
        let ty = match self.leaf_affinity {
            Some(affinity) => var.ty.at(affinity),
            None => var.ty,
        };
        let new = self.graph.push_leaf(Variable {
            ty,
            ..var.clone()
        });
        self.map[old.0] = Some(new);
        Ok(new)
    }

    pub fn vars(&mut self, old: &[VarId]) -> Result<Vec<VarId>> {
        old.iter().map(|v| self.var(*v)).collect()
    }

    pub fn is_mapped(&self, old: VarId) -> bool {
        matches!(self.map.get(old.0), Some(Some(_)))
    }

    /// Make `old` resolve to the existing new variable `new`.
    pub fn alias(&mut self, old: VarId, new: VarId) {
        self.map[old.0] = Some(new);
    }

    pub fn constant(&mut self, tensor: Tensor) -> VarId {
        let ty = Type::new(tensor.elem(), tensor.rank());
        self.graph.push_leaf(Variable {
            ty: self.leaf_affinity.map_or(ty, |a| ty.at(a)),
            origin: VarOrigin::Constant(tensor),
            name: None,
        })
    }

    /// Append a node to the new graph. `inputs` are new variables.
    pub fn emit(
        &mut self,
        op: OpKind,
        inputs: Vec<VarId>,
        placement: DeviceAffinity,
        inplace: Option<usize>,
    ) -> Result<VarId> {
        self.graph.push_node(op, inputs, placement, inplace)
    }

    /// Copy `node` unchanged apart from its inputs.
    pub fn copy_node(&mut self, node: &Node) -> Result<VarId> {
        let inputs = self.vars(&node.inputs)?;
        let out = self.emit(node.op.clone(), inputs, node.placement, node.inplace)?;
        self.alias(node.output(), out);
        Ok(out)
    }

    /// Location of a new variable, `None` before placement.
    pub fn location(&self, new: VarId) -> Result<Option<Location>> {
        Ok(self.graph.ty(new)?.device.location())
    }

    pub fn finish(mut self) -> Result<Program> {
        let src = self.src;
        let inputs = self.vars(&src.inputs)?;
        let outputs = self.vars(&src.outputs)?;
        let updates = src
            .updates
            .iter()
            .map(|(target, value)| Ok((self.var(*target)?, self.var(*value)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Program::from_parts(self.graph, inputs, outputs, updates))
    }
}
