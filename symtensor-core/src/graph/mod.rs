use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet},
    env,
    fmt::Display,
    fs,
    path::Path,
    process::Command,
};

use petgraph::Graph as PetGraph;
use petgraph::{
    algo::is_cyclic_directed,
    dot::{Config, Dot},
    graph::NodeIndex,
};

use crate::{
    bail,
    config::CompileConfig,
    dtype::{DType, ElemKind},
    exec::Function,
    tensor::Tensor,
    types::{resolve, resolve_operand, DeviceAffinity, Type},
    Error, Result,
};

pub mod op;
mod program;
mod shared;

pub use op::{
    BinaryOpType, FusedExpr, FusedInstr, OpClass, OpKind, ReduceOpType, UnaryOpType,
};
pub use program::Program;
pub use shared::{PersistentVar, SharedValue};

/// Handle to a value in a [`Graph`]. Ids are creation indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) usize);

impl VarId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum VarOrigin {
    /// Bound to a caller tensor on every call.
    Input,
    Constant(Tensor),
    Shared(SharedValue),
    Output { node: NodeId, index: usize },
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub ty: Type,
    pub origin: VarOrigin,
    pub name: Option<String>,
}

impl Variable {
    pub fn is_leaf(&self) -> bool {
        !matches!(self.origin, VarOrigin::Output { .. })
    }

    pub fn as_constant(&self) -> Option<&Tensor> {
        match &self.origin {
            VarOrigin::Constant(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: OpKind,
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
    pub placement: DeviceAffinity,
    /// Index of the input whose buffer the output overwrites.
    pub inplace: Option<usize>,
}

impl Node {
    /// `exp#n3`
    pub fn label(&self) -> String {
        format!("{}#{}", self.op.name(), self.id)
    }

    pub fn output(&self) -> VarId {
        self.outputs[0]
    }
}

/// An arena of variables and operations. Operations only reference variables that
/// already exist, so the graph is acyclic by construction.
#[derive(Debug, Clone)]
pub struct Graph {
    vars: Vec<Variable>,
    nodes: Vec<Node>,
    default_float: ElemKind,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Create an empty graph whose integer-to-float promotions use `f32`.
    pub fn new() -> Self {
        Self {
            vars: Vec::new(),
            nodes: Vec::new(),
            default_float: ElemKind::F32,
        }
    }

    /// Create an empty graph with a different default float kind.
    pub fn with_float(elem: ElemKind) -> Result<Self> {
        if !elem.is_float() {
            return Err(Error::Configuration(format!(
                "default float kind must be a float, got {elem}"
            )));
        }
        Ok(Self {
            default_float: elem,
            ..Self::new()
        })
    }

    /// Create an empty graph using the config's `element_type`.
    pub fn from_config(config: &CompileConfig) -> Self {
        Self {
            default_float: config.element_type,
            ..Self::new()
        }
    }

    /// An empty graph with the same settings, for passes that rebuild a graph.
    pub(crate) fn empty_like(&self) -> Self {
        Self {
            vars: Vec::new(),
            nodes: Vec::new(),
            default_float: self.default_float,
        }
    }

    pub fn default_float(&self) -> ElemKind {
        self.default_float
    }

    pub fn vars(&self) -> &[Variable] {
        &self.vars
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn var(&self, id: VarId) -> Result<&Variable> {
        self.vars
            .get(id.0)
            .ok_or_else(|| Error::construction("graph", format!("unknown variable {id}")))
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| Error::construction("graph", format!("unknown node {id}")))
    }

    pub fn ty(&self, id: VarId) -> Result<Type> {
        Ok(self.var(id)?.ty)
    }

    /// The node producing `id`, if it is not a leaf.
    pub fn producer(&self, id: VarId) -> Option<&Node> {
        match self.vars.get(id.0)?.origin {
            VarOrigin::Output { node, .. } => self.nodes.get(node.0),
            _ => None,
        }
    }

    pub(crate) fn push_leaf(&mut self, var: Variable) -> VarId {
        self.vars.push(var);
        VarId(self.vars.len() - 1)
    }

    /// An input placeholder of the given type.
    pub fn variable(&mut self, ty: Type) -> VarId {
        self.push_leaf(Variable {
            ty: ty.at(DeviceAffinity::Unresolved),
            origin: VarOrigin::Input,
            name: None,
        })
    }

    pub fn input(&mut self, elem: ElemKind, rank: usize) -> VarId {
        self.variable(Type::new(elem, rank))
    }

    pub fn named_input(&mut self, name: impl Into<String>, elem: ElemKind, rank: usize) -> VarId {
        let id = self.input(elem, rank);
        self.vars[id.0].name = Some(name.into());
        id
    }

    pub fn constant(&mut self, tensor: Tensor) -> VarId {
        self.push_leaf(Variable {
            ty: Type::new(tensor.elem(), tensor.rank()),
            origin: VarOrigin::Constant(tensor),
            name: None,
        })
    }

    pub fn scalar<T: DType>(&mut self, v: T) -> VarId {
        self.constant(Tensor::scalar(v))
    }

    /// Register a new persistent value.
    pub fn shared(&mut self, initial: Tensor) -> PersistentVar {
        self.shared_value(SharedValue::new(initial))
    }

    /// Register an existing persistent value, e.g. one shared with another graph.
    pub fn shared_value(&mut self, value: SharedValue) -> PersistentVar {
        let var = self.push_leaf(Variable {
            ty: Type::new(value.elem(), value.rank()),
            origin: VarOrigin::Shared(value.clone()),
            name: None,
        });
        PersistentVar { var, value }
    }

    /// Append a node without promotion. Inputs must already share an element kind.
    pub(crate) fn push_node(
        &mut self,
        op: OpKind,
        inputs: Vec<VarId>,
        placement: DeviceAffinity,
        inplace: Option<usize>,
    ) -> Result<VarId> {
        let tys = inputs
            .iter()
            .map(|v| self.ty(*v))
            .collect::<Result<Vec<_>>>()?;
        let ty = op.infer(&tys)?.at(placement);
        let id = NodeId(self.nodes.len());
        let out = VarId(self.vars.len());
        self.vars.push(Variable {
            ty,
            origin: VarOrigin::Output { node: id, index: 0 },
            name: None,
        });
        self.nodes.push(Node {
            id,
            op,
            inputs,
            outputs: vec![out],
            placement,
            inplace,
        });
        Ok(out)
    }

    /// Add an operation, inserting casts so that every kernel sees homogeneous inputs.
    ///
    /// Arity, rank and kind errors are reported here rather than at execution.
    pub fn apply(&mut self, op: OpKind, inputs: &[VarId]) -> Result<Vec<VarId>> {
        if inputs.len() != op.arity() {
            return Err(Error::construction(
                op.name(),
                format!("expected {} inputs, got {}", op.arity(), inputs.len()),
            ));
        }
        let tys = inputs
            .iter()
            .map(|v| self.ty(*v))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| match e {
                Error::GraphConstruction { msg, .. } => Error::construction(op.name(), msg),
                other => other,
            })?;
        let target = match &op {
            OpKind::Cast { to } if *to == tys[0].elem => return Ok(vec![inputs[0]]),
            OpKind::Binary(_) | OpKind::MatMul | OpKind::Fused { .. } => {
                let mut ty = tys[0];
                for t in &tys[1..] {
                    ty = resolve(&ty, t, &op, None)?;
                }
                Some(ty.elem)
            }
            _ if tys.len() == 1 => Some(resolve_operand(&tys[0], &op, self.default_float)?.elem),
            _ => None,
        };
        let mut args = inputs.to_vec();
        if let Some(elem) = target {
            for (arg, ty) in args.iter_mut().zip(&tys) {
                if ty.elem != elem {
                    *arg = self.push_node(
                        OpKind::Cast { to: elem },
                        vec![*arg],
                        DeviceAffinity::Unresolved,
                        None,
                    )?;
                }
            }
        }
        let out = self.push_node(op, args, DeviceAffinity::Unresolved, None)?;
        Ok(vec![out])
    }

    fn apply1(&mut self, op: OpKind, inputs: &[VarId]) -> Result<VarId> {
        let outs = self.apply(op, inputs)?;
        Ok(outs[0])
    }

    pub fn unary(&mut self, op: UnaryOpType, x: VarId) -> Result<VarId> {
        self.apply1(OpKind::Unary(op), &[x])
    }

    pub fn binary(&mut self, op: BinaryOpType, a: VarId, b: VarId) -> Result<VarId> {
        self.apply1(OpKind::Binary(op), &[a, b])
    }

    pub fn add(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.binary(BinaryOpType::Add, a, b)
    }

    pub fn sub(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.binary(BinaryOpType::Sub, a, b)
    }

    pub fn mul(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.binary(BinaryOpType::Mul, a, b)
    }

    pub fn div(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.binary(BinaryOpType::Div, a, b)
    }

    pub fn maximum(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.binary(BinaryOpType::Max, a, b)
    }

    pub fn minimum(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.binary(BinaryOpType::Min, a, b)
    }

    pub fn pow(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.binary(BinaryOpType::Pow, a, b)
    }

    pub fn neg(&mut self, x: VarId) -> Result<VarId> {
        self.unary(UnaryOpType::Neg, x)
    }

    pub fn abs(&mut self, x: VarId) -> Result<VarId> {
        self.unary(UnaryOpType::Abs, x)
    }

    pub fn relu(&mut self, x: VarId) -> Result<VarId> {
        self.unary(UnaryOpType::Relu, x)
    }

    pub fn exp(&mut self, x: VarId) -> Result<VarId> {
        self.unary(UnaryOpType::Exp, x)
    }

    pub fn log(&mut self, x: VarId) -> Result<VarId> {
        self.unary(UnaryOpType::Log, x)
    }

    pub fn sqrt(&mut self, x: VarId) -> Result<VarId> {
        self.unary(UnaryOpType::Sqrt, x)
    }

    pub fn tanh(&mut self, x: VarId) -> Result<VarId> {
        self.unary(UnaryOpType::Tanh, x)
    }

    pub fn sigmoid(&mut self, x: VarId) -> Result<VarId> {
        self.unary(UnaryOpType::Sigmoid, x)
    }

    pub fn reduce(&mut self, op: ReduceOpType, x: VarId, axis: Option<usize>) -> Result<VarId> {
        self.apply1(OpKind::Reduce { op, axis }, &[x])
    }

    pub fn sum(&mut self, x: VarId, axis: Option<usize>) -> Result<VarId> {
        self.reduce(ReduceOpType::Sum, x, axis)
    }

    pub fn mean(&mut self, x: VarId, axis: Option<usize>) -> Result<VarId> {
        self.reduce(ReduceOpType::Mean, x, axis)
    }

    pub fn max(&mut self, x: VarId, axis: Option<usize>) -> Result<VarId> {
        self.reduce(ReduceOpType::Max, x, axis)
    }

    pub fn min(&mut self, x: VarId, axis: Option<usize>) -> Result<VarId> {
        self.reduce(ReduceOpType::Min, x, axis)
    }

    pub fn matmul(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        self.apply1(OpKind::MatMul, &[a, b])
    }

    pub fn reshape(&mut self, x: VarId, shape: impl Into<Vec<usize>>) -> Result<VarId> {
        self.apply1(
            OpKind::Reshape {
                shape: shape.into(),
            },
            &[x],
        )
    }

    pub fn transpose(&mut self, x: VarId, perm: impl Into<Vec<usize>>) -> Result<VarId> {
        self.apply1(OpKind::Transpose { perm: perm.into() }, &[x])
    }

    pub fn cast(&mut self, x: VarId, to: ElemKind) -> Result<VarId> {
        self.apply1(OpKind::Cast { to }, &[x])
    }

    /// Explicitly move `x` to accelerator `ordinal`.
    pub fn to_device(&mut self, x: VarId, ordinal: usize) -> Result<VarId> {
        self.apply1(OpKind::ToDevice(ordinal), &[x])
    }

    pub fn to_host(&mut self, x: VarId) -> Result<VarId> {
        self.apply1(OpKind::ToHost, &[x])
    }

    /// Nodes reachable from `outputs`.
    pub(crate) fn reachable(&self, outputs: &[VarId]) -> Vec<bool> {
        let mut live = vec![false; self.nodes.len()];
        let mut stack = outputs.to_vec();
        while let Some(v) = stack.pop() {
            if let Some(node) = self.producer(v) {
                if !live[node.id.0] {
                    live[node.id.0] = true;
                    stack.extend(node.inputs.iter().copied());
                }
            }
        }
        live
    }

    /// Kahn's algorithm over the nodes reachable from `outputs`, breaking ties by
    /// creation order. Identical graphs always give identical orders.
    pub fn topological_order(&self, outputs: &[VarId]) -> Result<Vec<NodeId>> {
        for v in outputs {
            self.var(*v)?;
        }
        let live = self.reachable(outputs);
        let mut indegree = vec![0usize; self.nodes.len()];
        let mut users: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];
        for node in self.nodes.iter().filter(|n| live[n.id.0]) {
            let producers = node
                .inputs
                .iter()
                .filter_map(|v| self.producer(*v).map(|p| p.id))
                .collect::<HashSet<_>>();
            indegree[node.id.0] = producers.len();
            for p in producers {
                users[p.0].push(node.id);
            }
        }
        let mut ready = self
            .nodes
            .iter()
            .filter(|n| live[n.id.0] && indegree[n.id.0] == 0)
            .map(|n| Reverse(n.id))
            .collect::<BinaryHeap<_>>();
        let mut order = Vec::new();
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for user in &users[id.0] {
                indegree[user.0] -= 1;
                if indegree[user.0] == 0 {
                    ready.push(Reverse(*user));
                }
            }
        }
        if order.len() != live.iter().filter(|l| **l).count() {
            return Err(Error::construction("graph", "cycle detected"));
        }
        Ok(order)
    }

    /// Check that every operation reads values produced before it, and that there is
    /// no cycle.
    pub fn validate(&self) -> Result<()> {
        for node in &self.nodes {
            for v in &node.inputs {
                let var = self.var(*v)?;
                if let VarOrigin::Output { node: producer, .. } = var.origin {
                    if producer >= node.id {
                        return Err(Error::construction(
                            node.label(),
                            format!("reads {v} which is produced later by {producer}"),
                        ));
                    }
                }
            }
            for v in &node.outputs {
                match self.var(*v)?.origin {
                    VarOrigin::Output { node: n, .. } if n == node.id => {}
                    _ => {
                        return Err(Error::construction(
                            node.label(),
                            format!("output {v} is not attributed to this node"),
                        ))
                    }
                }
            }
        }
        if is_cyclic_directed(&self.to_petgraph()) {
            return Err(Error::construction("graph", "cycle detected"));
        }
        Ok(())
    }

    fn leaf_label(&self, id: VarId) -> String {
        let var = &self.vars[id.0];
        let kind = match &var.origin {
            VarOrigin::Input => "input",
            VarOrigin::Constant(_) => "const",
            VarOrigin::Shared(_) => "shared",
            VarOrigin::Output { .. } => "value",
        };
        match &var.name {
            Some(name) => format!("{kind} {name}: {}", var.ty),
            None => format!("{kind} {id}: {}", var.ty),
        }
    }

    pub fn to_petgraph(&self) -> PetGraph<String, ()> {
        let mut g = PetGraph::<String, ()>::new();
        // One graph node per leaf and per operation, keyed by variable.
        let mut idx_map: Vec<Option<NodeIndex>> = vec![None; self.vars.len()];
        for (i, var) in self.vars.iter().enumerate() {
            if var.is_leaf() {
                idx_map[i] = Some(g.add_node(self.leaf_label(VarId(i))));
            }
        }
        let mut node_idx = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut label = format!("{} {}", node.label(), node.op);
            if node.placement != DeviceAffinity::Unresolved {
                label += &format!(" @{}", node.placement);
            }
            if let Some(i) = node.inplace {
                label += &format!(" (inplace {i})");
            }
            let dst = g.add_node(label);
            node_idx.push(dst);
            for out in &node.outputs {
                idx_map[out.0] = Some(dst);
            }
        }
        for (node, dst) in self.nodes.iter().zip(&node_idx) {
            for v in &node.inputs {
                if let Some(src) = idx_map.get(v.0).copied().flatten() {
                    g.add_edge(src, *dst, ());
                }
            }
        }
        g
    }

    /// Produce a DOT format string of this graph.
    pub fn to_dot(&self) -> String {
        let g = self.to_petgraph();
        format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }

    /// Visualize the graph by saving it to this file.
    ///
    /// Install graphvis:
    /// - brew install graphviz
    /// - apt install graphviz
    pub fn visualize<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        let path = filename.as_ref();
        let dot_path = env::temp_dir().join("symtensor-graph.dot");

        fs::write(&dot_path, self.to_dot())?;
        let status = Command::new("dot")
            .args([
                "-Tpng",
                &dot_path.display().to_string(),
                "-o",
                &path.display().to_string(),
            ])
            .status()?;
        if !status.success() {
            bail!("graphviz exited with {status}");
        }
        Ok(())
    }

    /// Build a [`Program`] from this graph and compile it for `config`.
    pub fn compile(
        &self,
        inputs: &[VarId],
        outputs: &[VarId],
        updates: &[(VarId, VarId)],
        config: &CompileConfig,
    ) -> Result<Function> {
        let ctx = crate::context::ExecutionContext::new(config)?;
        Program::new(self.clone(), inputs, outputs, updates)?.compile(&ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts_inserted_for_mixed_kinds() {
        let mut g = Graph::new();
        let a = g.input(ElemKind::I32, 1);
        let b = g.input(ElemKind::F32, 1);
        let c = g.add(a, b).unwrap();
        assert_eq!(g.ty(c).unwrap().elem, ElemKind::F64);
        // Two casts and the add.
        assert_eq!(g.nodes().len(), 3);
        assert!(g
            .nodes()
            .iter()
            .take(2)
            .all(|n| n.op == OpKind::Cast { to: ElemKind::F64 }));
    }

    #[test]
    fn resolved_kind_decides_the_cast() {
        let config = CompileConfig::host()
            .with_element_type(ElemKind::F64)
            .unwrap();
        let mut g = Graph::from_config(&config);
        let a = g.input(ElemKind::I32, 1);
        let b = g.input(ElemKind::F64, 1);
        let c = g.add(a, b).unwrap();
        let add = OpKind::Binary(BinaryOpType::Add);
        let want = resolve(&g.ty(a).unwrap(), &g.ty(b).unwrap(), &add, None).unwrap();
        assert_eq!(g.ty(c).unwrap().elem, want.elem);
        // Only the integer side is cast.
        assert_eq!(g.nodes().len(), 2);
        assert_eq!(g.nodes()[0].op, OpKind::Cast { to: ElemKind::F64 });
        assert_eq!(g.nodes()[0].inputs, vec![a]);
        assert_eq!(g.nodes()[1].inputs[1], b);

        let e = g.exp(a).unwrap();
        let exp = OpKind::Unary(UnaryOpType::Exp);
        let want = resolve_operand(&g.ty(a).unwrap(), &exp, g.default_float()).unwrap();
        assert_eq!(want.elem, ElemKind::F64);
        let node = g.producer(e).unwrap();
        assert_eq!(node.op, exp);
        let cast = g.producer(node.inputs[0]).unwrap();
        assert_eq!(cast.op, OpKind::Cast { to: want.elem });
        assert_eq!(g.ty(e).unwrap().elem, ElemKind::F64);
    }

    #[test]
    fn transcendental_on_integers_uses_default_float() {
        let mut g = Graph::with_float(ElemKind::F64).unwrap();
        let a = g.input(ElemKind::U8, 1);
        let e = g.exp(a).unwrap();
        assert_eq!(g.ty(e).unwrap().elem, ElemKind::F64);
    }

    #[test]
    fn construction_errors_are_immediate() {
        let mut g = Graph::new();
        let a = g.input(ElemKind::U32, 1);
        assert!(matches!(g.neg(a).unwrap_err(), Error::Type { .. }));
        assert!(matches!(
            g.sum(a, Some(3)).unwrap_err(),
            Error::GraphConstruction { .. }
        ));
        assert!(matches!(
            g.add(a, VarId(99)).unwrap_err(),
            Error::GraphConstruction { .. }
        ));
    }

    #[test]
    fn topological_order_breaks_ties_by_creation() {
        let mut g = Graph::new();
        let x = g.input(ElemKind::F32, 1);
        let a = g.exp(x).unwrap();
        let b = g.neg(x).unwrap();
        let c = g.add(b, a).unwrap();
        let _dead = g.sqrt(x).unwrap();
        let order = g.topological_order(&[c]).unwrap();
        assert_eq!(order, vec![NodeId(0), NodeId(1), NodeId(2)]);
        g.validate().unwrap();
        assert!(g.to_dot().contains("exp#n0"));
    }
}
