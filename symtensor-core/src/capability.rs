use std::{collections::BTreeMap, fmt::Display};

use crate::{
    dtype::ElemKind,
    graph::{OpClass, OpKind},
    types::Location,
};

/// Coarse operation families a device declares support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Elementwise,
    Reduction,
    LinearAlgebra,
    Transfer,
    Indexing,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Elementwise,
        Capability::Reduction,
        Capability::LinearAlgebra,
        Capability::Transfer,
        Capability::Indexing,
    ];
}

impl Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Elementwise => "elementwise",
            Self::Reduction => "reduction",
            Self::LinearAlgebra => "linear-algebra",
            Self::Transfer => "transfer",
            Self::Indexing => "indexing",
        })
    }
}

/// Whether `dispatch` returns before the work completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Sync,
    Async,
}

/// A set of element kinds.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ElemSet(u16);

impl ElemSet {
    pub const EMPTY: ElemSet = ElemSet(0);

    fn bit(kind: ElemKind) -> u16 {
        1 << (ElemKind::ALL.iter().position(|k| *k == kind).unwrap_or(0) as u16)
    }

    pub fn all() -> Self {
        Self::of(&ElemKind::ALL)
    }

    pub fn of(kinds: &[ElemKind]) -> Self {
        Self(kinds.iter().fold(0, |acc, k| acc | Self::bit(*k)))
    }

    pub fn contains(&self, kind: ElemKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    pub fn with(self, kind: ElemKind) -> Self {
        Self(self.0 | Self::bit(kind))
    }

    pub fn without(self, kind: ElemKind) -> Self {
        Self(self.0 & !Self::bit(kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = ElemKind> + '_ {
        ElemKind::ALL.into_iter().filter(|k| self.contains(*k))
    }
}

impl std::fmt::Debug for ElemSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Support {
    pub elems: ElemSet,
    pub mode: ExecMode,
    /// Outputs may overwrite a dead input buffer.
    pub inplace: bool,
}

/// What a device can run, consumed by type resolution and placement.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    name: String,
    location: Location,
    classes: BTreeMap<Capability, Support>,
    overrides: BTreeMap<OpClass, ElemSet>,
}

const SIM_KINDS: [ElemKind; 6] = [
    ElemKind::U8,
    ElemKind::U32,
    ElemKind::I32,
    ElemKind::F16,
    ElemKind::BF16,
    ElemKind::F32,
];

impl CapabilityTable {
    pub fn new(name: impl Into<String>, location: Location) -> Self {
        Self {
            name: name.into(),
            location,
            classes: BTreeMap::new(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn with(mut self, capability: Capability, support: Support) -> Self {
        self.classes.insert(capability, support);
        self
    }

    /// Everything, synchronously.
    pub fn host() -> Self {
        let support = Support {
            elems: ElemSet::all(),
            mode: ExecMode::Sync,
            inplace: true,
        };
        Capability::ALL
            .into_iter()
            .fold(Self::new("host", Location::Host), |t, c| t.with(c, support))
    }

    /// The simulated accelerator: no 64-bit kinds, `f32`-only linear algebra.
    pub fn sim(ordinal: usize) -> Self {
        let support = Support {
            elems: ElemSet::of(&SIM_KINDS),
            mode: ExecMode::Async,
            inplace: true,
        };
        Capability::ALL
            .into_iter()
            .fold(
                Self::new(format!("sim:{ordinal}"), Location::Device(ordinal)),
                |t, c| t.with(c, support),
            )
            .with(
                Capability::LinearAlgebra,
                Support {
                    elems: ElemSet::of(&[ElemKind::F32]),
                    inplace: false,
                    ..support
                },
            )
    }

    /// JIT elementwise kernels and transfers only.
    pub fn cuda(ordinal: usize) -> Self {
        let support = Support {
            elems: ElemSet::all(),
            mode: ExecMode::Async,
            inplace: true,
        };
        Self::new(format!("cuda:{ordinal}"), Location::Device(ordinal))
            .with(Capability::Elementwise, support)
            .with(Capability::Transfer, support)
    }

    /// Restrict (or widen) the kinds one op class supports, overriding its capability.
    pub fn register(&mut self, class: OpClass, elems: ElemSet) {
        self.overrides.insert(class, elems);
    }

    pub fn disable(&mut self, class: OpClass) {
        self.register(class, ElemSet::EMPTY);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn support(&self, capability: Capability) -> Option<&Support> {
        self.classes.get(&capability)
    }

    pub fn mode(&self) -> ExecMode {
        if self
            .classes
            .values()
            .any(|s| s.mode == ExecMode::Async)
        {
            ExecMode::Async
        } else {
            ExecMode::Sync
        }
    }

    pub fn supports_inplace(&self, capability: Capability) -> bool {
        self.support(capability).is_some_and(|s| s.inplace)
    }

    /// Check that `op` runs here for every kind in `elems`; the error is the reason.
    pub fn supports(&self, op: &OpKind, elems: &[ElemKind]) -> std::result::Result<(), String> {
        let class = op.class();
        let capability = class.capability();
        let Some(support) = self.classes.get(&capability) else {
            return Err(format!("{} has no {capability} support", self.name));
        };
        let allowed = self.overrides.get(&class).copied().unwrap_or(support.elems);
        if allowed == ElemSet::EMPTY {
            return Err(format!("{} is disabled on {}", op.name(), self.name));
        }
        match elems.iter().find(|e| !allowed.contains(**e)) {
            Some(e) => Err(format!("{} does not support {e} for {}", self.name, op.name())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BinaryOpType, UnaryOpType};

    #[test]
    fn sim_table() {
        let t = CapabilityTable::sim(0);
        let exp = OpKind::Unary(UnaryOpType::Exp);
        assert!(t.supports(&exp, &[ElemKind::F32]).is_ok());
        assert!(t.supports(&exp, &[ElemKind::F64]).is_err());
        assert!(t.supports(&OpKind::MatMul, &[ElemKind::F16]).is_err());
        assert_eq!(t.mode(), ExecMode::Async);
    }

    #[test]
    fn disable_class() {
        let mut t = CapabilityTable::host();
        let add = OpKind::Binary(BinaryOpType::Add);
        t.disable(OpClass::Binary);
        let reason = t.supports(&add, &[ElemKind::F32]).unwrap_err();
        assert!(reason.contains("disabled"));
        assert!(t
            .supports(&OpKind::Unary(UnaryOpType::Neg), &[ElemKind::F32])
            .is_ok());
    }

    #[test]
    fn cuda_has_no_reductions() {
        let t = CapabilityTable::cuda(0);
        let sum = OpKind::Reduce {
            op: crate::graph::ReduceOpType::Sum,
            axis: None,
        };
        assert!(t.supports(&sum, &[ElemKind::F32]).is_err());
    }
}
