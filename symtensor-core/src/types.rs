use std::fmt::Display;

use crate::{
    capability::{Capability, CapabilityTable},
    dtype::ElemKind,
    graph::{OpKind, ReduceOpType},
    Error, Result,
};

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    Host,
    Device(usize),
}

impl Location {
    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Device(n) => write!(f, "device{n}"),
        }
    }
}

/// Device a value is placed on. Stays `Unresolved` until the placement pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceAffinity {
    #[default]
    Unresolved,
    Host,
    Device(usize),
}

impl DeviceAffinity {
    pub fn location(&self) -> Option<Location> {
        match self {
            Self::Unresolved => None,
            Self::Host => Some(Location::Host),
            Self::Device(n) => Some(Location::Device(*n)),
        }
    }
}

impl From<Location> for DeviceAffinity {
    fn from(value: Location) -> Self {
        match value {
            Location::Host => Self::Host,
            Location::Device(n) => Self::Device(n),
        }
    }
}

impl Display for DeviceAffinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.location() {
            Some(loc) => loc.fmt(f),
            None => write!(f, "?"),
        }
    }
}

/// Static type of a graph value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type {
    pub elem: ElemKind,
    pub rank: usize,
    pub device: DeviceAffinity,
}

impl Type {
    pub fn new(elem: ElemKind, rank: usize) -> Self {
        Self {
            elem,
            rank,
            device: DeviceAffinity::Unresolved,
        }
    }

    pub fn scalar(elem: ElemKind) -> Self {
        Self::new(elem, 0)
    }

    pub fn with_elem(self, elem: ElemKind) -> Self {
        Self { elem, ..self }
    }

    pub fn with_rank(self, rank: usize) -> Self {
        Self { rank, ..self }
    }

    pub fn at(self, device: impl Into<DeviceAffinity>) -> Self {
        Self {
            device: device.into(),
            ..self
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]@{}", self.elem, self.rank, self.device)
    }
}

const SIGNED: [ElemKind; 2] = [ElemKind::I32, ElemKind::I64];
const FLOATS: [ElemKind; 4] = [ElemKind::F16, ElemKind::BF16, ElemKind::F32, ElemKind::F64];

/// Common element kind of two operands.
pub fn promote(a: ElemKind, b: ElemKind) -> Result<ElemKind> {
    if a == b {
        return Ok(a);
    }
    let err = || {
        Error::type_error(
            "promote",
            format!("no common element kind for {a} and {b}"),
        )
    };
    match (a.is_float(), b.is_float()) {
        (true, true) => {
            if a.bits() == b.bits() {
                // f16 with bf16: neither holds the other.
                Ok(ElemKind::F32)
            } else if a.bits() > b.bits() {
                Ok(a)
            } else {
                Ok(b)
            }
        }
        (false, false) if a.is_signed() == b.is_signed() => {
            Ok(if a.bits() >= b.bits() { a } else { b })
        }
        (false, false) => {
            let (unsigned, signed) = if a.is_signed() { (b, a) } else { (a, b) };
            SIGNED
                .into_iter()
                .find(|k| k.bits() > unsigned.bits() && k.bits() >= signed.bits())
                .ok_or_else(err)
        }
        (false, true) | (true, false) => {
            let (int, float) = if a.is_float() { (b, a) } else { (a, b) };
            if float.precision_bits() >= int.precision_bits() {
                return Ok(float);
            }
            Ok(FLOATS
                .into_iter()
                .filter(|k| k.bits() > float.bits())
                .find(|k| k.precision_bits() >= int.precision_bits())
                .unwrap_or(ElemKind::F64))
        }
    }
}

/// Result rank of an elementwise operation, allowing rank 0 to broadcast.
pub(crate) fn broadcast_rank(a: usize, b: usize) -> Option<usize> {
    if a == b || b == 0 {
        Some(a)
    } else if a == 0 {
        Some(b)
    } else {
        None
    }
}

/// Resolve the result type of a two-operand operation.
///
/// When `target` is given, the promoted kind must also be supported by that device.
pub fn resolve(a: &Type, b: &Type, op: &OpKind, target: Option<&CapabilityTable>) -> Result<Type> {
    let elem = promote(a.elem, b.elem).map_err(|e| match e {
        Error::Type { msg, .. } => Error::type_error(op.name(), msg),
        other => other,
    })?;
    let rank = match op.capability() {
        Capability::Elementwise => broadcast_rank(a.rank, b.rank),
        Capability::LinearAlgebra => {
            (a.rank == b.rank && (a.rank == 2 || a.rank == 3)).then_some(a.rank)
        }
        _ => (a.rank == b.rank).then_some(a.rank),
    }
    .ok_or_else(|| {
        Error::construction(
            op.name(),
            format!("incompatible ranks {} and {}", a.rank, b.rank),
        )
    })?;
    op.accepts(elem)
        .map_err(|reason| Error::type_error(op.name(), reason))?;
    if let Some(table) = target {
        table
            .supports(op, &[elem])
            .map_err(|reason| Error::type_error(op.name(), reason))?;
    }
    Ok(Type::new(elem, rank))
}

/// Type the operand of a one-operand operation is computed in. Transcendental
/// functions and `mean` of an integer run in `default_float`.
pub fn resolve_operand(a: &Type, op: &OpKind, default_float: ElemKind) -> Result<Type> {
    let float_only = match op {
        OpKind::Unary(u) => u.is_transcendental(),
        OpKind::Reduce {
            op: ReduceOpType::Mean,
            ..
        } => true,
        _ => false,
    };
    let elem = if float_only && !a.elem.is_float() {
        default_float
    } else {
        a.elem
    };
    op.accepts(elem)
        .map_err(|reason| Error::type_error(op.name(), reason))?;
    Ok(a.with_elem(elem))
}
