use std::{
    fmt::Debug,
    sync::{Arc, RwLock},
};

use crate::{dtype::ElemKind, graph::VarId, tensor::Tensor, Error, Result};

/// A host tensor that survives across calls. It is only written by the updates of a
/// compiled function, after the call that computed them has completed.
#[derive(Clone)]
pub struct SharedValue {
    value: Arc<RwLock<Tensor>>,
    elem: ElemKind,
    rank: usize,
}

impl Debug for SharedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedValue")
            .field("elem", &self.elem)
            .field("rank", &self.rank)
            .finish()
    }
}

impl SharedValue {
    pub fn new(initial: Tensor) -> Self {
        Self {
            elem: initial.elem(),
            rank: initial.rank(),
            value: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn elem(&self) -> ElemKind {
        self.elem
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Current value. Cheap: the data is shared, not copied.
    pub fn get(&self) -> Result<Tensor> {
        Ok(self.value.read()?.clone())
    }

    /// Replace the value. Element kind and rank are fixed at creation.
    pub fn set(&self, value: Tensor) -> Result<()> {
        if value.elem() != self.elem {
            return Err(Error::type_error(
                "shared",
                format!("expected {}, got {}", self.elem, value.elem()),
            ));
        }
        if value.rank() != self.rank {
            return Err(Error::shape(
                "shared",
                format!("expected rank {}, got {:?}", self.rank, value.shape()),
            ));
        }
        *self.value.write()? = value;
        Ok(())
    }

    pub fn same_value(&self, other: &SharedValue) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

/// A persistent value registered in a graph.
#[derive(Debug, Clone)]
pub struct PersistentVar {
    pub var: VarId,
    pub value: SharedValue,
}
