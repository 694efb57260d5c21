//! The storage map of one function instance.
//!
//! Slots are assigned at compile time and keep their buffers across calls. A buffer is
//! reused when it is still large enough and nobody outside the map holds it, so a
//! borrowed output is never overwritten by a later call.

use std::sync::Arc;

use log::trace;

use crate::{
    context::ExecutionContext,
    device::Device,
    dtype::ElemKind,
    shape::numel,
    storage::Storage,
    types::Location,
    Error, Result,
};

mod metrics;

pub use metrics::MemoryMetrics;

/// A concrete allocation held in a slot.
#[derive(Debug)]
pub struct Buffer {
    storage: Storage,
    /// Allocated by the function, as opposed to aliasing caller data.
    owned: bool,
}

impl Buffer {
    pub(crate) fn owned(storage: Storage) -> Self {
        Self {
            storage,
            owned: true,
        }
    }

    pub(crate) fn borrowed(storage: Storage) -> Self {
        Self {
            storage,
            owned: false,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn location(&self) -> Location {
        self.storage.location()
    }

    pub fn elem(&self) -> ElemKind {
        self.storage.elem()
    }

    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.storage.size_in_bytes()
    }
}

#[derive(Debug)]
pub(crate) struct MemoryManager {
    slots: Vec<Option<Arc<Buffer>>>,
    /// Reads of each slot still to come in the current call.
    counts: Vec<usize>,
    static_reads: Vec<usize>,
    pinned: Vec<bool>,
    gc: bool,
    metrics: MemoryMetrics,
}

impl MemoryManager {
    pub fn new(static_reads: Vec<usize>, pinned: Vec<bool>, gc: bool) -> Self {
        let n = static_reads.len();
        Self {
            slots: vec![None; n],
            counts: static_reads.clone(),
            static_reads,
            pinned,
            gc,
            metrics: MemoryMetrics::default(),
        }
    }

    pub fn begin_call(&mut self) {
        self.counts.clone_from(&self.static_reads);
    }

    fn reusable(&self, buf: &Arc<Buffer>, loc: Location, elem: ElemKind, n: usize, refs: usize) -> bool {
        buf.owned
            && buf.location() == loc
            && buf.elem() == elem
            && buf.capacity() >= n
            && Arc::strong_count(buf) == refs
    }

    fn allocate(&mut self, slot: usize, device: &Device, elem: ElemKind, n: usize) -> Result<Arc<Buffer>> {
        // Keep zero sized values addressable.
        let storage = device.alloc(elem, n.max(1))?;
        self.metrics.record_allocation(storage.size_in_bytes());
        trace!("slot {slot}: allocated {n} x {elem} on {}", device.name());
        let buf = Arc::new(Buffer::owned(storage));
        self.slots[slot] = Some(buf.clone());
        Ok(buf)
    }

    /// Output buffer for a value of `shape` in `slot`, reusing what the slot holds when
    /// possible.
    pub fn acquire(
        &mut self,
        slot: usize,
        device: &Device,
        elem: ElemKind,
        shape: &[usize],
    ) -> Result<Arc<Buffer>> {
        let n = numel(shape);
        if let Some(buf) = &self.slots[slot] {
            if self.reusable(buf, device.location(), elem, n, 1) {
                self.metrics.record_reuse();
                return Ok(buf.clone());
            }
        }
        self.allocate(slot, device, elem, n)
    }

    /// Buffers for a node overwriting the input held in `slot`: `(input, output)`.
    /// The output is the input buffer itself when it can hold the result, a fresh
    /// buffer otherwise.
    pub fn acquire_inplace(
        &mut self,
        slot: usize,
        device: &Device,
        elem: ElemKind,
        shape: &[usize],
    ) -> Result<(Arc<Buffer>, Arc<Buffer>)> {
        let input = self.get(slot)?;
        // One reference in the slot, one held here.
        if self.reusable(&input, device.location(), elem, numel(shape), 2) {
            self.metrics.record_reuse();
            return Ok((input.clone(), input));
        }
        self.slots[slot] = None;
        let output = self.allocate(slot, device, elem, numel(shape))?;
        Ok((input, output))
    }

    /// Bind caller-owned data to `slot`.
    pub fn bind(&mut self, slot: usize, buffer: Arc<Buffer>) {
        self.slots[slot] = Some(buffer);
    }

    pub fn get(&self, slot: usize) -> Result<Arc<Buffer>> {
        self.slots
            .get(slot)
            .cloned()
            .flatten()
            .ok_or_else(|| Error::msg(format!("slot {slot} is empty")))
    }

    pub fn has(&self, slot: usize) -> bool {
        matches!(self.slots.get(slot), Some(Some(_)))
    }

    pub fn remaining(&self, slot: usize) -> usize {
        self.counts[slot]
    }

    /// Count one read of `slot`. When no read is left the buffer is dropped, unless
    /// it is pinned or an owned buffer kept alive with garbage collection off.
    /// Returns whether freeing it waited on the device.
    pub fn release(&mut self, slot: usize, ctx: &ExecutionContext) -> Result<bool> {
        self.counts[slot] = self.counts[slot].saturating_sub(1);
        if self.counts[slot] > 0 {
            return Ok(false);
        }
        self.free(slot, ctx)
    }

    /// Drop the buffer of a slot that has no reads left.
    pub fn free(&mut self, slot: usize, ctx: &ExecutionContext) -> Result<bool> {
        if self.pinned[slot] {
            return Ok(false);
        }
        let Some(buf) = &self.slots[slot] else {
            return Ok(false);
        };
        if !buf.owned {
            self.slots[slot] = None;
            return Ok(false);
        }
        if !self.gc {
            return Ok(false);
        }
        let mut synced = false;
        if !buf.location().is_host() {
            ctx.device(buf.location())?
                .synchronize_storage(buf.storage())?;
            synced = true;
        }
        trace!("slot {slot}: released {} bytes", buf.size_in_bytes());
        self.slots[slot] = None;
        self.metrics.record_release();
        Ok(synced)
    }

    /// Drop references to caller data once a call completed.
    pub fn finish_call(&mut self) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|b| !b.owned) {
                *slot = None;
            }
        }
    }

    /// Drop every buffer, e.g. after a failed call.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.counts.clone_from(&self.static_reads);
    }

    pub fn metrics(&self) -> MemoryMetrics {
        MemoryMetrics {
            bytes_in_use: self
                .slots
                .iter()
                .flatten()
                .filter(|b| b.owned)
                .map(|b| b.size_in_bytes())
                .sum(),
            ..self.metrics
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileConfig;

    fn host_ctx(gc: bool) -> ExecutionContext {
        ExecutionContext::new(&CompileConfig::default().with_garbage_collection(gc)).unwrap()
    }

    #[test]
    fn reuse_needs_capacity_and_uniqueness() {
        let ctx = host_ctx(true);
        let dev = ctx.host().clone();
        let mut mm = MemoryManager::new(vec![1], vec![true], true);
        let a = mm.acquire(0, &dev, ElemKind::F32, &[8]).unwrap();
        drop(a);
        // Shrinking reuses the larger buffer.
        mm.acquire(0, &dev, ElemKind::F32, &[4]).unwrap();
        assert_eq!(mm.metrics().reuses, 1);
        // Held outside the map: a fresh buffer.
        let held = mm.get(0).unwrap();
        let b = mm.acquire(0, &dev, ElemKind::F32, &[4]).unwrap();
        assert!(!Arc::ptr_eq(&held, &b));
        // Growing allocates.
        drop((held, b));
        mm.acquire(0, &dev, ElemKind::F32, &[16]).unwrap();
        assert_eq!(mm.metrics().allocations, 3);
        assert_eq!(mm.metrics().bytes_in_use, 64);
    }

    #[test]
    fn release_honors_gc_and_pins() {
        let ctx = host_ctx(true);
        let dev = ctx.host().clone();
        let mut mm = MemoryManager::new(vec![2, 1], vec![false, true], true);
        mm.acquire(0, &dev, ElemKind::I32, &[3]).unwrap();
        mm.acquire(1, &dev, ElemKind::I32, &[3]).unwrap();
        mm.release(0, &ctx).unwrap();
        assert!(mm.has(0));
        mm.release(0, &ctx).unwrap();
        assert!(!mm.has(0));
        mm.release(1, &ctx).unwrap();
        assert!(mm.has(1));
        assert_eq!(mm.metrics().releases, 1);

        let mut kept = MemoryManager::new(vec![1], vec![false], false);
        kept.acquire(0, &dev, ElemKind::I32, &[3]).unwrap();
        kept.release(0, &ctx).unwrap();
        assert!(kept.has(0));
    }
}
