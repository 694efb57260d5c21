/// Tracks buffer usage of one function instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryMetrics {
    /// Number of times a new buffer was allocated.
    pub allocations: usize,
    /// Number of times a buffer left in a slot was reused instead of allocated.
    pub reuses: usize,
    /// Number of owned buffers freed by garbage collection.
    pub releases: usize,
    /// Total bytes ever allocated.
    pub bytes_allocated: usize,
    /// Bytes currently held in owned slots.
    pub bytes_in_use: usize,
}

impl MemoryMetrics {
    pub(crate) fn record_allocation(&mut self, bytes: usize) {
        self.allocations += 1;
        self.bytes_allocated += bytes;
    }

    pub(crate) fn record_reuse(&mut self) {
        self.reuses += 1;
    }

    pub(crate) fn record_release(&mut self) {
        self.releases += 1;
    }
}
