#[cfg(feature = "cuda")]
use crate::cuda_backend::CudaStorage;
use crate::{
    capability::CapabilityTable,
    cpu_storage::CpuStorage,
    dtype::{ElemKind, HostData},
    graph::OpKind,
    kernels::{KernelFn, MathMode},
    sim_backend::SimStorage,
    types::Location,
    Result,
};

/// A concrete allocation on one backend.
#[derive(Debug, Clone)]
pub enum Storage {
    Cpu(CpuStorage),
    Sim(SimStorage),
    #[cfg(feature = "cuda")]
    Cuda(CudaStorage),
}

impl Storage {
    fn backend(&self) -> &dyn BackendStorage {
        match self {
            Self::Cpu(s) => s,
            Self::Sim(s) => s,
            #[cfg(feature = "cuda")]
            Self::Cuda(s) => s,
        }
    }

    pub fn elem(&self) -> ElemKind {
        self.backend().elem()
    }

    /// Number of elements the allocation can hold.
    pub fn capacity(&self) -> usize {
        self.backend().capacity()
    }

    pub fn location(&self) -> Location {
        self.backend().location()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.capacity() * self.elem().size_in_bytes()
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &Storage) -> bool {
        match (self, other) {
            (Self::Cpu(a), Self::Cpu(b)) => a.same_allocation(b),
            (Self::Sim(a), Self::Sim(b)) => a.same_allocation(b),
            #[cfg(feature = "cuda")]
            (Self::Cuda(a), Self::Cuda(b)) => a.same_allocation(b),
            _ => false,
        }
    }
}

pub trait BackendStorage {
    fn elem(&self) -> ElemKind;
    fn capacity(&self) -> usize;
    fn location(&self) -> Location;
}

/// One kernel argument: a storage and the logical shape of the value it holds.
pub struct LaunchArg<'a, S> {
    pub storage: &'a S,
    pub shape: &'a [usize],
}

/// Everything a backend needs to run one thunk.
pub struct Launch<'a, S> {
    /// Op label used in error messages, e.g. `exp#n3`.
    pub label: &'a str,
    pub op: &'a OpKind,
    pub inputs: Vec<LaunchArg<'a, S>>,
    pub output: LaunchArg<'a, S>,
    /// Host kernel, for backends whose memory the host kernels can address.
    pub kernel: Option<KernelFn>,
    pub math: MathMode,
}

pub trait BackendDevice {
    type Storage: BackendStorage;

    fn location(&self) -> Location;

    fn name(&self) -> String;

    fn capabilities(&self) -> CapabilityTable;

    /// Allocation failures are reported immediately, never deferred.
    fn alloc(&self, elem: ElemKind, len: usize) -> Result<Self::Storage>;

    /// Copy the first `numel` elements of `host` into `dst`. Blocks until `dst` is no
    /// longer used by pending work.
    fn upload(&self, host: &HostData, numel: usize, dst: &Self::Storage) -> Result<()>;

    /// Copy the first `numel` elements of `src` to the host, once its last writer completed.
    fn download(&self, src: &Self::Storage, numel: usize) -> Result<HostData>;

    /// Enqueue a kernel. Asynchronous backends return before it runs, and report its
    /// failure at the next synchronization.
    fn dispatch(&self, launch: Launch<'_, Self::Storage>) -> Result<()>;

    /// Wait for all dispatched work and surface the first deferred failure.
    fn synchronize(&self) -> Result<()>;

    /// Wait for all work touching `storage`.
    fn synchronize_storage(&self, storage: &Self::Storage) -> Result<()>;
}
