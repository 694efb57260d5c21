use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    device::Device, dtype::ElemKind, memory::Buffer, storage::Storage, tensor::Tensor,
    types::Location, Error, Result,
};

/// One result of [`Function::call_with`](super::Function::call_with).
#[derive(Debug)]
pub enum Output {
    Host(Tensor),
    Borrowed(BorrowedTensor),
}

impl Output {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Host(t) => t.shape(),
            Self::Borrowed(b) => b.shape(),
        }
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, Self::Borrowed(_))
    }

    /// The value as a host tensor, downloading it if it lives on an accelerator.
    pub fn to_host(&self) -> Result<Tensor> {
        match self {
            Self::Host(t) => Ok(t.clone()),
            Self::Borrowed(b) => b.to_host(),
        }
    }
}

/// A result left in the function's own storage, possibly on an accelerator. Valid
/// until the next call of the function that produced it.
#[derive(Debug)]
pub struct BorrowedTensor {
    buffer: Arc<Buffer>,
    shape: Vec<usize>,
    device: Device,
    epoch: u64,
    current: Arc<AtomicU64>,
}

impl BorrowedTensor {
    pub(crate) fn new(
        buffer: Arc<Buffer>,
        shape: Vec<usize>,
        device: Device,
        epoch: u64,
        current: Arc<AtomicU64>,
    ) -> Self {
        Self {
            buffer,
            shape,
            device,
            epoch,
            current,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn elem(&self) -> ElemKind {
        self.buffer.elem()
    }

    pub fn location(&self) -> Location {
        self.buffer.location()
    }

    pub fn is_valid(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.epoch
    }

    fn check(&self) -> Result<()> {
        let current = self.current.load(Ordering::SeqCst);
        if current != self.epoch {
            return Err(Error::StaleHandle {
                epoch: self.epoch,
                current,
            });
        }
        Ok(())
    }

    /// Copy the value to the host. Waits for the kernel that writes it.
    pub fn to_host(&self) -> Result<Tensor> {
        self.check()?;
        materialize(&self.device, self.buffer.storage(), &self.shape)
    }
}

/// A host tensor holding the first `numel(shape)` elements of `storage`.
pub(crate) fn materialize(device: &Device, storage: &Storage, shape: &[usize]) -> Result<Tensor> {
    match storage {
        Storage::Cpu(s) => s.to_tensor(shape),
        other => Tensor::new(shape, device.download(other, crate::shape::numel(shape))?),
    }
}
