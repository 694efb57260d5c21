use std::{
    ops::Deref,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard},
};

use crate::{
    capability::CapabilityTable,
    dtype::{ElemKind, HostData},
    kernels::{KernelArgs, Operand},
    storage::{BackendDevice, BackendStorage, Launch},
    tensor::Tensor,
    types::Location,
    Error, Result,
};

/// The host backend. Kernels run synchronously on the calling thread, parallelized
/// with rayon inside each kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuDevice;

/// Host memory: owned by the executing function, or aliasing caller data.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    Owned(Arc<RwLock<HostData>>),
    /// Caller tensors, constants and persistent values. Never written.
    Borrowed(Arc<HostData>),
}

impl CpuStorage {
    pub fn owned(data: HostData) -> Self {
        Self::Owned(Arc::new(RwLock::new(data)))
    }

    pub fn borrowed(data: Arc<HostData>) -> Self {
        Self::Borrowed(data)
    }

    pub(crate) fn same_allocation(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Owned(a), Self::Owned(b)) => Arc::ptr_eq(a, b),
            (Self::Borrowed(a), Self::Borrowed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&HostData) -> R) -> Result<R> {
        Ok(f(&*self.read()?))
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut HostData) -> R) -> Result<R> {
        match self {
            Self::Owned(data) => Ok(f(&mut *data.write()?)),
            Self::Borrowed(_) => Err(Error::msg("borrowed host storage is read only")),
        }
    }

    fn read(&self) -> Result<HostRead<'_>> {
        Ok(match self {
            Self::Owned(data) => HostRead::Locked(data.read()?),
            Self::Borrowed(data) => HostRead::Shared(data),
        })
    }

    /// A tensor of the first `numel(shape)` elements. Borrowed data of the exact size is
    /// shared instead of copied.
    pub fn to_tensor(&self, shape: &[usize]) -> Result<Tensor> {
        let numel = crate::shape::numel(shape);
        match self {
            Self::Borrowed(data) if data.len() == numel => {
                Ok(Tensor::from_shared(shape.to_vec(), data.clone()))
            }
            _ => Tensor::new(shape, self.with_data(|d| d.prefix(numel))??),
        }
    }
}

enum HostRead<'a> {
    Locked(RwLockReadGuard<'a, HostData>),
    Shared(&'a HostData),
}

impl Deref for HostRead<'_> {
    type Target = HostData;

    fn deref(&self) -> &HostData {
        match self {
            Self::Locked(guard) => guard,
            Self::Shared(data) => data,
        }
    }
}

impl BackendStorage for CpuStorage {
    fn elem(&self) -> ElemKind {
        match self {
            // Kind and length never change after allocation, so a poisoned lock still
            // reports them correctly.
            Self::Owned(data) => data.read().unwrap_or_else(PoisonError::into_inner).kind(),
            Self::Borrowed(data) => data.kind(),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            Self::Owned(data) => data.read().unwrap_or_else(PoisonError::into_inner).len(),
            Self::Borrowed(data) => data.len(),
        }
    }

    fn location(&self) -> Location {
        Location::Host
    }
}

impl BackendDevice for CpuDevice {
    type Storage = CpuStorage;

    fn location(&self) -> Location {
        Location::Host
    }

    fn name(&self) -> String {
        "host".to_string()
    }

    fn capabilities(&self) -> CapabilityTable {
        CapabilityTable::host()
    }

    fn alloc(&self, elem: ElemKind, len: usize) -> Result<CpuStorage> {
        Ok(CpuStorage::owned(HostData::zeros(elem, len)))
    }

    fn upload(&self, host: &HostData, numel: usize, dst: &CpuStorage) -> Result<()> {
        dst.with_data_mut(|d| d.copy_prefix_from(host, numel))?
    }

    fn download(&self, src: &CpuStorage, numel: usize) -> Result<HostData> {
        src.with_data(|d| d.prefix(numel))?
    }

    fn dispatch(&self, launch: Launch<'_, CpuStorage>) -> Result<()> {
        let Launch {
            label,
            op,
            inputs,
            output,
            kernel,
            math,
        } = launch;
        let kernel =
            kernel.ok_or_else(|| Error::device("host", label, "no host kernel is bound"))?;
        let CpuStorage::Owned(out) = output.storage else {
            return Err(Error::device("host", label, "output storage is read only"));
        };
        // Inputs aliasing the output are read through the output buffer itself.
        let reads = inputs
            .iter()
            .map(|arg| {
                if arg.storage.same_allocation(output.storage) {
                    Ok(None)
                } else {
                    arg.storage.read().map(Some)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let operands = reads
            .iter()
            .map(|r| match r {
                Some(data) => Operand::In(&**data),
                None => Operand::Out,
            })
            .collect::<Vec<_>>();
        let shapes = inputs.iter().map(|a| a.shape.to_vec()).collect::<Vec<_>>();
        let mut out = out.write()?;
        kernel(
            op,
            KernelArgs {
                inputs: &operands,
                shapes: &shapes,
                out: &mut *out,
                out_shape: output.shape,
                math,
            },
        )
        .map_err(|e| Error::device("host", label, e))
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn synchronize_storage(&self, _storage: &CpuStorage) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{OpKind, UnaryOpType},
        kernels::{KernelRegistry, MathMode},
        storage::LaunchArg,
    };

    #[test]
    fn poisoned_storage_keeps_kind_and_capacity() {
        let buf = CpuStorage::owned(HostData::zeros(ElemKind::F32, 5));
        let writer = buf.clone();
        let _ = std::thread::spawn(move || {
            let CpuStorage::Owned(data) = &writer else {
                unreachable!()
            };
            let _guard = data.write().unwrap();
            panic!("kernel panicked while writing");
        })
        .join();
        let CpuStorage::Owned(data) = &buf else {
            unreachable!()
        };
        assert!(data.is_poisoned());
        assert_eq!(buf.elem(), ElemKind::F32);
        assert_eq!(buf.capacity(), 5);
        // Reads through the checked accessors still report the poison.
        assert!(buf.with_data(|d| d.len()).is_err());
    }

    #[test]
    fn dispatch_in_place() {
        let dev = CpuDevice;
        let buf = CpuStorage::owned(HostData::from(vec![-1f32, 2., -3.]));
        let op = OpKind::Unary(UnaryOpType::Abs);
        let shape = [3];
        dev.dispatch(Launch {
            label: "abs#n0",
            op: &op,
            inputs: vec![LaunchArg {
                storage: &buf,
                shape: &shape,
            }],
            output: LaunchArg {
                storage: &buf,
                shape: &shape,
            },
            kernel: KernelRegistry::host().get(op.class()),
            math: MathMode::default(),
        })
        .unwrap();
        let t = buf.to_tensor(&shape).unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1., 2., 3.]);
    }

    #[test]
    fn borrowed_is_read_only() {
        let dev = CpuDevice;
        let data = Arc::new(HostData::from(vec![1u8, 2]));
        let s = CpuStorage::borrowed(data.clone());
        assert!(dev.upload(&HostData::from(vec![3u8]), 1, &s).is_err());
        let t = s.to_tensor(&[2]).unwrap();
        assert!(Arc::ptr_eq(t.shared_data(), &data));
    }
}
