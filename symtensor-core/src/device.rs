use std::{str::FromStr, sync::Mutex};

#[cfg(feature = "cuda")]
use crate::cuda_backend::CudaDevice;
use crate::{
    capability::CapabilityTable,
    cpu_storage::CpuDevice,
    dtype::{ElemKind, HostData},
    graph::OpKind,
    kernels::{KernelFn, MathMode},
    sim_backend::{SimConfig, SimDevice},
    storage::{BackendDevice, Launch, LaunchArg, Storage},
    types::Location,
    Error, Result,
};

/// Which device a context targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSpec {
    #[default]
    Host,
    Sim(usize),
    Cuda(usize),
}

impl DeviceSpec {
    pub fn ordinal(&self) -> Option<usize> {
        match self {
            Self::Host => None,
            Self::Sim(n) | Self::Cuda(n) => Some(*n),
        }
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Sim(n) => write!(f, "sim{n}"),
            Self::Cuda(n) => write!(f, "cuda{n}"),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = Error;

    /// `host`, `cpu`, `sim0`, `sim:1`, `cuda0` or `cuda:1`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Configuration(format!("unknown device `{s}`"));
        if s == "host" || s == "cpu" {
            return Ok(Self::Host);
        }
        let (kind, rest) = if let Some(rest) = s.strip_prefix("sim") {
            (Self::Sim as fn(usize) -> Self, rest)
        } else if let Some(rest) = s.strip_prefix("cuda") {
            (Self::Cuda as fn(usize) -> Self, rest)
        } else {
            return Err(bad());
        };
        let rest = rest.strip_prefix(':').unwrap_or(rest);
        let ordinal = if rest.is_empty() {
            0
        } else {
            rest.parse::<usize>().map_err(|_| bad())?
        };
        Ok(kind(ordinal))
    }
}

/// A concrete device.
#[derive(Debug, Clone)]
pub enum Device {
    Cpu(CpuDevice),
    Sim(SimDevice),
    #[cfg(feature = "cuda")]
    Cuda(CudaDevice),
}

/// A thunk's arguments before they are matched to one backend.
pub(crate) struct DeviceLaunch<'a> {
    pub label: &'a str,
    pub op: &'a OpKind,
    pub inputs: Vec<(&'a Storage, &'a [usize])>,
    pub output: (&'a Storage, &'a [usize]),
    pub kernel: Option<KernelFn>,
    pub math: MathMode,
}

macro_rules! typed_launch {
    ($launch:expr, $variant:ident, $name:expr) => {{
        let DeviceLaunch {
            label,
            op,
            inputs,
            output,
            kernel,
            math,
        } = $launch;
        let typed = |s: &'a Storage| match s {
            Storage::$variant(s) => Ok(s),
            other => Err(Error::device(
                $name,
                label,
                format!("operand lives on {}", other.location()),
            )),
        };
        Launch {
            label,
            op,
            inputs: inputs
                .into_iter()
                .map(|(s, shape)| typed(s).map(|storage| LaunchArg { storage, shape }))
                .collect::<Result<Vec<_>>>()?,
            output: LaunchArg {
                storage: typed(output.0)?,
                shape: output.1,
            },
            kernel,
            math,
        }
    }};
}

impl Device {
    pub fn host() -> Self {
        Self::Cpu(CpuDevice)
    }

    /// Open the device `spec` names.
    pub fn open(spec: DeviceSpec, sim: &SimConfig) -> Result<Self> {
        match spec {
            DeviceSpec::Host => Ok(Self::host()),
            DeviceSpec::Sim(n) => Ok(Self::Sim(SimDevice::new(n, sim)?)),
            #[cfg(feature = "cuda")]
            DeviceSpec::Cuda(n) => Ok(Self::Cuda(CudaDevice::new(n)?)),
            #[cfg(not(feature = "cuda"))]
            DeviceSpec::Cuda(n) => Err(Error::Configuration(format!(
                "cuda{n} requested but symtensor was built without the `cuda` feature"
            ))),
        }
    }

    pub fn location(&self) -> Location {
        match self {
            Self::Cpu(d) => d.location(),
            Self::Sim(d) => d.location(),
            #[cfg(feature = "cuda")]
            Self::Cuda(d) => d.location(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Cpu(d) => d.name(),
            Self::Sim(d) => d.name(),
            #[cfg(feature = "cuda")]
            Self::Cuda(d) => d.name(),
        }
    }

    pub fn capabilities(&self) -> CapabilityTable {
        match self {
            Self::Cpu(d) => d.capabilities(),
            Self::Sim(d) => d.capabilities(),
            #[cfg(feature = "cuda")]
            Self::Cuda(d) => d.capabilities(),
        }
    }

    /// Whether kernels from the [`KernelRegistry`](crate::kernels::KernelRegistry) can
    /// run on this device's memory.
    pub fn uses_host_kernels(&self) -> bool {
        match self {
            Self::Cpu(_) | Self::Sim(_) => true,
            #[cfg(feature = "cuda")]
            Self::Cuda(_) => false,
        }
    }

    /// Math options this device applies on top of the requested relaxed-math flags.
    pub fn math_mode(&self, mut math: MathMode) -> MathMode {
        math.pairwise_sum = matches!(self, Self::Sim(_));
        math
    }

    pub fn alloc(&self, elem: ElemKind, len: usize) -> Result<Storage> {
        match self {
            Self::Cpu(d) => Ok(Storage::Cpu(d.alloc(elem, len)?)),
            Self::Sim(d) => Ok(Storage::Sim(d.alloc(elem, len)?)),
            #[cfg(feature = "cuda")]
            Self::Cuda(d) => Ok(Storage::Cuda(d.alloc(elem, len)?)),
        }
    }

    pub fn upload(&self, host: &HostData, numel: usize, dst: &Storage) -> Result<()> {
        match (self, dst) {
            (Self::Cpu(d), Storage::Cpu(s)) => d.upload(host, numel, s),
            (Self::Sim(d), Storage::Sim(s)) => d.upload(host, numel, s),
            #[cfg(feature = "cuda")]
            (Self::Cuda(d), Storage::Cuda(s)) => d.upload(host, numel, s),
            (_, other) => Err(self.mismatch("upload", other)),
        }
    }

    pub fn download(&self, src: &Storage, numel: usize) -> Result<HostData> {
        match (self, src) {
            (Self::Cpu(d), Storage::Cpu(s)) => d.download(s, numel),
            (Self::Sim(d), Storage::Sim(s)) => d.download(s, numel),
            #[cfg(feature = "cuda")]
            (Self::Cuda(d), Storage::Cuda(s)) => d.download(s, numel),
            (_, other) => Err(self.mismatch("download", other)),
        }
    }

    pub(crate) fn dispatch<'a>(&self, launch: DeviceLaunch<'a>) -> Result<()> {
        match self {
            Self::Cpu(d) => d.dispatch(typed_launch!(launch, Cpu, "host")),
            Self::Sim(d) => d.dispatch(typed_launch!(launch, Sim, d.name())),
            #[cfg(feature = "cuda")]
            Self::Cuda(d) => d.dispatch(typed_launch!(launch, Cuda, d.name())),
        }
    }

    pub fn synchronize(&self) -> Result<()> {
        match self {
            Self::Cpu(d) => d.synchronize(),
            Self::Sim(d) => d.synchronize(),
            #[cfg(feature = "cuda")]
            Self::Cuda(d) => d.synchronize(),
        }
    }

    pub fn synchronize_storage(&self, storage: &Storage) -> Result<()> {
        match (self, storage) {
            (Self::Cpu(d), Storage::Cpu(s)) => d.synchronize_storage(s),
            (Self::Sim(d), Storage::Sim(s)) => d.synchronize_storage(s),
            #[cfg(feature = "cuda")]
            (Self::Cuda(d), Storage::Cuda(s)) => d.synchronize_storage(s),
            (_, other) => Err(self.mismatch("synchronize", other)),
        }
    }

    fn mismatch(&self, op: &str, storage: &Storage) -> Error {
        Error::device(
            self.name(),
            op,
            format!("storage lives on {}", storage.location()),
        )
    }
}

/// Live accelerator contexts per ordinal. Only one ordinal may be active at a time.
static LEASES: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

/// Registration of one execution context on an accelerator ordinal, released on drop.
#[derive(Debug)]
pub struct AcceleratorLease {
    ordinal: usize,
}

impl AcceleratorLease {
    pub fn acquire(ordinal: usize) -> Result<Self> {
        let mut leases = LEASES.lock()?;
        if let Some((active, _)) = leases.iter().find(|(o, n)| *o != ordinal && *n > 0) {
            return Err(Error::Configuration(format!(
                "accelerator {active} is already in use by this process, cannot target accelerator {ordinal}"
            )));
        }
        match leases.iter_mut().find(|(o, _)| *o == ordinal) {
            Some((_, n)) => *n += 1,
            None => leases.push((ordinal, 1)),
        }
        Ok(Self { ordinal })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl Drop for AcceleratorLease {
    fn drop(&mut self) {
        let mut leases = match LEASES.lock() {
            Ok(leases) => leases,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((_, n)) = leases.iter_mut().find(|(o, _)| *o == self.ordinal) {
            *n = n.saturating_sub(1);
        }
        leases.retain(|(_, n)| *n > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_counts_per_ordinal() {
        let a = AcceleratorLease::acquire(0).unwrap();
        let b = AcceleratorLease::acquire(0).unwrap();
        drop(a);
        assert!(matches!(
            AcceleratorLease::acquire(3).unwrap_err(),
            Error::Configuration(_)
        ));
        drop(b);
    }

    #[test]
    fn mismatched_storage() {
        let sim = Device::open(DeviceSpec::Sim(0), &SimConfig::default()).unwrap();
        let host_buf = Device::host().alloc(ElemKind::F32, 4).unwrap();
        assert!(sim.download(&host_buf, 4).unwrap_err().is_device_error());
        assert_eq!(sim.math_mode(MathMode::default()).pairwise_sum, true);
    }

    #[test]
    fn parse_device_spec() {
        assert_eq!("cpu".parse::<DeviceSpec>().unwrap(), DeviceSpec::Host);
        assert_eq!("sim".parse::<DeviceSpec>().unwrap(), DeviceSpec::Sim(0));
        assert_eq!("sim:2".parse::<DeviceSpec>().unwrap(), DeviceSpec::Sim(2));
        assert_eq!("cuda1".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(1));
        assert!("tpu0".parse::<DeviceSpec>().is_err());
        assert!("sim:x".parse::<DeviceSpec>().is_err());
    }
}
