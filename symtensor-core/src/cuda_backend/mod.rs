use cudarc::{
    driver::{
        CudaContext, CudaEvent, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchArgs,
        LaunchConfig, PushKernelArg,
    },
    nvrtc::{CompileOptions, Ptx},
};
use error::{CudaError, WrapErr};
use half::{bf16, f16};
use log::{debug, trace};
use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
};

use crate::{
    capability::CapabilityTable,
    dtype::{ElemKind, HostData},
    kernels::MathMode,
    shape::numel,
    storage::{BackendDevice, BackendStorage, Launch},
    types::Location,
    Error, Result,
};

pub(crate) mod error;
mod kernel;

const MAX_CACHED_KERNELS: usize = 128;
const STREAMS: usize = 8;

#[derive(Clone)]
pub struct CudaDevice {
    ordinal: usize,
    context: Arc<CudaContext>,
    modules: Arc<RwLock<HashMap<String, Arc<CudaModule>>>>,
    module_cache_order: Arc<Mutex<VecDeque<String>>>,
    streams: Arc<Vec<Arc<CudaStream>>>,
    stream_index: Arc<AtomicUsize>,
}

impl std::fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDevice")
            .field("ordinal", &self.ordinal)
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl CudaDevice {
    pub(crate) fn new(ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(ordinal).w()?;
        let mut pool = Vec::with_capacity(STREAMS);
        for _ in 0..STREAMS {
            pool.push(context.new_stream().w()?);
        }
        debug!("cuda:{ordinal}: {STREAMS} streams");
        Ok(Self {
            ordinal,
            context,
            modules: Arc::new(RwLock::new(HashMap::new())),
            module_cache_order: Arc::new(Mutex::new(VecDeque::new())),
            streams: Arc::new(pool),
            stream_index: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Round-robin selection of a stream from the pool
    fn select_stream(&self) -> Arc<CudaStream> {
        let idx = self.stream_index.fetch_add(1, Ordering::SeqCst) % self.streams.len();
        self.streams[idx].clone()
    }

    fn load_func(&self, function_name: &str, ptx: Ptx) -> Result<CudaFunction> {
        let module = self
            .context
            .load_module(ptx)
            .map_err(|source| CudaError::ModuleLoad {
                source,
                module: function_name.to_string(),
            })?;
        let func = module.load_function(function_name).w()?;
        let mut modules = self.modules.write()?;
        let mut order = self.module_cache_order.lock()?;
        modules.insert(function_name.to_string(), module);
        order.push_back(function_name.to_string());
        if order.len() > MAX_CACHED_KERNELS {
            if let Some(old) = order.pop_front() {
                modules.remove(&old);
            }
        }
        Ok(func)
    }

    /// Compile (or fetch) the function for `jit`. Loaded modules are cached in memory,
    /// PTX under `~/.cache/symtensor/ptx`.
    fn function(&self, jit: &kernel::JitKernel, math: MathMode) -> Result<CudaFunction> {
        let name = jit.name(&[math.fast_transcendentals, math.flush_denormals]);
        if let Some(module) = self.modules.read()?.get(&name) {
            return module.load_function(&name).w();
        }
        let cached = ptx_cache_path(&name);
        let ptx = match cached.as_ref().filter(|p| p.is_file()) {
            Some(path) => Ptx::from_src(fs::read_to_string(path)?),
            None => {
                let ptx = compile_ptx(&name, jit.render(&name), math)?;
                if let Some(path) = &cached {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(path, ptx.to_src())?;
                }
                ptx
            }
        };
        trace!("cuda:{}: loading {name}", self.ordinal);
        self.load_func(&name, ptx)
    }

    fn sync_error(&self, op: &str, e: impl std::fmt::Display) -> Error {
        // Errors reported asynchronously by the driver are sticky for the context.
        Error::Device {
            device: self.name(),
            op: op.to_string(),
            msg: e.to_string(),
            fatal: true,
        }
    }
}

fn ptx_cache_path(name: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        home.join(".cache")
            .join("symtensor")
            .join("ptx")
            .join(format!("{name}.ptx"))
    })
}

fn cuda_include_dir() -> Option<PathBuf> {
    // NOTE: copied from cudarc build.rs.
    let env_vars = [
        "CUDA_PATH",
        "CUDA_ROOT",
        "CUDA_TOOLKIT_ROOT_DIR",
        "CUDNN_LIB",
    ];
    let env_vars = env_vars
        .into_iter()
        .map(std::env::var)
        .filter_map(std::result::Result::ok)
        .map(Into::<PathBuf>::into);

    let roots = [
        "/usr",
        "/usr/local/cuda",
        "/opt/cuda",
        "/usr/lib/cuda",
        "C:/Program Files/NVIDIA GPU Computing Toolkit",
        "C:/CUDA",
    ];
    let roots = roots.into_iter().map(Into::<PathBuf>::into);

    env_vars
        .chain(roots)
        .find(|path| path.join("include").join("cuda.h").is_file())
}

fn compile_ptx(name: &str, src: String, math: MathMode) -> Result<Ptx> {
    let include = cuda_include_dir().ok_or(CudaError::MissingToolkit)?;
    cudarc::nvrtc::compile_ptx_with_opts(
        src,
        // Compile PTX without hardcoding an architecture so it can JIT to the current device
        CompileOptions {
            use_fast_math: Some(math.fast_transcendentals),
            ftz: Some(math.flush_denormals),
            include_paths: vec![include.join("include").display().to_string()],
            ..Default::default()
        },
    )
    .map_err(|err| {
        CudaError::Compile {
            err,
            module: name.to_string(),
        }
        .into()
    })
}

/// A typed device allocation.
enum CudaData {
    U8(CudaSlice<u8>),
    U32(CudaSlice<u32>),
    I32(CudaSlice<i32>),
    I64(CudaSlice<i64>),
    F16(CudaSlice<f16>),
    BF16(CudaSlice<bf16>),
    F32(CudaSlice<f32>),
    F64(CudaSlice<f64>),
}

macro_rules! with_cuda_data {
    ($data:expr, $s:ident => $body:expr) => {
        match $data {
            CudaData::U8($s) => $body,
            CudaData::U32($s) => $body,
            CudaData::I32($s) => $body,
            CudaData::I64($s) => $body,
            CudaData::F16($s) => $body,
            CudaData::BF16($s) => $body,
            CudaData::F32($s) => $body,
            CudaData::F64($s) => $body,
        }
    };
}

/// Pair host and device data of the same kind.
macro_rules! zip_host {
    ($host:expr, $dev:expr, ($h:ident, $d:ident) => $body:expr, $otherwise:expr) => {
        match ($host, $dev) {
            (HostData::U8($h), CudaData::U8($d)) => $body,
            (HostData::U32($h), CudaData::U32($d)) => $body,
            (HostData::I32($h), CudaData::I32($d)) => $body,
            (HostData::I64($h), CudaData::I64($d)) => $body,
            (HostData::F16($h), CudaData::F16($d)) => $body,
            (HostData::BF16($h), CudaData::BF16($d)) => $body,
            (HostData::F32($h), CudaData::F32($d)) => $body,
            (HostData::F64($h), CudaData::F64($d)) => $body,
            _ => $otherwise,
        }
    };
}

fn push_arg<'a>(builder: &mut LaunchArgs<'a>, data: &'a CudaData) {
    with_cuda_data!(data, s => {
        builder.arg(s);
    })
}

/// Outstanding work on one allocation.
struct Hazards<E = Arc<CudaEvent>> {
    last_write: Option<E>,
    reads: Vec<E>,
}

impl<E> Default for Hazards<E> {
    fn default() -> Self {
        Self {
            last_write: None,
            reads: Vec::new(),
        }
    }
}

impl<E> Hazards<E> {
    /// Record a launch reading the allocation. Reads that already completed are
    /// dropped, so an allocation read by every call keeps a bounded list.
    fn add_read(&mut self, event: E, done: impl Fn(&E) -> bool) {
        self.reads.retain(|e| !done(e));
        self.reads.push(event);
    }

    fn set_writer(&mut self, event: E) {
        self.last_write = Some(event);
        self.reads.clear();
    }
}

/// Grid for `numel` threads. The grid size is 32 bit.
fn launch_config(label: &str, numel: usize) -> Result<LaunchConfig> {
    let n = u32::try_from(numel).map_err(|_| CudaError::LaunchTooLarge {
        label: label.to_string(),
        numel,
    })?;
    Ok(LaunchConfig::for_num_elems(n))
}

struct CudaAlloc {
    elem: ElemKind,
    capacity: usize,
    ordinal: usize,
    data: Mutex<CudaData>,
    hazards: Mutex<Hazards>,
}

#[derive(Clone)]
pub struct CudaStorage(Arc<CudaAlloc>);

impl std::fmt::Debug for CudaStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaStorage")
            .field("ordinal", &self.0.ordinal)
            .field("elem", &self.0.elem)
            .field("capacity", &self.0.capacity)
            .finish()
    }
}

impl CudaStorage {
    pub(crate) fn same_allocation(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn data(&self) -> Result<MutexGuard<'_, CudaData>> {
        Ok(self.0.data.lock()?)
    }

    fn pending(&self) -> Result<Vec<Arc<CudaEvent>>> {
        let h = self.0.hazards.lock()?;
        Ok(h.last_write.iter().chain(&h.reads).cloned().collect())
    }
}

impl BackendStorage for CudaStorage {
    fn elem(&self) -> ElemKind {
        self.0.elem
    }

    fn capacity(&self) -> usize {
        self.0.capacity
    }

    fn location(&self) -> Location {
        Location::Device(self.0.ordinal)
    }
}

impl BackendDevice for CudaDevice {
    type Storage = CudaStorage;

    fn location(&self) -> Location {
        Location::Device(self.ordinal)
    }

    fn name(&self) -> String {
        format!("cuda:{}", self.ordinal)
    }

    fn capabilities(&self) -> CapabilityTable {
        CapabilityTable::cuda(self.ordinal)
    }

    fn alloc(&self, elem: ElemKind, len: usize) -> Result<CudaStorage> {
        let stream = self.select_stream();
        let alloc_err = |source| CudaError::OutOfMemory { len, elem, source };
        let data = match elem {
            ElemKind::U8 => CudaData::U8(stream.alloc_zeros(len).map_err(alloc_err)?),
            ElemKind::U32 => CudaData::U32(stream.alloc_zeros(len).map_err(alloc_err)?),
            ElemKind::I32 => CudaData::I32(stream.alloc_zeros(len).map_err(alloc_err)?),
            ElemKind::I64 => CudaData::I64(stream.alloc_zeros(len).map_err(alloc_err)?),
            ElemKind::F16 => CudaData::F16(stream.alloc_zeros(len).map_err(alloc_err)?),
            ElemKind::BF16 => CudaData::BF16(stream.alloc_zeros(len).map_err(alloc_err)?),
            ElemKind::F32 => CudaData::F32(stream.alloc_zeros(len).map_err(alloc_err)?),
            ElemKind::F64 => CudaData::F64(stream.alloc_zeros(len).map_err(alloc_err)?),
        };
        stream.synchronize().map_err(|e| self.sync_error("alloc", e))?;
        Ok(CudaStorage(Arc::new(CudaAlloc {
            elem,
            capacity: len,
            ordinal: self.ordinal,
            data: Mutex::new(data),
            hazards: Mutex::new(Hazards::default()),
        })))
    }

    fn upload(&self, host: &HostData, numel: usize, dst: &CudaStorage) -> Result<()> {
        self.synchronize_storage(dst)?;
        let stream = self.select_stream();
        let mut data = dst.data()?;
        zip_host!(host, &mut *data, (h, d) => {
            let mut view = d.slice_mut(0..numel);
            stream.memcpy_htod(&h[..numel], &mut view).map_err(|e| self.sync_error("upload", e))?;
        }, {
            return Err(CudaError::KindMismatch {
                host: host.kind(),
                device: dst.0.elem,
            }
            .into());
        });
        stream.synchronize().map_err(|e| self.sync_error("upload", e))?;
        *dst.0.hazards.lock()? = Hazards::default();
        Ok(())
    }

    fn download(&self, src: &CudaStorage, numel: usize) -> Result<HostData> {
        let writer = src.0.hazards.lock()?.last_write.clone();
        if let Some(event) = writer {
            event.synchronize().map_err(|e| self.sync_error("download", e))?;
        }
        let stream = self.select_stream();
        let data = src.data()?;
        let host = with_cuda_data!(&*data, s => {
            let view = s.slice(0..numel);
            HostData::from(stream.memcpy_dtov(&view).map_err(|e| self.sync_error("download", e))?)
        });
        Ok(host)
    }

    fn dispatch(&self, launch: Launch<'_, CudaStorage>) -> Result<()> {
        let Launch {
            label,
            op,
            inputs,
            output,
            math,
            ..
        } = launch;
        let n = numel(output.shape);
        if n == 0 {
            return Ok(());
        }
        let grid = launch_config(label, n)?;
        let out_elem = output.storage.elem();
        let in_elem = inputs.first().map(|a| a.storage.elem()).unwrap_or(out_elem);
        let scalars = inputs
            .iter()
            .map(|a| numel(a.shape) == 1 && n != 1)
            .collect::<Vec<_>>();
        let jit = kernel::elementwise(op, in_elem, out_elem, &scalars).ok_or_else(|| {
            Error::device(self.name(), label, format!("{op} has no cuda kernel"))
        })?;
        let func = self.function(&jit, math)?;
        let stream = self.select_stream();

        // Each distinct allocation is locked once; inputs aliasing the output read it.
        let mut distinct: Vec<&CudaStorage> = Vec::new();
        let mut slots = Vec::with_capacity(inputs.len());
        for arg in &inputs {
            if arg.storage.same_allocation(output.storage) {
                slots.push(None);
                continue;
            }
            match distinct.iter().position(|s| s.same_allocation(arg.storage)) {
                Some(i) => slots.push(Some(i)),
                None => {
                    slots.push(Some(distinct.len()));
                    distinct.push(arg.storage);
                }
            }
        }

        let mut deps = Vec::new();
        for s in &distinct {
            deps.extend(s.0.hazards.lock()?.last_write.clone());
        }
        deps.extend(output.storage.pending()?);
        for e in &deps {
            stream.wait(e).map_err(|e| self.sync_error(label, e))?;
        }

        let guards = distinct
            .iter()
            .map(|s| s.data())
            .collect::<Result<Vec<_>>>()?;
        let out = output.storage.data()?;
        let mut builder = stream.launch_builder(&func);
        for slot in &slots {
            let data: &CudaData = match slot {
                Some(i) => &guards[*i],
                None => &out,
            };
            push_arg(&mut builder, data);
        }
        push_arg(&mut builder, &out);
        builder.arg(&n);
        // SAFETY: the kernel reads `numel` elements of each input and writes `numel`
        // elements of `out`; every buffer holds at least that many.
        unsafe { builder.launch(grid) }.map_err(|source| CudaError::Launch {
            label: label.to_string(),
            source,
        })?;

        let event = Arc::new(self.context.new_event(None).w()?);
        event.record(&stream).w()?;
        trace!("{}: launched {label}", self.name());
        for s in &distinct {
            s.0.hazards
                .lock()?
                .add_read(event.clone(), |e| e.is_complete());
        }
        output.storage.0.hazards.lock()?.set_writer(event);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        for stream in self.streams.iter() {
            stream
                .synchronize()
                .map_err(|e| self.sync_error("synchronize", e))?;
        }
        Ok(())
    }

    fn synchronize_storage(&self, storage: &CudaStorage) -> Result<()> {
        for event in storage.pending()? {
            event
                .synchronize()
                .map_err(|e| self.sync_error("synchronize", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, rc::Rc};

    #[test]
    fn finished_reads_are_dropped() {
        let mut h = Hazards::<Rc<Cell<bool>>>::default();
        let done = |e: &Rc<Cell<bool>>| e.get();
        let first = Rc::new(Cell::new(false));
        h.add_read(first.clone(), done);
        // A value read once per call, e.g. a cached constant upload.
        for _ in 0..100 {
            let e = Rc::new(Cell::new(false));
            h.add_read(e.clone(), done);
            e.set(true);
        }
        // The still running first read and the latest one.
        assert_eq!(h.reads.len(), 2);
        assert!(Rc::ptr_eq(&h.reads[0], &first));

        h.set_writer(Rc::new(Cell::new(false)));
        assert!(h.reads.is_empty());
        assert!(h.last_write.is_some());
    }

    #[test]
    fn oversized_launches_are_rejected() {
        assert!(launch_config("exp#n0", 1 << 20).is_ok());
        let n = u32::MAX as usize + 1;
        let err = launch_config("exp#n0", n).unwrap_err();
        assert!(err.is_device_error());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("exp#n0"), "{err}");
    }
}
