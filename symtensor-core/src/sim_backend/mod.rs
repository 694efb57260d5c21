//! A simulated asynchronous accelerator.
//!
//! Device memory is separate from host memory and only reachable through
//! [`BackendDevice::upload`] and [`BackendDevice::download`]. Launches are queued on a
//! small pool of worker threads ("lanes", the analogue of streams) and return
//! immediately. Each allocation records its last writer and outstanding readers, and a
//! launch waits on those events before running, so lanes complete out of order while
//! data dependencies hold. Failures are captured in the launch's event and reported
//! at the next synchronization.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
};

use log::{debug, trace};

use crate::{
    capability::CapabilityTable,
    dtype::{ElemKind, HostData},
    graph::OpKind,
    kernels::{KernelArgs, KernelFn, MathMode, Operand},
    storage::{BackendDevice, BackendStorage, Launch},
    types::Location,
    Error, Result,
};

mod event;

use event::{Event, Failure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The launch fails; the device stays usable.
    KernelFailure,
    /// The launch fails and the device is lost for good.
    ContextLoss,
}

/// Inject a failure into the `launch`-th kernel launch (counting from 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultPlan {
    pub kind: FaultKind,
    pub launch: usize,
}

impl FaultPlan {
    pub fn kernel_failure(launch: usize) -> Self {
        Self {
            kind: FaultKind::KernelFailure,
            launch,
        }
    }

    pub fn context_loss(launch: usize) -> Self {
        Self {
            kind: FaultKind::ContextLoss,
            launch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Number of worker lanes.
    pub lanes: usize,
    /// Device memory capacity in bytes.
    pub memory_limit: Option<usize>,
    pub fault: Option<FaultPlan>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            lanes: num_cpus::get().clamp(1, 4),
            memory_limit: None,
            fault: None,
        }
    }
}

/// State shared by the device handle, its allocations and running launches.
#[derive(Debug)]
struct SimShared {
    ordinal: usize,
    name: String,
    lost: AtomicBool,
    in_use: AtomicUsize,
}

impl SimShared {
    fn failure(&self, f: Failure) -> Error {
        Error::Device {
            device: self.name.clone(),
            op: f.label,
            msg: f.msg,
            fatal: f.fatal,
        }
    }

    fn check_alive(&self, op: &str) -> Result<()> {
        if self.lost.load(Ordering::SeqCst) {
            Err(Error::context_lost(&self.name, op))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct Hazards {
    last_write: Option<Event>,
    reads: Vec<Event>,
}

struct SimAlloc {
    elem: ElemKind,
    capacity: usize,
    data: RwLock<HostData>,
    hazards: Mutex<Hazards>,
    shared: Arc<SimShared>,
}

impl Drop for SimAlloc {
    fn drop(&mut self) {
        let bytes = self.capacity * self.elem.size_in_bytes();
        self.shared.in_use.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Device memory of the simulated accelerator.
#[derive(Clone)]
pub struct SimStorage(Arc<SimAlloc>);

impl std::fmt::Debug for SimStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimStorage")
            .field("device", &self.0.shared.name)
            .field("elem", &self.0.elem)
            .field("capacity", &self.0.capacity)
            .finish()
    }
}

impl SimStorage {
    pub(crate) fn same_allocation(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Every event touching this allocation.
    fn pending(&self) -> Result<Vec<Event>> {
        let h = self.0.hazards.lock()?;
        Ok(h.last_write.iter().chain(&h.reads).cloned().collect())
    }
}

impl BackendStorage for SimStorage {
    fn elem(&self) -> ElemKind {
        self.0.elem
    }

    fn capacity(&self) -> usize {
        self.0.capacity
    }

    fn location(&self) -> Location {
        Location::Device(self.0.shared.ordinal)
    }
}

type Job = Box<dyn FnOnce() + Send>;

struct Lane {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

struct SimInner {
    ordinal: usize,
    config: SimConfig,
    shared: Arc<SimShared>,
    lanes: Vec<Lane>,
    next_lane: AtomicUsize,
    launches: AtomicUsize,
    /// Launches whose outcome was not observed by a synchronization yet.
    pending: Mutex<Vec<Event>>,
}

impl Drop for SimInner {
    fn drop(&mut self) {
        for lane in &mut self.lanes {
            lane.tx.take();
        }
        for lane in &mut self.lanes {
            if let Some(handle) = lane.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[derive(Clone)]
pub struct SimDevice {
    inner: Arc<SimInner>,
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDevice")
            .field("ordinal", &self.inner.ordinal)
            .field("lanes", &self.inner.lanes.len())
            .finish()
    }
}

impl SimDevice {
    pub fn new(ordinal: usize, config: &SimConfig) -> Result<Self> {
        let name = format!("sim:{ordinal}");
        let lanes = (0..config.lanes.max(1))
            .map(|i| -> Result<Lane> {
                let (tx, rx) = mpsc::channel::<Job>();
                let handle = std::thread::Builder::new()
                    .name(format!("{name}-lane{i}"))
                    .spawn(move || {
                        for job in rx {
                            job();
                        }
                    })?;
                Ok(Lane {
                    tx: Some(tx),
                    handle: Some(handle),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("{name}: {} lanes, memory limit {:?}", lanes.len(), config.memory_limit);
        Ok(Self {
            inner: Arc::new(SimInner {
                ordinal,
                config: config.clone(),
                shared: Arc::new(SimShared {
                    ordinal,
                    name,
                    lost: AtomicBool::new(false),
                    in_use: AtomicUsize::new(0),
                }),
                lanes,
                next_lane: AtomicUsize::new(0),
                launches: AtomicUsize::new(0),
                pending: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn ordinal(&self) -> usize {
        self.inner.ordinal
    }

    /// Bytes of device memory currently allocated.
    pub fn memory_in_use(&self) -> usize {
        self.inner.shared.in_use.load(Ordering::SeqCst)
    }

    /// Number of kernel launches so far.
    pub fn launches(&self) -> usize {
        self.inner.launches.load(Ordering::SeqCst)
    }

    pub fn is_lost(&self) -> bool {
        self.inner.shared.lost.load(Ordering::SeqCst)
    }

    fn wait_all(&self, events: Vec<Event>) -> Result<()> {
        let mut first = None;
        for e in events {
            if let Err(f) = e.wait() {
                first.get_or_insert(f);
            }
        }
        match first {
            Some(f) => Err(self.inner.shared.failure(f)),
            None => Ok(()),
        }
    }
}

impl BackendDevice for SimDevice {
    type Storage = SimStorage;

    fn location(&self) -> Location {
        Location::Device(self.inner.ordinal)
    }

    fn name(&self) -> String {
        self.inner.shared.name.clone()
    }

    fn capabilities(&self) -> CapabilityTable {
        CapabilityTable::sim(self.inner.ordinal)
    }

    fn alloc(&self, elem: ElemKind, len: usize) -> Result<SimStorage> {
        let shared = &self.inner.shared;
        shared.check_alive("alloc")?;
        let bytes = len * elem.size_in_bytes();
        if let Some(limit) = self.inner.config.memory_limit {
            let used = shared.in_use.load(Ordering::SeqCst);
            if used + bytes > limit {
                return Err(Error::device(
                    &shared.name,
                    "alloc",
                    format!("out of memory: {bytes} bytes requested, {used} of {limit} in use"),
                ));
            }
        }
        shared.in_use.fetch_add(bytes, Ordering::SeqCst);
        Ok(SimStorage(Arc::new(SimAlloc {
            elem,
            capacity: len,
            data: RwLock::new(HostData::zeros(elem, len)),
            hazards: Mutex::new(Hazards::default()),
            shared: shared.clone(),
        })))
    }

    fn upload(&self, host: &HostData, numel: usize, dst: &SimStorage) -> Result<()> {
        self.inner.shared.check_alive("upload")?;
        // Outcomes of earlier users do not matter: the data is replaced.
        for e in dst.pending()? {
            let _ = e.wait();
        }
        dst.0.data.write()?.copy_prefix_from(host, numel)?;
        let mut h = dst.0.hazards.lock()?;
        h.last_write = None;
        h.reads.clear();
        Ok(())
    }

    fn download(&self, src: &SimStorage, numel: usize) -> Result<HostData> {
        let shared = &self.inner.shared;
        shared.check_alive("download")?;
        let writer = src.0.hazards.lock()?.last_write.clone();
        if let Some(Err(f)) = writer.map(|e| e.wait()) {
            return Err(shared.failure(f));
        }
        let data = src.0.data.read()?.prefix(numel)?;
        Ok(data)
    }

    fn dispatch(&self, launch: Launch<'_, SimStorage>) -> Result<()> {
        let Launch {
            label,
            op,
            inputs,
            output,
            kernel,
            math,
        } = launch;
        let shared = &self.inner.shared;
        shared.check_alive(label)?;
        let kernel = kernel
            .ok_or_else(|| Error::device(&shared.name, label, "no kernel is bound"))?;
        let n = self.inner.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let fault = self
            .inner
            .config
            .fault
            .filter(|f| f.launch == n)
            .map(|f| f.kind);

        let event = Event::new();
        let out = output.storage.0.clone();
        let mut deps = Vec::new();
        let mut reads = Vec::with_capacity(inputs.len());
        for arg in &inputs {
            if Arc::ptr_eq(&arg.storage.0, &out) {
                reads.push(None);
                continue;
            }
            let mut h = arg.storage.0.hazards.lock()?;
            deps.extend(h.last_write.clone());
            h.reads.retain(|e| !e.is_done());
            h.reads.push(event.clone());
            reads.push(Some(arg.storage.0.clone()));
        }
        {
            let mut h = out.hazards.lock()?;
            deps.extend(h.last_write.replace(event.clone()));
            deps.append(&mut h.reads);
        }

        let job = SimJob {
            label: label.to_string(),
            op: op.clone(),
            kernel,
            deps,
            reads,
            shapes: inputs.iter().map(|a| a.shape.to_vec()).collect(),
            out,
            out_shape: output.shape.to_vec(),
            math,
            fault,
            shared: shared.clone(),
        };
        {
            let mut pending = self.inner.pending.lock()?;
            pending.retain(|e| !e.succeeded());
            pending.push(event.clone());
        }
        let lane = self.inner.next_lane.fetch_add(1, Ordering::SeqCst) % self.inner.lanes.len();
        trace!("{}: launch {n} {label} on lane {lane}", shared.name);
        let sent = self.inner.lanes[lane]
            .tx
            .as_ref()
            .map(|tx| tx.send(Box::new(move || event.complete(job.run()))));
        match sent {
            Some(Ok(())) => Ok(()),
            _ => Err(Error::device(&shared.name, label, "lane is not running")),
        }
    }

    fn synchronize(&self) -> Result<()> {
        let events = std::mem::take(&mut *self.inner.pending.lock()?);
        self.wait_all(events)?;
        self.inner.shared.check_alive("synchronize")
    }

    fn synchronize_storage(&self, storage: &SimStorage) -> Result<()> {
        self.wait_all(storage.pending()?)
    }
}

/// A launch as it runs on a lane.
struct SimJob {
    label: String,
    op: OpKind,
    kernel: KernelFn,
    deps: Vec<Event>,
    /// `None` when the input is the output allocation itself.
    reads: Vec<Option<Arc<SimAlloc>>>,
    shapes: Vec<Vec<usize>>,
    out: Arc<SimAlloc>,
    out_shape: Vec<usize>,
    math: MathMode,
    fault: Option<FaultKind>,
    shared: Arc<SimShared>,
}

impl SimJob {
    fn fail(&self, msg: impl Into<String>, fatal: bool) -> Failure {
        Failure {
            label: self.label.clone(),
            msg: msg.into(),
            fatal,
        }
    }

    fn run(self) -> std::result::Result<(), Failure> {
        for dep in &self.deps {
            dep.wait()?;
        }
        match self.fault {
            Some(FaultKind::KernelFailure) => return Err(self.fail("injected kernel failure", false)),
            Some(FaultKind::ContextLoss) => {
                self.shared.lost.store(true, Ordering::SeqCst);
                return Err(self.fail("device context lost", true));
            }
            None => {}
        }
        if self.shared.lost.load(Ordering::SeqCst) {
            return Err(self.fail("device context lost", true));
        }
        match catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(outcome) => outcome,
            Err(_) => Err(self.fail("kernel panicked", false)),
        }
    }

    fn execute(&self) -> std::result::Result<(), Failure> {
        let poisoned = |_| self.fail("allocation lock poisoned", false);
        let guards = self
            .reads
            .iter()
            .map(|r| r.as_ref().map(|a| a.data.read()).transpose())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(poisoned)?;
        let operands = guards
            .iter()
            .map(|g| match g {
                Some(data) => Operand::In(&**data),
                None => Operand::Out,
            })
            .collect::<Vec<_>>();
        let mut out = self.out.data.write().map_err(|_| self.fail("allocation lock poisoned", false))?;
        (self.kernel)(
            &self.op,
            KernelArgs {
                inputs: &operands,
                shapes: &self.shapes,
                out: &mut *out,
                out_shape: &self.out_shape,
                math: self.math,
            },
        )
        .map_err(|e| self.fail(e.to_string(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{BinaryOpType, UnaryOpType},
        kernels::KernelRegistry,
        storage::LaunchArg,
    };

    fn launch(
        dev: &SimDevice,
        op: OpKind,
        inputs: &[&SimStorage],
        out: &SimStorage,
        shape: &[usize],
    ) -> Result<()> {
        dev.dispatch(Launch {
            label: op.name(),
            op: &op,
            inputs: inputs
                .iter()
                .map(|s| LaunchArg { storage: *s, shape })
                .collect(),
            output: LaunchArg {
                storage: out,
                shape,
            },
            kernel: KernelRegistry::host().get(op.class()),
            math: MathMode::default(),
        })
    }

    #[test]
    fn dependent_launches_across_lanes() {
        let dev = SimDevice::new(
            0,
            &SimConfig {
                lanes: 3,
                ..Default::default()
            },
        )
        .unwrap();
        let n = 10_000;
        let x = dev.alloc(ElemKind::F32, n).unwrap();
        let y = dev.alloc(ElemKind::F32, n).unwrap();
        dev.upload(&HostData::from(vec![1f32; n]), n, &x).unwrap();
        // x = x + x, repeated: every launch depends on the previous one.
        for _ in 0..6 {
            launch(&dev, OpKind::Binary(BinaryOpType::Add), &[&x, &x], &x, &[n]).unwrap();
        }
        launch(&dev, OpKind::Unary(UnaryOpType::Neg), &[&x], &y, &[n]).unwrap();
        let out = dev.download(&y, n).unwrap();
        assert_eq!(out, HostData::F32(vec![-64.0; n]));
        dev.synchronize().unwrap();
    }

    #[test]
    fn deferred_failure_and_memory_limit() {
        let dev = SimDevice::new(
            0,
            &SimConfig {
                lanes: 2,
                memory_limit: Some(64),
                fault: Some(FaultPlan::kernel_failure(1)),
            },
        )
        .unwrap();
        let x = dev.alloc(ElemKind::F32, 8).unwrap();
        let y = dev.alloc(ElemKind::F32, 8).unwrap();
        assert_eq!(dev.memory_in_use(), 64);
        let err = dev.alloc(ElemKind::U8, 1).unwrap_err();
        assert!(err.is_device_error() && !err.is_fatal());
        // The dispatch itself succeeds; the failure shows up at synchronization.
        launch(&dev, OpKind::Unary(UnaryOpType::Neg), &[&x], &y, &[8]).unwrap();
        let err = dev.synchronize().unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("neg"));
        dev.synchronize().unwrap();
        drop(y);
        assert_eq!(dev.memory_in_use(), 32);
    }

    #[test]
    fn context_loss_is_fatal() {
        let dev = SimDevice::new(
            0,
            &SimConfig {
                lanes: 1,
                memory_limit: None,
                fault: Some(FaultPlan::context_loss(1)),
            },
        )
        .unwrap();
        let x = dev.alloc(ElemKind::I32, 4).unwrap();
        launch(&dev, OpKind::Unary(UnaryOpType::Abs), &[&x], &x, &[4]).unwrap();
        assert!(dev.synchronize().unwrap_err().is_fatal());
        assert!(dev.is_lost());
        assert!(dev.alloc(ElemKind::I32, 4).unwrap_err().is_fatal());
    }
}
