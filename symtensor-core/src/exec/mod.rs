//! Running compiled programs.
//!
//! A [`Function`] walks its schedule once per call on the calling thread. Host thunks
//! run to completion before the next one is dispatched; accelerator thunks are
//! enqueued and only waited on at transfers, buffer releases and when results are
//! handed back.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use log::{debug, trace};

use crate::{
    context::ExecutionContext,
    cpu_storage::CpuStorage,
    device::DeviceLaunch,
    graph::{Program, VarId},
    memory::{Buffer, MemoryManager, MemoryMetrics},
    optimizer::PipelineReport,
    shape::numel,
    storage::Storage,
    tensor::Tensor,
    Error, Result,
};

mod output;
mod schedule;

pub use output::{BorrowedTensor, Output};
pub(crate) use schedule::Schedule;
pub use schedule::ThunkInfo;

use output::materialize;
use schedule::{Operand, Thunk};

/// Where a call is. Observable between calls through [`Function::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Dispatching,
    Syncing,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallOptions {
    /// Return handles to the function's own storage instead of host copies.
    pub borrow_outputs: bool,
}

impl CallOptions {
    pub fn borrowed() -> Self {
        Self {
            borrow_outputs: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecStats {
    pub calls: usize,
    /// Kernels handed to a device.
    pub dispatches: usize,
    pub transfers: usize,
    /// Points where the dispatching thread waited on a device.
    pub sync_points: usize,
    pub memory: MemoryMetrics,
}

/// A compiled program, callable repeatedly.
pub struct Function {
    schedule: Arc<Schedule>,
    ctx: ExecutionContext,
    memory: MemoryManager,
    /// Runtime shape of every variable in the current call.
    shapes: Vec<Option<Vec<usize>>>,
    state: CallState,
    epoch: Arc<AtomicU64>,
    poisoned: Option<String>,
    stats: ExecStats,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("device", &self.ctx.target_name())
            .field("thunks", &self.schedule.thunks().len())
            .field("state", &self.state)
            .finish()
    }
}

impl Function {
    pub(crate) fn new(schedule: Schedule, ctx: ExecutionContext) -> Self {
        Self::with_schedule(Arc::new(schedule), ctx)
    }

    fn with_schedule(schedule: Arc<Schedule>, ctx: ExecutionContext) -> Self {
        let memory = MemoryManager::new(
            schedule.static_reads.clone(),
            schedule.pinned.clone(),
            ctx.config().garbage_collection,
        );
        Self {
            shapes: vec![None; schedule.program.graph().vars().len()],
            schedule,
            ctx,
            memory,
            state: CallState::Idle,
            epoch: Arc::new(AtomicU64::new(0)),
            poisoned: None,
            stats: ExecStats::default(),
        }
    }

    /// Run with host inputs and return host outputs.
    pub fn call(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        self.call_with(inputs, CallOptions::default())?
            .iter()
            .map(Output::to_host)
            .collect()
    }

    pub fn call_with(&mut self, inputs: &[Tensor], options: CallOptions) -> Result<Vec<Output>> {
        if let Some(reason) = &self.poisoned {
            return Err(Error::FunctionPoisoned(reason.clone()));
        }
        self.check_inputs(inputs)?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        match self.run(inputs, options, epoch) {
            Ok(outputs) => Ok(outputs),
            Err(e) => {
                debug!("call {epoch} failed: {e}");
                self.memory.reset();
                let drained = self.ctx.synchronize();
                let fatal = e.is_fatal() || drained.as_ref().is_err_and(Error::is_fatal);
                if fatal {
                    self.poisoned = Some(e.to_string());
                }
                self.transition(CallState::Idle);
                Err(e)
            }
        }
    }

    fn check_inputs(&self, inputs: &[Tensor]) -> Result<()> {
        let expected = &self.schedule.inputs;
        if inputs.len() != expected.len() {
            return Err(Error::InvalidCall(format!(
                "expected {} inputs, got {}",
                expected.len(),
                inputs.len()
            )));
        }
        for (i, (t, (_, ty))) in inputs.iter().zip(expected).enumerate() {
            if t.elem() != ty.elem {
                return Err(Error::InvalidCall(format!(
                    "input {i} must be {}, got {}",
                    ty.elem,
                    t.elem()
                )));
            }
            if t.rank() != ty.rank {
                return Err(Error::InvalidCall(format!(
                    "input {i} must have rank {}, got shape {:?}",
                    ty.rank,
                    t.shape()
                )));
            }
        }
        Ok(())
    }

    fn transition(&mut self, state: CallState) {
        trace!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn run(&mut self, inputs: &[Tensor], options: CallOptions, epoch: u64) -> Result<Vec<Output>> {
        let schedule = self.schedule.clone();
        self.transition(CallState::Dispatching);
        self.stats.calls += 1;
        self.memory.begin_call();
        self.shapes.iter_mut().for_each(|s| *s = None);

        for ((operand, _), t) in schedule.inputs.iter().zip(inputs) {
            self.bind(*operand, t);
        }
        for (operand, t) in &schedule.constants {
            self.bind(*operand, t);
        }
        for (operand, value) in &schedule.shared {
            self.bind(*operand, &value.get()?);
        }

        for thunk in schedule.thunks() {
            self.execute(thunk)?;
        }

        let syncs = !options.borrow_outputs || !schedule.updates.is_empty();
        if syncs {
            self.transition(CallState::Syncing);
        }
        let mut outputs = Vec::with_capacity(schedule.outputs.len());
        for operand in &schedule.outputs {
            let buffer = self.memory.get(operand.slot)?;
            let shape = self.shape(operand.var)?.to_vec();
            let output = if options.borrow_outputs {
                let device = self.ctx.device(buffer.location())?.clone();
                Output::Borrowed(BorrowedTensor::new(
                    buffer,
                    shape,
                    device,
                    epoch,
                    self.epoch.clone(),
                ))
            } else {
                Output::Host(self.to_host(&buffer, &shape)?)
            };
            outputs.push(output);
        }

        // Every new value is read before the first one is written.
        let mut values = Vec::with_capacity(schedule.updates.len());
        for (target, operand) in &schedule.updates {
            let buffer = self.memory.get(operand.slot)?;
            let shape = self.shape(operand.var)?.to_vec();
            values.push((target, self.to_host(&buffer, &shape)?));
        }
        for (target, value) in values {
            target.set(value)?;
        }

        self.memory.finish_call();
        self.transition(CallState::Complete);
        Ok(outputs)
    }

    /// Bind caller-owned host data to a slot without copying it.
    fn bind(&mut self, operand: Operand, t: &Tensor) {
        let storage = Storage::Cpu(CpuStorage::borrowed(t.shared_data().clone()));
        self.memory.bind(operand.slot, Arc::new(Buffer::borrowed(storage)));
        self.shapes[operand.var.0] = Some(t.shape().to_vec());
    }

    fn shape(&self, v: VarId) -> Result<&[usize]> {
        self.shapes[v.0]
            .as_deref()
            .ok_or_else(|| Error::msg(format!("{v} has not been computed")))
    }

    fn to_host(&mut self, buffer: &Buffer, shape: &[usize]) -> Result<Tensor> {
        if !buffer.location().is_host() {
            self.stats.sync_points += 1;
        }
        materialize(self.ctx.device(buffer.location())?, buffer.storage(), shape)
    }

    fn execute(&mut self, thunk: &Thunk) -> Result<()> {
        let shapes = thunk
            .inputs
            .iter()
            .map(|o| self.shape(o.var).map(<[usize]>::to_vec))
            .collect::<Result<Vec<_>>>()?;
        let shape = thunk
            .op
            .output_shape(&shapes.iter().map(Vec::as_slice).collect::<Vec<_>>())?;
        trace!("{} on {}: {:?} -> {:?}", thunk.label, thunk.location, shapes, shape);

        if thunk.op.is_transfer() {
            self.transfer(thunk, &shape)?;
        } else {
            self.launch(thunk, &shapes, &shape)?;
        }
        self.shapes[thunk.output.var.0] = Some(shape);

        for o in &thunk.inputs {
            if self.memory.release(o.slot, &self.ctx)? {
                self.stats.sync_points += 1;
            }
        }
        if self.memory.remaining(thunk.output.slot) == 0
            && self.memory.free(thunk.output.slot, &self.ctx)?
        {
            self.stats.sync_points += 1;
        }
        Ok(())
    }

    fn launch(&mut self, thunk: &Thunk, shapes: &[Vec<usize>], shape: &[usize]) -> Result<()> {
        let device = self.ctx.device(thunk.location)?;
        let (overwritten, output) = match thunk.inplace {
            Some(i) => {
                let slot = thunk.inputs[i].slot;
                let (input, output) =
                    self.memory
                        .acquire_inplace(slot, device, thunk.elem, shape)?;
                (Some((slot, input)), output)
            }
            None => (
                None,
                self.memory
                    .acquire(thunk.output.slot, device, thunk.elem, shape)?,
            ),
        };
        let buffers = thunk
            .inputs
            .iter()
            .map(|o| match &overwritten {
                Some((slot, input)) if *slot == o.slot => Ok(input.clone()),
                _ => self.memory.get(o.slot),
            })
            .collect::<Result<Vec<_>>>()?;
        device.dispatch(DeviceLaunch {
            label: &thunk.label,
            op: &thunk.op,
            inputs: buffers
                .iter()
                .zip(shapes)
                .map(|(b, s)| (b.storage(), s.as_slice()))
                .collect(),
            output: (output.storage(), shape),
            kernel: thunk.kernel,
            math: thunk.math,
        })?;
        self.stats.dispatches += 1;
        Ok(())
    }

    fn transfer(&mut self, thunk: &Thunk, shape: &[usize]) -> Result<()> {
        if thunk.cached && self.memory.has(thunk.output.slot) {
            trace!("{}: constant already uploaded", thunk.label);
            return Ok(());
        }
        let n = numel(shape);
        let src = self.memory.get(thunk.inputs[0].slot)?;
        let device = self.ctx.device(thunk.location)?;
        let dst = self
            .memory
            .acquire(thunk.output.slot, device, thunk.elem, shape)?;
        match src.storage() {
            Storage::Cpu(host) => host.with_data(|data| device.upload(data, n, dst.storage()))??,
            other => {
                let data = self.ctx.device(other.location())?.download(other, n)?;
                device.upload(&data, n, dst.storage())?;
            }
        }
        self.stats.transfers += 1;
        self.stats.sync_points += 1;
        Ok(())
    }

    /// Wait for all outstanding device work, surfacing deferred failures.
    pub fn synchronize(&mut self) -> Result<()> {
        self.stats.sync_points += 1;
        self.ctx.synchronize().inspect_err(|e| {
            if e.is_fatal() {
                self.poisoned = Some(e.to_string());
            }
        })
    }

    /// A new instance with its own storage, sharing the compiled schedule.
    pub fn fork(&self) -> Function {
        Self::with_schedule(self.schedule.clone(), self.ctx.clone())
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn stats(&self) -> ExecStats {
        ExecStats {
            memory: self.memory.metrics(),
            ..self.stats
        }
    }

    pub fn thunks(&self) -> Vec<ThunkInfo> {
        self.schedule.thunks().iter().map(ThunkInfo::from).collect()
    }

    /// The optimized program this function runs.
    pub fn program(&self) -> &Program {
        &self.schedule.program
    }

    pub fn report(&self) -> &PipelineReport {
        &self.schedule.report
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn to_dot(&self) -> String {
        self.schedule.program.graph().to_dot()
    }

    #[cfg(test)]
    pub(crate) fn schedule(&self) -> &Schedule {
        &self.schedule
    }
}
