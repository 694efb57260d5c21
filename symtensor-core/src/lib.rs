//! Symtensor compiles symbolic tensor expressions into functions that run on the host or on
//! an accelerator.
//!
//! Work is recorded into a [`Graph`] of typed variables. Nothing is computed while the
//! graph is built: element kinds and ranks are checked, and mixed kinds get explicit casts.
//! Compiling picks a device, runs the optimizer and produces a [`Function`] that can be
//! called any number of times.
//!
//! ## A quick guide
//! - Create a [`Graph`] and declare inputs with [`Graph::input`], constants with
//!   [`Graph::constant`] and persistent state with [`Graph::shared`].
//! - Build the expression with the op methods ([`Graph::add`], [`Graph::exp`],
//!   [`Graph::matmul`], ...) or generically with [`Graph::apply`].
//! - Compile with [`Graph::compile`], passing a [`CompileConfig`]. The configuration
//!   chooses the device, the default float kind, garbage collection, the fallback policy
//!   when the accelerator cannot run an op, relaxed math and the passes to skip.
//! - Call the resulting [`Function`] with host [`Tensor`]s.
//!
//! The optimizer runs canonicalization, placement, transfer elimination, fusion, in-place
//! marking and dead-code elimination, in that order (see [`optimizer`]).
//!
//! ## What can you do with it?
//! ```
//! use symtensor_core::{CompileConfig, ElemKind, Graph, Tensor};
//!
//! let mut graph = Graph::new();
//! let x = graph.input(ElemKind::F32, 1);
//! let two = graph.scalar(2f32);
//! let y = graph.mul(x, two).unwrap();
//! let z = graph.exp(y).unwrap();
//!
//! let mut f = graph.compile(&[x], &[z], &[], &CompileConfig::host()).unwrap();
//! let out = f.call(&[Tensor::vector(vec![0f32, 0.5])]).unwrap();
//!
//! let values = out[0].to_vec::<f32>().unwrap();
//! assert!((values[0] - 1.0).abs() < 1e-6);
//! assert!((values[1] - 1f32.exp()).abs() < 1e-5);
//! ```

mod capability;
mod config;
mod context;
mod cpu_storage;
#[cfg(feature = "cuda")]
mod cuda_backend;
mod device;
mod dtype;
mod error;
mod exec;
mod graph;
mod kernels;
mod memory;
pub mod optimizer;
mod shape;
mod sim_backend;
mod storage;
mod tensor;
mod types;

pub use capability::{Capability, CapabilityTable, ElemSet, ExecMode, Support};
pub use config::{CompileConfig, FallbackPolicy, RelaxedMath, FLAGS_ENV};
pub use context::{ContextBuilder, ExecutionContext};
pub use device::{AcceleratorLease, Device, DeviceSpec};
pub use dtype::{DType, DTypeOps, ElemKind, HostData};
pub use error::{Context, Error, Result};
pub use exec::{
    BorrowedTensor, CallOptions, CallState, ExecStats, Function, Output, ThunkInfo,
};
pub use graph::{
    BinaryOpType, FusedExpr, FusedInstr, Graph, Node, NodeId, OpClass, OpKind, PersistentVar,
    Program, ReduceOpType, SharedValue, UnaryOpType, VarId, VarOrigin, Variable,
};
pub use kernels::{KernelArgs, KernelFn, KernelRegistry, MathMode, Operand};
pub use memory::{Buffer, MemoryMetrics};
pub use sim_backend::{FaultKind, FaultPlan, SimConfig};
pub use storage::Storage;
pub use tensor::Tensor;
pub use types::{promote, DeviceAffinity, Location, Type};
