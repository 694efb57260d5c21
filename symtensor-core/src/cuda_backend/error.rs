use cudarc::{driver::DriverError, nvrtc::CompileError};

/// Failures of the cuda backend that leave the context usable.
#[derive(thiserror::Error, Debug)]
pub enum CudaError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("cannot load jit module {module}: {source}")]
    ModuleLoad { module: String, source: DriverError },

    #[error("nvrtc rejected {module}: {err}")]
    Compile { module: String, err: CompileError },

    #[error("no cuda toolkit include directory found, set CUDA_PATH")]
    MissingToolkit,

    #[error("out of device memory allocating {len} x {elem}: {source}")]
    OutOfMemory {
        len: usize,
        elem: crate::dtype::ElemKind,
        source: DriverError,
    },

    #[error("{label}: {numel} elements do not fit one launch grid")]
    LaunchTooLarge { label: String, numel: usize },

    #[error("{label}: launch rejected: {source}")]
    Launch { label: String, source: DriverError },

    #[error("cannot copy {host} data into a {device} allocation")]
    KindMismatch {
        host: crate::dtype::ElemKind,
        device: crate::dtype::ElemKind,
    },
}

impl From<CudaError> for crate::Error {
    fn from(val: CudaError) -> Self {
        crate::Error::Cuda(Box::new(val)).bt()
    }
}

/// Convert driver results into crate errors with `.w()`.
pub trait WrapErr<O> {
    fn w(self) -> crate::Result<O>;
}

impl<O, E: Into<CudaError>> WrapErr<O> for std::result::Result<O, E> {
    fn w(self) -> crate::Result<O> {
        self.map_err(|e| Into::<CudaError>::into(e).into())
    }
}
