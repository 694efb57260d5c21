use std::{convert::Infallible, fmt::Display};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Arity, rank or reference errors found while building a graph or a program.
    #[error("graph construction error in {op}: {msg}")]
    GraphConstruction { op: String, msg: String },

    /// Unsupported promotion, or an element kind an operation (or device) does not accept.
    #[error("type error in {op}: {msg}")]
    Type { op: String, msg: String },

    /// No backend can run a live operation under the configured fallback policy.
    #[error("placement error: {op} ({node}) cannot run on {device}: {reason}")]
    Placement {
        node: String,
        op: String,
        device: String,
        reason: String,
    },

    /// Allocation failure, kernel failure or context loss. On asynchronous devices this
    /// surfaces at the next synchronization point, which may be later than the dispatch
    /// that caused it.
    #[error("device error on {device} at {op}: {msg}")]
    Device {
        device: String,
        op: String,
        msg: String,
        fatal: bool,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Runtime shapes that do not agree with the operation.
    #[error("shape error in {op}: {msg}")]
    Shape { op: String, msg: String },

    #[error("invalid call: {0}")]
    InvalidCall(String),

    #[error("borrowed output from call {epoch} was invalidated by call {current}")]
    StaleHandle { epoch: u64, current: u64 },

    #[error("function is unusable after a fatal device error: {0}")]
    FunctionPoisoned(String),

    #[error(transparent)]
    Cuda(Box<dyn std::error::Error + Send + Sync>),

    #[error("Message: {0}")]
    Msg(String),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },

    #[error("IO error: {0}")]
    IoError(String),

    /// Arbitrary errors wrapping.
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),

    /// Arbitrary errors wrapping with context.
    #[error("{wrapped:?}\n{context:?}")]
    WrappedContext {
        wrapped: Box<dyn std::error::Error + Send + Sync>,
        context: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new error based on a printable error message.
    ///
    /// If the message implements `std::error::Error`, prefer using [`Error::wrap`] instead.
    pub fn msg<M: Display>(msg: M) -> Self {
        Self::Msg(msg.to_string()).bt()
    }

    pub fn wrap(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(err)).bt()
    }

    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }

    /// The error without any backtrace wrapper.
    pub fn root(&self) -> &Self {
        match self {
            Self::WithBacktrace { inner, .. } => inner.root(),
            other => other,
        }
    }

    pub(crate) fn construction(op: impl Display, msg: impl Display) -> Self {
        Self::GraphConstruction {
            op: op.to_string(),
            msg: msg.to_string(),
        }
    }

    pub(crate) fn type_error(op: impl Display, msg: impl Display) -> Self {
        Self::Type {
            op: op.to_string(),
            msg: msg.to_string(),
        }
    }

    pub(crate) fn shape(op: impl Display, msg: impl Display) -> Self {
        Self::Shape {
            op: op.to_string(),
            msg: msg.to_string(),
        }
    }

    pub(crate) fn device(device: impl Display, op: impl Display, msg: impl Display) -> Self {
        Self::Device {
            device: device.to_string(),
            op: op.to_string(),
            msg: msg.to_string(),
            fatal: false,
        }
    }

    pub(crate) fn context_lost(device: impl Display, op: impl Display) -> Self {
        Self::Device {
            device: device.to_string(),
            op: op.to_string(),
            msg: "device context lost".to_string(),
            fatal: true,
        }
    }

    pub fn is_device_error(&self) -> bool {
        matches!(self.root(), Self::Device { .. } | Self::Cuda(_))
    }

    /// Device errors after which the device can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), Self::Device { fatal: true, .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::IoError(value.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(value: std::sync::PoisonError<T>) -> Self {
        Error::Msg(format!("lock poisoned: {value}")).bt()
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg).into()).bt())
    };
    ($err:expr $(,)?) => {
        return Err($crate::Error::Msg(format!($err).into()).bt())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*).into()).bt())
    };
}

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for std::result::Result<T, E> where E: std::error::Error {}
    impl<T> Sealed for Option<T> {}
}

/// Attach more context to an error.
///
/// Inspired by [`anyhow::Context`].
pub trait Context<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily
    /// only once an error does occur.
    fn with_context<C, F>(self, f: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        // Not using map_err to save 2 useless frames off the captured backtrace
        // in ext_context.
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context.to_string(),
            }),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context().to_string(),
            }),
        }
    }
}

impl<T> Context<T, Infallible> for Option<T> {
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        // Not using ok_or_else to save 2 useless frames off the captured
        // backtrace.
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context)),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context())),
        }
    }
}
