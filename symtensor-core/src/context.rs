use std::sync::Arc;

use log::debug;

use crate::{
    capability::CapabilityTable,
    config::CompileConfig,
    device::{AcceleratorLease, Device},
    kernels::{KernelRegistry, MathMode},
    types::Location,
    Error, Result,
};

#[derive(Debug)]
struct ContextInner {
    config: CompileConfig,
    host: Device,
    accel: Option<Device>,
    host_caps: CapabilityTable,
    accel_caps: Option<CapabilityTable>,
    kernels: KernelRegistry,
    // Dropped after the device it guards.
    _lease: Option<AcceleratorLease>,
}

/// The devices, capability tables and kernels one compilation targets. Cheap to clone;
/// every function compiled against a context keeps it alive.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

/// Build a context with custom kernels or capability tables.
pub struct ContextBuilder {
    config: CompileConfig,
    kernels: KernelRegistry,
    accel_caps: Option<CapabilityTable>,
    host_caps: Option<CapabilityTable>,
}

impl ContextBuilder {
    pub fn with_kernels(mut self, kernels: KernelRegistry) -> Self {
        self.kernels = kernels;
        self
    }

    /// Replace the capability table of the device at `table.location()`.
    pub fn with_capabilities(mut self, table: CapabilityTable) -> Self {
        if table.location().is_host() {
            self.host_caps = Some(table);
        } else {
            self.accel_caps = Some(table);
        }
        self
    }

    pub fn build(self) -> Result<ExecutionContext> {
        let config = self.config;
        let lease = config
            .device
            .ordinal()
            .map(AcceleratorLease::acquire)
            .transpose()?;
        let accel = match config.device.ordinal() {
            Some(_) => Some(Device::open(config.device, &config.sim)?),
            None => None,
        };
        let accel_caps = match (&accel, self.accel_caps) {
            (Some(dev), Some(table)) if table.location() == dev.location() => Some(table),
            (Some(dev), Some(table)) => {
                return Err(Error::Configuration(format!(
                    "capability table for {} does not match {}",
                    table.location(),
                    dev.name()
                )))
            }
            (Some(dev), None) => Some(dev.capabilities()),
            (None, Some(table)) => {
                return Err(Error::Configuration(format!(
                    "capability table for {} given but no accelerator is targeted",
                    table.location()
                )))
            }
            (None, None) => None,
        };
        let host = Device::host();
        debug!(
            "execution context: target {}",
            accel.as_ref().map(|d| d.name()).unwrap_or_else(|| host.name())
        );
        Ok(ExecutionContext {
            inner: Arc::new(ContextInner {
                host_caps: self.host_caps.unwrap_or_else(|| host.capabilities()),
                host,
                accel,
                accel_caps,
                kernels: self.kernels,
                config,
                _lease: lease,
            }),
        })
    }
}

impl ExecutionContext {
    /// Open the device `config` targets.
    pub fn new(config: &CompileConfig) -> Result<Self> {
        Self::builder(config.clone()).build()
    }

    pub fn builder(config: CompileConfig) -> ContextBuilder {
        ContextBuilder {
            config,
            kernels: KernelRegistry::host(),
            accel_caps: None,
            host_caps: None,
        }
    }

    pub fn config(&self) -> &CompileConfig {
        &self.inner.config
    }

    /// Where placement prefers to run work.
    pub fn target(&self) -> Location {
        self.target_device().location()
    }

    pub fn target_name(&self) -> String {
        self.target_device().name()
    }

    pub fn target_device(&self) -> &Device {
        self.inner.accel.as_ref().unwrap_or(&self.inner.host)
    }

    pub fn host(&self) -> &Device {
        &self.inner.host
    }

    pub fn accelerator(&self) -> Option<&Device> {
        self.inner.accel.as_ref()
    }

    pub fn device(&self, loc: Location) -> Result<&Device> {
        match loc {
            Location::Host => Ok(&self.inner.host),
            Location::Device(_) => self
                .inner
                .accel
                .as_ref()
                .filter(|d| d.location() == loc)
                .ok_or_else(|| Error::Configuration(format!("{loc} is not part of this context"))),
        }
    }

    pub fn capabilities(&self, loc: Location) -> Result<&CapabilityTable> {
        match loc {
            Location::Host => Ok(&self.inner.host_caps),
            Location::Device(_) => self
                .inner
                .accel_caps
                .as_ref()
                .filter(|t| t.location() == loc)
                .ok_or_else(|| Error::Configuration(format!("{loc} is not part of this context"))),
        }
    }

    pub fn target_capabilities(&self) -> &CapabilityTable {
        self.inner
            .accel_caps
            .as_ref()
            .unwrap_or(&self.inner.host_caps)
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.inner.kernels
    }

    /// Kernel math options for work at `loc`.
    pub fn math_mode(&self, loc: Location) -> Result<MathMode> {
        Ok(self.device(loc)?.math_mode(self.inner.config.math_mode()))
    }

    /// Wait for all outstanding work on every device of the context.
    pub fn synchronize(&self) -> Result<()> {
        if let Some(accel) = &self.inner.accel {
            accel.synchronize()?;
        }
        self.inner.host.synchronize()
    }
}
