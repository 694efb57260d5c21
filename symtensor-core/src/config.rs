use std::{env, str::FromStr};

use crate::{
    device::DeviceSpec,
    dtype::ElemKind,
    kernels::MathMode,
    optimizer::PASS_NAMES,
    sim_backend::SimConfig,
    Error, Result,
};

/// Environment variable read by [`CompileConfig::from_env`].
pub const FLAGS_ENV: &str = "SYMTENSOR_FLAGS";

/// What placement does when the target accelerator cannot run a live op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Fail compilation with a placement error.
    #[default]
    Strict,
    /// Run the op on the host and log a warning.
    Warn,
    /// Run the op on the host.
    Silent,
}

impl FromStr for FallbackPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(Self::Strict),
            "warn" => Ok(Self::Warn),
            "silent" => Ok(Self::Silent),
            _ => Err(Error::Configuration(format!("unknown fallback policy `{s}`"))),
        }
    }
}

/// Numerics a kernel may trade for speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelaxedMath {
    FastTranscendentals,
    FlushDenormals,
}

impl FromStr for RelaxedMath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fast_transcendentals" => Ok(Self::FastTranscendentals),
            "flush_denormals" => Ok(Self::FlushDenormals),
            _ => Err(Error::Configuration(format!("unknown relaxed-math flag `{s}`"))),
        }
    }
}

/// Options of one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileConfig {
    pub device: DeviceSpec,
    /// Float kind that integer operands of transcendental ops are promoted to.
    pub element_type: ElemKind,
    /// Free intermediate buffers as soon as their last reader ran.
    pub garbage_collection: bool,
    pub fallback: FallbackPolicy,
    pub precision: Vec<RelaxedMath>,
    pub excluded_passes: Vec<String>,
    pub sim: SimConfig,
    /// Largest result, in elements, that constant folding evaluates.
    pub fold_limit: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            device: DeviceSpec::Host,
            element_type: ElemKind::F32,
            garbage_collection: true,
            fallback: FallbackPolicy::Strict,
            precision: Vec::new(),
            excluded_passes: Vec::new(),
            sim: SimConfig::default(),
            fold_limit: 1 << 16,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(Error::Configuration(format!("`{key}` expects on/off, got `{value}`"))),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| Error::Configuration(format!("`{key}` expects a number, got `{value}`")))
}

impl CompileConfig {
    pub fn host() -> Self {
        Self::default()
    }

    pub fn sim(ordinal: usize) -> Self {
        Self {
            device: DeviceSpec::Sim(ordinal),
            ..Self::default()
        }
    }

    pub fn cuda(ordinal: usize) -> Self {
        Self {
            device: DeviceSpec::Cuda(ordinal),
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device: DeviceSpec) -> Self {
        self.device = device;
        self
    }

    pub fn with_element_type(mut self, elem: ElemKind) -> Result<Self> {
        if !elem.is_float() {
            return Err(Error::Configuration(format!(
                "element type must be a float kind, got {elem}"
            )));
        }
        self.element_type = elem;
        Ok(self)
    }

    pub fn with_garbage_collection(mut self, on: bool) -> Self {
        self.garbage_collection = on;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_sim(mut self, sim: SimConfig) -> Self {
        self.sim = sim;
        self
    }

    pub fn relax(mut self, flag: RelaxedMath) -> Self {
        if !self.precision.contains(&flag) {
            self.precision.push(flag);
        }
        self
    }

    pub fn exclude_pass(mut self, name: impl Into<String>) -> Self {
        self.excluded_passes.push(name.into());
        self
    }

    /// Kernel math options before any device adjustment.
    pub fn math_mode(&self) -> MathMode {
        MathMode {
            fast_transcendentals: self.precision.contains(&RelaxedMath::FastTranscendentals),
            flush_denormals: self.precision.contains(&RelaxedMath::FlushDenormals),
            pairwise_sum: false,
        }
    }

    /// Parse comma separated `key=value` flags on top of the defaults, e.g.
    /// `device=sim0,gc=off,fallback=warn,relaxed=fast_transcendentals+flush_denormals`.
    pub fn parse_flags(flags: &str) -> Result<Self> {
        let mut config = Self::default();
        for flag in flags.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let (key, value) = flag
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| Error::Configuration(format!("expected key=value, got `{flag}`")))?;
            match key {
                "device" => config.device = value.parse()?,
                "gc" | "garbage_collection" => config.garbage_collection = parse_bool(key, value)?,
                "fallback" => config.fallback = value.parse()?,
                "float" | "element_type" => {
                    config = config.with_element_type(value.parse()?)?;
                }
                "relaxed" | "precision" => {
                    config.precision.clear();
                    if value != "none" {
                        for flag in value.split('+') {
                            config = config.relax(flag.parse()?);
                        }
                    }
                }
                "exclude" => {
                    for pass in value.split('+').filter(|p| !p.is_empty()) {
                        if !PASS_NAMES.contains(&pass) {
                            return Err(Error::Configuration(format!("unknown pass `{pass}`")));
                        }
                        config.excluded_passes.push(pass.to_string());
                    }
                }
                "lanes" => config.sim.lanes = parse_usize(key, value)?.max(1),
                "sim_memory" => config.sim.memory_limit = Some(parse_usize(key, value)?),
                "fold_limit" => config.fold_limit = parse_usize(key, value)?,
                _ => return Err(Error::Configuration(format!("unknown flag `{key}`"))),
            }
        }
        Ok(config)
    }

    /// Flags from `SYMTENSOR_FLAGS`, or the defaults when it is not set.
    pub fn from_env() -> Result<Self> {
        match env::var(FLAGS_ENV) {
            Ok(flags) => Self::parse_flags(&flags),
            Err(env::VarError::NotPresent) => Ok(Self::default()),
            Err(e) => Err(Error::Configuration(format!("{FLAGS_ENV}: {e}"))),
        }
    }
}
