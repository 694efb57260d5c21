use std::{fmt::Debug, fmt::Display, num::FpCategory, str::FromStr};

use half::{bf16, f16};

use crate::{Error, Result};

pub(crate) mod data;

pub use data::HostData;
pub(crate) use data::{with_elem_kind, with_host_data};

/// Element kind of a value: integer width and signedness, or float width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElemKind {
    U8,
    U32,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl ElemKind {
    pub const ALL: [ElemKind; 8] = [
        ElemKind::U8,
        ElemKind::U32,
        ElemKind::I32,
        ElemKind::I64,
        ElemKind::F16,
        ElemKind::BF16,
        ElemKind::F32,
        ElemKind::F64,
    ];

    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F16 | Self::BF16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.size_in_bytes() as u32 * 8
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    pub fn is_integral(self) -> bool {
        !self.is_float()
    }

    pub fn is_signed(self) -> bool {
        !matches!(self, Self::U8 | Self::U32)
    }

    /// Bits of exact integer precision the kind carries.
    pub(crate) fn precision_bits(self) -> u32 {
        match self {
            Self::U8 => 8,
            Self::U32 => 32,
            Self::I32 => 31,
            Self::I64 => 63,
            Self::F16 => 11,
            Self::BF16 => 8,
            Self::F32 => 24,
            Self::F64 => 53,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    pub fn c_name(self) -> &'static str {
        match self {
            Self::U8 => u8::C_NAME,
            Self::U32 => u32::C_NAME,
            Self::I32 => i32::C_NAME,
            Self::I64 => i64::C_NAME,
            Self::F16 => f16::C_NAME,
            Self::BF16 => bf16::C_NAME,
            Self::F32 => f32::C_NAME,
            Self::F64 => f64::C_NAME,
        }
    }
}

impl Display for ElemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElemKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ElemKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown element kind `{s}`")))
    }
}

/// Per-element arithmetic used by the host reference kernels.
///
/// Integer arithmetic wraps and integer division by zero yields zero. Transcendental
/// functions on integers round-trip through `f64`; graph construction inserts casts so
/// kernels normally only see them on floats.
pub trait DTypeOps: Copy {
    fn elem_add(self, rhs: Self) -> Self;
    fn elem_sub(self, rhs: Self) -> Self;
    fn elem_mul(self, rhs: Self) -> Self;
    fn elem_div(self, rhs: Self) -> Self;
    fn elem_max(self, rhs: Self) -> Self;
    fn elem_min(self, rhs: Self) -> Self;
    fn elem_pow(self, rhs: Self) -> Self;
    fn elem_neg(self) -> Self;
    fn elem_abs(self) -> Self;
    fn elem_relu(self) -> Self;
    fn elem_exp(self) -> Self;
    fn elem_ln(self) -> Self;
    fn elem_sqrt(self) -> Self;
    fn elem_tanh(self) -> Self;
    fn elem_sigmoid(self) -> Self;
    /// `exp` through a cheaper, reduced precision path.
    fn elem_fast_exp(self) -> Self;
    /// Replace subnormal values by zero.
    fn flush_denormal(self) -> Self;
}

/// Marker trait for tensor datatypes.
pub trait DType: Debug + Clone + DTypeOps + Send + Sync + PartialOrd + 'static {
    const KIND: ElemKind;
    const ZERO: Self;
    const ONE: Self;
    const C_NAME: &'static str;
    const C_DEP: Option<&'static str>;
    const INTEGRAL: bool;

    fn to_f64(&self) -> f64;
    fn from_f64(x: f64) -> Self;

    fn wrap(v: Vec<Self>) -> HostData;
    fn as_slice(data: &HostData) -> Option<&[Self]>;
    fn as_mut_slice(data: &mut HostData) -> Option<&mut [Self]>;
}

fn fast_exp_f32(x: f32) -> f32 {
    // 2^(x*log2(e)) split into integer and fractional parts, cubic on the fraction.
    let t = x * std::f32::consts::LOG2_E;
    if t > 127.0 {
        return f32::INFINITY;
    }
    if t < -126.0 {
        return 0.0;
    }
    let i = t.floor();
    let f = t - i;
    let p = 1.0 + f * (0.695_976_1 + f * (0.224_940_4 + f * 0.079_083_1));
    p * f32::from_bits(((i as i32 + 127) as u32) << 23)
}

macro_rules! int_ops {
    ($t:ident, $neg:expr, $abs:expr) => {
        impl DTypeOps for $t {
            fn elem_add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            fn elem_sub(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }
            fn elem_mul(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }
            fn elem_div(self, rhs: Self) -> Self {
                if rhs == 0 {
                    0
                } else {
                    self.wrapping_div(rhs)
                }
            }
            fn elem_max(self, rhs: Self) -> Self {
                Ord::max(self, rhs)
            }
            fn elem_min(self, rhs: Self) -> Self {
                Ord::min(self, rhs)
            }
            fn elem_pow(self, rhs: Self) -> Self {
                (self as f64).powf(rhs as f64) as $t
            }
            fn elem_neg(self) -> Self {
                let f: fn($t) -> $t = $neg;
                f(self)
            }
            fn elem_abs(self) -> Self {
                let f: fn($t) -> $t = $abs;
                f(self)
            }
            fn elem_relu(self) -> Self {
                Ord::max(self, 0)
            }
            fn elem_exp(self) -> Self {
                (self as f64).exp() as $t
            }
            fn elem_ln(self) -> Self {
                (self as f64).ln() as $t
            }
            fn elem_sqrt(self) -> Self {
                (self as f64).sqrt() as $t
            }
            fn elem_tanh(self) -> Self {
                (self as f64).tanh() as $t
            }
            fn elem_sigmoid(self) -> Self {
                (1.0 / (1.0 + (-(self as f64)).exp())) as $t
            }
            fn elem_fast_exp(self) -> Self {
                self.elem_exp()
            }
            fn flush_denormal(self) -> Self {
                self
            }
        }
    };
}

int_ops!(u8, |x| x, |x| x);
int_ops!(u32, |x| x, |x| x);
int_ops!(i32, |x: i32| x.wrapping_neg(), |x: i32| x.wrapping_abs());
int_ops!(i64, |x: i64| x.wrapping_neg(), |x: i64| x.wrapping_abs());

macro_rules! float_ops {
    ($t:ident) => {
        impl DTypeOps for $t {
            fn elem_add(self, rhs: Self) -> Self {
                self + rhs
            }
            fn elem_sub(self, rhs: Self) -> Self {
                self - rhs
            }
            fn elem_mul(self, rhs: Self) -> Self {
                self * rhs
            }
            fn elem_div(self, rhs: Self) -> Self {
                self / rhs
            }
            fn elem_max(self, rhs: Self) -> Self {
                self.max(rhs)
            }
            fn elem_min(self, rhs: Self) -> Self {
                self.min(rhs)
            }
            fn elem_pow(self, rhs: Self) -> Self {
                self.powf(rhs)
            }
            fn elem_neg(self) -> Self {
                -self
            }
            fn elem_abs(self) -> Self {
                self.abs()
            }
            fn elem_relu(self) -> Self {
                self.max(0.0)
            }
            fn elem_exp(self) -> Self {
                self.exp()
            }
            fn elem_ln(self) -> Self {
                self.ln()
            }
            fn elem_sqrt(self) -> Self {
                self.sqrt()
            }
            fn elem_tanh(self) -> Self {
                self.tanh()
            }
            fn elem_sigmoid(self) -> Self {
                1.0 / (1.0 + (-self).exp())
            }
            fn elem_fast_exp(self) -> Self {
                fast_exp_f32(self as f32) as $t
            }
            fn flush_denormal(self) -> Self {
                if self.is_subnormal() {
                    0.0
                } else {
                    self
                }
            }
        }
    };
}

float_ops!(f32);
float_ops!(f64);

// Half types compute in f32 and round back.
macro_rules! half_ops {
    ($t:ident) => {
        impl DTypeOps for $t {
            fn elem_add(self, rhs: Self) -> Self {
                $t::from_f32(self.to_f32() + rhs.to_f32())
            }
            fn elem_sub(self, rhs: Self) -> Self {
                $t::from_f32(self.to_f32() - rhs.to_f32())
            }
            fn elem_mul(self, rhs: Self) -> Self {
                $t::from_f32(self.to_f32() * rhs.to_f32())
            }
            fn elem_div(self, rhs: Self) -> Self {
                $t::from_f32(self.to_f32() / rhs.to_f32())
            }
            fn elem_max(self, rhs: Self) -> Self {
                $t::from_f32(self.to_f32().max(rhs.to_f32()))
            }
            fn elem_min(self, rhs: Self) -> Self {
                $t::from_f32(self.to_f32().min(rhs.to_f32()))
            }
            fn elem_pow(self, rhs: Self) -> Self {
                $t::from_f32(self.to_f32().powf(rhs.to_f32()))
            }
            fn elem_neg(self) -> Self {
                -self
            }
            fn elem_abs(self) -> Self {
                $t::from_f32(self.to_f32().abs())
            }
            fn elem_relu(self) -> Self {
                $t::from_f32(self.to_f32().max(0.0))
            }
            fn elem_exp(self) -> Self {
                $t::from_f32(self.to_f32().exp())
            }
            fn elem_ln(self) -> Self {
                $t::from_f32(self.to_f32().ln())
            }
            fn elem_sqrt(self) -> Self {
                $t::from_f32(self.to_f32().sqrt())
            }
            fn elem_tanh(self) -> Self {
                $t::from_f32(self.to_f32().tanh())
            }
            fn elem_sigmoid(self) -> Self {
                $t::from_f32(1.0 / (1.0 + (-self.to_f32()).exp()))
            }
            fn elem_fast_exp(self) -> Self {
                $t::from_f32(fast_exp_f32(self.to_f32()))
            }
            fn flush_denormal(self) -> Self {
                if self.classify() == FpCategory::Subnormal {
                    $t::ZERO
                } else {
                    self
                }
            }
        }
    };
}

half_ops!(f16);
half_ops!(bf16);

macro_rules! dtype {
    ($rt:ident, $variant:ident, $zero:expr, $one:expr, $c_repr:expr, $c_dep:expr, $integral:expr, $to:expr, $from:expr) => {
        impl DType for $rt {
            const KIND: ElemKind = ElemKind::$variant;
            const ZERO: $rt = $zero;
            const ONE: $rt = $one;
            const C_NAME: &'static str = $c_repr;
            const C_DEP: Option<&'static str> = $c_dep;
            const INTEGRAL: bool = $integral;

            fn to_f64(&self) -> f64 {
                let f: fn($rt) -> f64 = $to;
                f(*self)
            }
            fn from_f64(x: f64) -> Self {
                let f: fn(f64) -> $rt = $from;
                f(x)
            }
            fn wrap(v: Vec<Self>) -> HostData {
                HostData::$variant(v)
            }
            fn as_slice(data: &HostData) -> Option<&[Self]> {
                match data {
                    HostData::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }
            fn as_mut_slice(data: &mut HostData) -> Option<&mut [Self]> {
                match data {
                    HostData::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }
        }
    };
}

dtype!(u8, U8, 0u8, 1u8, "uint8_t", None, true, |x| x as f64, |x| x as u8);
dtype!(u32, U32, 0u32, 1u32, "uint32_t", None, true, |x| x as f64, |x| x as u32);
dtype!(i32, I32, 0i32, 1i32, "int", None, true, |x| x as f64, |x| x as i32);
dtype!(i64, I64, 0i64, 1i64, "int64_t", None, true, |x| x as f64, |x| x as i64);
dtype!(f32, F32, 0f32, 1f32, "float", None, false, |x| x as f64, |x| x as f32);
dtype!(f64, F64, 0f64, 1f64, "double", None, false, |x| x, |x| x);
dtype!(
    f16,
    F16,
    f16::from_f64_const(0.0),
    f16::from_f64_const(1.0),
    "__half",
    Some("#include \"cuda_fp16.h\""),
    false,
    |x| x.to_f64(),
    f16::from_f64
);
dtype!(
    bf16,
    BF16,
    bf16::from_f64_const(0.0),
    bf16::from_f64_const(1.0),
    "__nv_bfloat16",
    Some("#include \"cuda_bf16.h\""),
    false,
    |x| x.to_f64(),
    bf16::from_f64
);
