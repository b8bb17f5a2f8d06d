use serde::{Deserialize, Serialize};
use silo_error::{ErrorCodes, SiloError};
use thiserror::Error;

use crate::kernels;

/// Distance metric an index is built and searched with.
///
/// `Ip` scores are stored negated internally so that one ascending top-k
/// merge works for both metrics; callers observe larger-is-better scores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    L2,
    Ip,
}

#[derive(Error, Debug)]
#[error("Invalid metric: `{0}`")]
pub struct MetricParseError(String);

impl SiloError for MetricParseError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

impl TryFrom<&str> for Metric {
    type Error = MetricParseError;

    fn try_from(value: &str) -> Result<Self, MetricParseError> {
        match value {
            "L2" | "l2" => Ok(Metric::L2),
            "IP" | "ip" => Ok(Metric::Ip),
            _ => Err(MetricParseError(value.to_string())),
        }
    }
}

/// On-disk element type of the stored vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    Float32,
    Int8,
    UInt8,
}

impl ElementType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ElementType::Float32 => 4,
            ElementType::Int8 => 1,
            ElementType::UInt8 => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("No {metric:?} kernel for element type {element:?}")]
    UnsupportedMetric {
        metric: Metric,
        element: ElementType,
    },
}

impl SiloError for KernelError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

/// Widened accumulator a distance kernel reduces into.
pub trait Accum:
    Copy + PartialOrd + Send + Sync + std::fmt::Debug + bytemuck::Pod + 'static
{
    /// Sentinel larger than any reachable distance, used to seed result heaps.
    const SENTINEL: Self;
    fn to_f32(self) -> f32;
    fn negated(self) -> Self;
}

impl Accum for f32 {
    const SENTINEL: Self = f32::MAX;
    fn to_f32(self) -> f32 {
        self
    }
    fn negated(self) -> Self {
        -self
    }
}

impl Accum for i32 {
    const SENTINEL: Self = i32::MAX;
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn negated(self) -> Self {
        self.wrapping_neg()
    }
}

impl Accum for u32 {
    const SENTINEL: Self = u32::MAX;
    fn to_f32(self) -> f32 {
        self as f32
    }
    // IP is rejected for unsigned elements before a kernel is ever
    // selected, so unsigned accumulators are never negated.
    fn negated(self) -> Self {
        self
    }
}

/// A monomorphic distance kernel over one stored element type.
pub type Computer<E> = fn(&[E], &[E]) -> <E as Element>::Acc;

/// A stored vector element type, bound to its accumulator width.
pub trait Element: Copy + Send + Sync + std::fmt::Debug + bytemuck::Pod + 'static {
    type Acc: Accum;
    const TYPE: ElementType;

    fn to_f32(self) -> f32;
    fn l2_sqr(a: &[Self], b: &[Self]) -> Self::Acc;
    /// Negated inner product, when an IP kernel exists for this type.
    fn neg_ip() -> Option<Computer<Self>>;
}

impl Element for f32 {
    type Acc = f32;
    const TYPE: ElementType = ElementType::Float32;

    fn to_f32(self) -> f32 {
        self
    }
    fn l2_sqr(a: &[Self], b: &[Self]) -> f32 {
        kernels::l2_sqr_f32(a, b)
    }
    fn neg_ip() -> Option<Computer<Self>> {
        Some(kernels::neg_inner_product_f32)
    }
}

impl Element for i8 {
    type Acc = i32;
    const TYPE: ElementType = ElementType::Int8;

    fn to_f32(self) -> f32 {
        self as f32
    }
    fn l2_sqr(a: &[Self], b: &[Self]) -> i32 {
        kernels::l2_sqr_i8(a, b)
    }
    fn neg_ip() -> Option<Computer<Self>> {
        None
    }
}

impl Element for u8 {
    type Acc = u32;
    const TYPE: ElementType = ElementType::UInt8;

    fn to_f32(self) -> f32 {
        self as f32
    }
    fn l2_sqr(a: &[Self], b: &[Self]) -> u32 {
        kernels::l2_sqr_u8(a, b)
    }
    fn neg_ip() -> Option<Computer<Self>> {
        None
    }
}

/// Selects the kernel for a metric once per call; the inner loops stay
/// monomorphic.
pub fn select_computer<E: Element>(metric: Metric) -> Result<Computer<E>, KernelError> {
    match metric {
        Metric::L2 => Ok(E::l2_sqr),
        Metric::Ip => E::neg_ip().ok_or(KernelError::UnsupportedMetric {
            metric,
            element: E::TYPE,
        }),
    }
}
