//! Per-type tables for the values the engine stores and transmits.
//!
//! Every element type carries its [`DataType`] tag, the bit pattern that is
//! reserved to mean "no value here", and the matching validity predicate.
//! Padded slots in a compacted buffer always hold [`Element::INVALID`].

use std::fmt::Debug;
use std::ops::{Add, Div, Mul};

use crate::types::DataType;

/// A plain-old-data value that can live in a device arena.
pub trait Element: Copy + Debug + Default + PartialEq + Send + Sync + 'static {
    /// Tag used when the value crosses a communicator.
    const DTYPE: DataType;

    /// Reserved "no value" sentinel: NaN for floats, all-ones for integers.
    const INVALID: Self;

    /// False when the value is the reserved sentinel.
    fn is_valid(&self) -> bool;
}

macro_rules! impl_element {
    (int: $($ty:ty => $dtype:ident),*) => {
        $(
            impl Element for $ty {
                const DTYPE: DataType = DataType::$dtype;
                const INVALID: Self = !0;

                #[inline]
                fn is_valid(&self) -> bool {
                    *self != Self::INVALID
                }
            }
        )*
    };
    (float: $($ty:ty => $dtype:ident),*) => {
        $(
            impl Element for $ty {
                const DTYPE: DataType = DataType::$dtype;
                const INVALID: Self = <$ty>::NAN;

                #[inline]
                fn is_valid(&self) -> bool {
                    !self.is_nan()
                }
            }
        )*
    };
}

impl_element!(int: i32 => I32, i64 => I64, u32 => U32, u64 => U64);
impl_element!(float: f32 => F32, f64 => F64);

/// Floating-point element a gradient can be expressed in.
pub trait Gradient:
    Element + PartialOrd + Add<Output = Self> + Mul<Output = Self> + Div<Output = Self>
{
    const ZERO: Self;

    fn abs(self) -> Self;
    fn is_finite(self) -> bool;
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;

    /// Convert a small count (e.g. the number of workers) into this type.
    #[inline]
    fn from_count(n: usize) -> Self {
        Self::from_f64(n as f64)
    }
}

macro_rules! impl_gradient {
    ($($ty:ty),*) => {
        $(
            impl Gradient for $ty {
                const ZERO: Self = 0.0;

                #[inline]
                fn abs(self) -> Self {
                    <$ty>::abs(self)
                }
                #[inline]
                fn is_finite(self) -> bool {
                    <$ty>::is_finite(self)
                }
                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }
                #[inline]
                fn from_f64(v: f64) -> Self {
                    v as $ty
                }
            }
        )*
    };
}

impl_gradient!(f32, f64);
