//! Element-wise reduction over byte buffers, used by the all-reduce paths.

use crate::error::{DgcError, Result};
use crate::types::{DataType, ReduceOp};

trait Reducible: Copy + 'static {
    const SIZE: usize;
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_reducible {
    (@bytes $ty:ty) => {
        const SIZE: usize = std::mem::size_of::<$ty>();

        #[inline]
        fn read_le(bytes: &[u8]) -> Self {
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(bytes);
            <$ty>::from_le_bytes(raw)
        }

        #[inline]
        fn write_le(self, bytes: &mut [u8]) {
            bytes.copy_from_slice(&self.to_le_bytes());
        }
    };
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                impl_reducible!(@bytes $ty);

                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                        ReduceOp::BitOr => a | b,
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                impl_reducible!(@bytes $ty);

                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                        ReduceOp::BitOr => <$ty>::from_bits(a.to_bits() | b.to_bits()),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// `dst[i] = op(dst[i], src[i])` for every element of `dtype`.
///
/// Both slices must hold the same whole number of elements.
pub(crate) fn reduce_slice(dst: &mut [u8], src: &[u8], dtype: DataType, op: ReduceOp) -> Result<()> {
    if dst.len() != src.len() || dst.len() % dtype.size_in_bytes() != 0 {
        return Err(DgcError::BufferSizeMismatch {
            expected: dst.len(),
            actual: src.len(),
        });
    }
    if op == ReduceOp::BitOr && dtype.is_float() {
        return Err(DgcError::UnsupportedDType {
            dtype,
            op: "bitwise or",
        });
    }
    match dtype {
        DataType::F32 => reduce_typed::<f32>(dst, src, op),
        DataType::F64 => reduce_typed::<f64>(dst, src, op),
        DataType::I32 => reduce_typed::<i32>(dst, src, op),
        DataType::I64 => reduce_typed::<i64>(dst, src, op),
        DataType::U8 => reduce_typed::<u8>(dst, src, op),
        DataType::U32 => reduce_typed::<u32>(dst, src, op),
        DataType::U64 => reduce_typed::<u64>(dst, src, op),
    }
    Ok(())
}

fn reduce_typed<T: Reducible>(dst: &mut [u8], src: &[u8], op: ReduceOp) {
    for (d, s) in dst.chunks_exact_mut(T::SIZE).zip(src.chunks_exact(T::SIZE)) {
        T::reduce(T::read_le(d), T::read_le(s), op).write_le(d);
    }
}
