//! Element-wise sum used by the collective engine and the CPU device adapter.
//!
//! Elements are read and written little-endian through byte slices, so
//! neither side needs to be aligned for its element type.

use crate::error::{CollieError, Result};
use crate::types::DataType;

/// Types with a sum as defined for the wire element types.
pub(crate) trait Summable: Copy + 'static {
    fn sum(a: Self, b: Self) -> Self;
}

macro_rules! impl_summable {
    (int: $($ty:ty),*) => {
        $(
            impl Summable for $ty {
                #[inline]
                fn sum(a: Self, b: Self) -> Self {
                    a.wrapping_add(b)
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Summable for $ty {
                #[inline]
                fn sum(a: Self, b: Self) -> Self {
                    a + b
                }
            }
        )*
    };
}

impl_summable!(int: i8, i32, i64, u8, u32, u64);
impl_summable!(float: f32, f64);

trait LeBytes: Sized {
    const SIZE: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Self::from_le_bytes(raw)
                }

                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(i8, i32, i64, u8, u32, u64, f32, f64);

/// `dst[i] += src[i]` on byte slices interpreted as `count` elements of `dtype`.
///
/// Both slices must hold exactly `count * dtype.size_in_bytes()` bytes.
pub fn sum_into(dst: &mut [u8], src: &[u8], count: usize, dtype: DataType) -> Result<()> {
    let expected = count * dtype.size_in_bytes();
    if src.len() != expected {
        return Err(CollieError::BufferSizeMismatch {
            expected,
            actual: src.len(),
        });
    }
    if dst.len() != expected {
        return Err(CollieError::BufferSizeMismatch {
            expected,
            actual: dst.len(),
        });
    }

    match dtype {
        DataType::F32 => sum_typed::<f32>(dst, src),
        DataType::F64 => sum_typed::<f64>(dst, src),
        DataType::I8 => sum_typed::<i8>(dst, src),
        DataType::I32 => sum_typed::<i32>(dst, src),
        DataType::I64 => sum_typed::<i64>(dst, src),
        DataType::U8 => sum_typed::<u8>(dst, src),
        DataType::U32 => sum_typed::<u32>(dst, src),
        DataType::U64 => sum_typed::<u64>(dst, src),
    }
    Ok(())
}

fn sum_typed<T: Summable + LeBytes>(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.chunks_exact_mut(T::SIZE).zip(src.chunks_exact(T::SIZE)) {
        let r = T::sum(T::read_le(d), T::read_le(s));
        r.write_le(d);
    }
}
