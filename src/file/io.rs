//! Endian-aware primitive reads and writes for PE and metadata encoding.
//!
//! Everything in a managed image is little-endian, so this module only carries the
//! little-endian half of the usual helpers. Reads are bounds-checked against the slice and
//! advance a caller-owned offset; writes either patch a slice in place or append to a growing
//! buffer, which is how the metadata writer and the image builder assemble their output.
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::file::io::{read_le_at, write_le_to};
//!
//! let mut buffer = Vec::new();
//! write_le_to::<u16>(&mut buffer, 0x5A4D);
//! write_le_to::<u32>(&mut buffer, 0x80);
//!
//! let mut offset = 0;
//! assert_eq!(read_le_at::<u16>(&buffer, &mut offset)?, 0x5A4D);
//! assert_eq!(read_le_at::<u32>(&buffer, &mut offset)?, 0x80);
//! assert_eq!(offset, 6);
//! # Ok::<(), cilpatch::Error>(())
//! ```

use crate::Result;

/// Trait for primitive types that can be read from and written to little-endian byte slices.
///
/// Implemented for all fixed-width integers and floats used by the CIL instruction set and
/// the metadata stream.
pub trait CilIO: Sized {
    /// Fixed-size byte array matching the type's width.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decodes a value from little-endian bytes.
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encodes the value as little-endian bytes.
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cil_io {
    ($($ty:ty => $width:expr),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $width];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cil_io! {
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
    f32 => 4,
    f64 => 8,
}

/// Reads a little-endian value from the start of `data`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than the type.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Reads a little-endian value at `offset` and advances the offset past it.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the read would leave the slice.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Overwrites the bytes at `offset` with the little-endian encoding of `value`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the write would leave the slice.
pub fn write_le_at<T: CilIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();

    let Some(end) = offset.checked_add(bytes.len()) else {
        return Err(out_of_bounds_error!());
    };
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;

    Ok(())
}

/// Appends the little-endian encoding of `value` to `buffer`.
pub fn write_le_to<T: CilIO>(buffer: &mut Vec<u8>, value: T) {
    buffer.extend_from_slice(value.to_le_bytes().as_ref());
}

/// Appends `value` using the ECMA-335 compressed unsigned integer encoding (II.23.2).
///
/// # Panics
///
/// Panics if `value` exceeds `0x1FFF_FFFF`, the largest encodable value.
pub fn write_compressed_uint(buffer: &mut Vec<u8>, value: u32) {
    match value {
        0..=0x7F => buffer.push(value as u8),
        0x80..=0x3FFF => {
            buffer.push(0x80 | (value >> 8) as u8);
            buffer.push(value as u8);
        }
        0x4000..=0x1FFF_FFFF => {
            buffer.push(0xC0 | (value >> 24) as u8);
            buffer.push((value >> 16) as u8);
            buffer.push((value >> 8) as u8);
            buffer.push(value as u8);
        }
        _ => panic!("compressed integer out of range: {value:#x}"),
    }
}

/// Pads `buffer` with zeros until its length is a multiple of `alignment`.
pub fn pad_to(buffer: &mut Vec<u8>, alignment: usize) {
    let padding = (alignment - (buffer.len() % alignment)) % alignment;
    buffer.resize(buffer.len() + padding, 0);
}
