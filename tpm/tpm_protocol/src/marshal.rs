// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Byte-cursor codec for TPM wire structures.
//!
//! Everything on the TPM wire is big-endian. Variable-length data is preceded
//! by a size (`TPM2B_*`, TPM 1.2 blobs) or a count (`TPML_*`). The embedded
//! length is never trusted on its own: it is checked against both the fixed
//! capacity of the target and the bytes remaining in the cursor before any
//! data is copied.
//!
//! Cursors borrow a caller-owned buffer and never allocate.

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Errors returned by the codec.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum MarshalError {
    /// A cursor was constructed over a zero-length buffer.
    #[error("zero-length buffer passed to the codec")]
    BadParameter,
    /// Not enough room (write) or not enough data (read), or an embedded
    /// length larger than the capacity of the target.
    #[error("buffer too small - needed {needed} bytes, {remaining} available")]
    BufferTooSmall {
        /// Bytes required by the operation.
        needed: usize,
        /// Bytes actually available.
        remaining: usize,
    },
    /// A tag, selector or boolean carried a value outside its domain.
    #[error("invalid value {value:#x} for {what}")]
    Fail {
        /// Name of the field that failed validation.
        what: &'static str,
        /// The offending value.
        value: u32,
    },
}

/// Write cursor over a caller-owned buffer.
pub struct WriteCursor<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> WriteCursor<'a> {
    /// Creates a cursor positioned at the start of `buffer`.
    pub fn new(buffer: &'a mut [u8]) -> Result<Self, MarshalError> {
        if buffer.is_empty() {
            return Err(MarshalError::BadParameter);
        }
        Ok(Self {
            buffer,
            position: 0,
        })
    }

    /// Number of bytes written so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Remaining capacity.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// The bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buffer[..self.position]
    }

    /// Appends `bytes`. Nothing is written if they do not fit.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), MarshalError> {
        if bytes.len() > self.remaining() {
            return Err(MarshalError::BufferTooSmall {
                needed: bytes.len(),
                remaining: self.remaining(),
            });
        }
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    /// Appends the in-memory representation of a zerocopy wire struct.
    pub fn write_struct<T: IntoBytes + Immutable>(&mut self, value: &T) -> Result<(), MarshalError> {
        self.write_bytes(value.as_bytes())
    }

    /// Appends a byte.
    pub fn write_u8(&mut self, value: u8) -> Result<(), MarshalError> {
        self.write_bytes(&[value])
    }

    /// Appends a big-endian `u16`.
    pub fn write_u16(&mut self, value: u16) -> Result<(), MarshalError> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Appends a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) -> Result<(), MarshalError> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Appends a big-endian `u64`.
    pub fn write_u64(&mut self, value: u64) -> Result<(), MarshalError> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Overwrites an already written big-endian `u32` at `offset`. Used to
    /// fill in size fields once the enclosing structure is complete.
    pub fn patch_u32(&mut self, offset: usize, value: u32) -> Result<(), MarshalError> {
        let end = offset.checked_add(4).ok_or(MarshalError::BufferTooSmall {
            needed: usize::MAX,
            remaining: self.position,
        })?;
        if end > self.position {
            return Err(MarshalError::BufferTooSmall {
                needed: end,
                remaining: self.position,
            });
        }
        self.buffer[offset..end].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }
}

/// Read cursor over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct ReadCursor<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> ReadCursor<'a> {
    /// Creates a cursor positioned at the start of `buffer`.
    pub fn new(buffer: &'a [u8]) -> Result<Self, MarshalError> {
        if buffer.is_empty() {
            return Err(MarshalError::BadParameter);
        }
        Ok(Self::new_unchecked(buffer))
    }

    /// Creates a cursor that may be empty. Used for nested regions whose
    /// length came from an already validated size field.
    pub fn new_unchecked(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// Whether every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.buffer[self.position..]
    }

    /// Consumes `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], MarshalError> {
        if len > self.remaining() {
            return Err(MarshalError::BufferTooSmall {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    /// Consumes `len` bytes and returns a cursor restricted to them.
    pub fn sub_cursor(&mut self, len: usize) -> Result<ReadCursor<'a>, MarshalError> {
        self.read_bytes(len).map(ReadCursor::new_unchecked)
    }

    /// Reads a zerocopy wire struct.
    pub fn read_struct<T: FromBytes + KnownLayout + Immutable>(
        &mut self,
    ) -> Result<T, MarshalError> {
        let bytes = self.read_bytes(size_of::<T>())?;
        T::read_from_bytes(bytes).map_err(|_| MarshalError::BufferTooSmall {
            needed: size_of::<T>(),
            remaining: bytes.len(),
        })
    }

    /// Reads a fixed-size byte array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], MarshalError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Reads a byte.
    pub fn read_u8(&mut self) -> Result<u8, MarshalError> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, MarshalError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    /// Reads a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, MarshalError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// Reads a big-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, MarshalError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }
}

/// A type with a TPM wire encoding.
pub trait Marshal {
    /// Appends the wire encoding of `self` to `cursor`.
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError>;
}

/// A type that can be decoded from the TPM wire.
pub trait Unmarshal: Sized {
    /// Decodes a value from the front of `cursor`.
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError>;
}

/// A wire union. The selector lives outside the union, typically in an
/// enclosing structure or in the command that produced it.
pub trait UnmarshalSelected: Sized {
    /// The discriminator type.
    type Selector: Copy;

    /// Decodes the variant chosen by `selector`.
    fn unmarshal_selected(
        selector: Self::Selector,
        cursor: &mut ReadCursor<'_>,
    ) -> Result<Self, MarshalError>;
}

macro_rules! impl_marshal_int {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
                    cursor.$write(*self)
                }
            }

            impl Unmarshal for $ty {
                fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
                    cursor.$read()
                }
            }
        )*
    };
}

impl_marshal_int! {
    u8 => write_u8, read_u8;
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
}

// TPM BOOL / TPMI_YES_NO: one byte, 0 or 1.
impl Marshal for bool {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        cursor.write_u8(*self as u8)
    }
}

impl Unmarshal for bool {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        match cursor.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(MarshalError::Fail {
                what: "BOOL",
                value: value.into(),
            }),
        }
    }
}

impl<const N: usize> Marshal for [u8; N] {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        cursor.write_bytes(self)
    }
}

impl<const N: usize> Unmarshal for [u8; N] {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        cursor.read_array()
    }
}

/// Implements [`Marshal`] and [`Unmarshal`] for zerocopy wire types whose
/// in-memory layout is already the big-endian wire encoding.
#[macro_export]
macro_rules! impl_marshal_zerocopy {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::marshal::Marshal for $ty {
                fn marshal(
                    &self,
                    cursor: &mut $crate::marshal::WriteCursor<'_>,
                ) -> Result<(), $crate::marshal::MarshalError> {
                    cursor.write_struct(self)
                }
            }

            impl $crate::marshal::Unmarshal for $ty {
                fn unmarshal(
                    cursor: &mut $crate::marshal::ReadCursor<'_>,
                ) -> Result<Self, $crate::marshal::MarshalError> {
                    cursor.read_struct()
                }
            }
        )*
    };
}

/// Sized byte buffer with a 16-bit size prefix (`TPM2B_*`) and a fixed
/// capacity of `N` bytes.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SizedBuffer<const N: usize> {
    size: u16,
    buffer: [u8; N],
}

impl<const N: usize> SizedBuffer<N> {
    /// Copies `data` into a new buffer.
    pub fn new(data: &[u8]) -> Result<Self, MarshalError> {
        if data.len() > N || data.len() > u16::MAX as usize {
            return Err(MarshalError::BufferTooSmall {
                needed: data.len(),
                remaining: N,
            });
        }
        let mut buffer = [0u8; N];
        buffer[..data.len()].copy_from_slice(data);
        Ok(Self {
            size: data.len() as u16,
            buffer,
        })
    }

    /// The empty buffer.
    pub const fn empty() -> Self {
        Self {
            size: 0,
            buffer: [0u8; N],
        }
    }

    /// The payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.size as usize]
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.size as usize
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl<const N: usize> Default for SizedBuffer<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> std::fmt::Debug for SizedBuffer<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_bytes()).finish()
    }
}

impl<const N: usize> Marshal for SizedBuffer<N> {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        let needed = 2 + self.len();
        if needed > cursor.remaining() {
            return Err(MarshalError::BufferTooSmall {
                needed,
                remaining: cursor.remaining(),
            });
        }
        cursor.write_u16(self.size)?;
        cursor.write_bytes(self.as_bytes())
    }
}

impl<const N: usize> Unmarshal for SizedBuffer<N> {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        let size = cursor.read_u16()? as usize;
        if size > N {
            return Err(MarshalError::BufferTooSmall {
                needed: size,
                remaining: N,
            });
        }
        Self::new(cursor.read_bytes(size)?)
    }
}

/// Sized byte buffer with a 32-bit size prefix, as used by TPM 1.2 for
/// capability responses and other opaque blobs.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct LongSizedBuffer<const N: usize> {
    size: u32,
    buffer: [u8; N],
}

impl<const N: usize> LongSizedBuffer<N> {
    /// Copies `data` into a new buffer.
    pub fn new(data: &[u8]) -> Result<Self, MarshalError> {
        if data.len() > N {
            return Err(MarshalError::BufferTooSmall {
                needed: data.len(),
                remaining: N,
            });
        }
        let mut buffer = [0u8; N];
        buffer[..data.len()].copy_from_slice(data);
        Ok(Self {
            size: data.len() as u32,
            buffer,
        })
    }

    /// The payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.size as usize]
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.size as usize
    }
}

impl<const N: usize> Default for LongSizedBuffer<N> {
    fn default() -> Self {
        Self {
            size: 0,
            buffer: [0u8; N],
        }
    }
}

impl<const N: usize> std::fmt::Debug for LongSizedBuffer<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_bytes()).finish()
    }
}

impl<const N: usize> Marshal for LongSizedBuffer<N> {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        let needed = 4 + self.len();
        if needed > cursor.remaining() {
            return Err(MarshalError::BufferTooSmall {
                needed,
                remaining: cursor.remaining(),
            });
        }
        cursor.write_u32(self.size)?;
        cursor.write_bytes(self.as_bytes())
    }
}

impl<const N: usize> Unmarshal for LongSizedBuffer<N> {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        let size = cursor.read_u32()? as usize;
        if size > N {
            return Err(MarshalError::BufferTooSmall {
                needed: size,
                remaining: N,
            });
        }
        Self::new(cursor.read_bytes(size)?)
    }
}

/// Counted list (`TPML_*`) with a 32-bit count and a fixed capacity of `N`
/// entries.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct BoundedList<T: Copy + Default, const N: usize> {
    count: u32,
    items: [T; N],
}

impl<T: Copy + Default, const N: usize> BoundedList<T, N> {
    /// Copies `items` into a new list.
    pub fn new(items: &[T]) -> Result<Self, MarshalError> {
        if items.len() > N {
            return Err(MarshalError::BufferTooSmall {
                needed: items.len(),
                remaining: N,
            });
        }
        let mut list = Self::default();
        list.items[..items.len()].copy_from_slice(items);
        list.count = items.len() as u32;
        Ok(list)
    }

    /// The populated entries.
    pub fn as_slice(&self) -> &[T] {
        &self.items[..self.count as usize]
    }

    /// Number of populated entries.
    pub fn len(&self) -> usize {
        self.count as usize
    }
}

impl<T: Copy + Default, const N: usize> Default for BoundedList<T, N> {
    fn default() -> Self {
        Self {
            count: 0,
            items: [T::default(); N],
        }
    }
}

impl<T: Copy + Default + std::fmt::Debug, const N: usize> std::fmt::Debug for BoundedList<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<T: Copy + Default + Marshal, const N: usize> Marshal for BoundedList<T, N> {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        cursor.write_u32(self.count)?;
        for item in self.as_slice() {
            item.marshal(cursor)?;
        }
        Ok(())
    }
}

impl<T: Copy + Default + Unmarshal, const N: usize> Unmarshal for BoundedList<T, N> {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        let count = cursor.read_u32()? as usize;
        if count > N {
            return Err(MarshalError::BufferTooSmall {
                needed: count,
                remaining: N,
            });
        }
        // Every element is at least one byte on the wire.
        if count > cursor.remaining() {
            return Err(MarshalError::BufferTooSmall {
                needed: count,
                remaining: cursor.remaining(),
            });
        }
        let mut list = Self::default();
        for item in &mut list.items[..count] {
            *item = T::unmarshal(cursor)?;
        }
        list.count = count as u32;
        Ok(list)
    }
}
