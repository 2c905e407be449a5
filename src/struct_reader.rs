//! Little-endian decoding of fixed-layout records.
//!
//! [`StructReader`] is a cursor over a byte range that was already fetched from a
//! [`ByteSource`]. It knows the absolute offset of that range so truncation errors
//! point at the right place in the file.

use crate::reader::ByteSource;
use crate::{Error, Result};

/// Cursor decoding little-endian fields from a byte range.
#[derive(Debug, Clone)]
pub struct StructReader<'a> {
    data: &'a [u8],
    pos: usize,
    base: u64,
    available: u64,
}

impl<'a> StructReader<'a> {
    /// Reader over `data`, which was read from absolute offset `base`.
    pub fn new(data: &'a [u8], base: u64) -> Self {
        Self {
            data,
            pos: 0,
            base,
            available: base + data.len() as u64,
        }
    }

    /// Override the source length reported in truncation errors.
    pub fn with_available(mut self, available: u64) -> Self {
        self.available = available;
        self
    }

    /// Current position relative to the start of the range.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Current absolute offset.
    pub fn offset(&self) -> u64 {
        self.base + self.pos as u64
    }

    /// Bytes left in the range.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::truncated(self.offset(), len as u64, self.available));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read a fixed-size byte array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Read a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Read a little-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    /// Borrow the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Advance past `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    /// Consume and return everything left in the range.
    pub fn tail(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

/// A fixed-size on-disk structure.
pub trait Record: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decode one record from the cursor, consuming exactly `SIZE` bytes.
    fn decode(reader: &mut StructReader<'_>) -> Result<Self>;

    /// Decode from the start of a byte slice.
    fn parse(data: &[u8]) -> Result<Self> {
        Self::decode(&mut StructReader::new(data, 0))
    }
}

/// Read one record at an absolute offset of `source`.
pub fn read_record<T: Record, S: ByteSource + ?Sized>(source: &S, offset: u64) -> Result<T> {
    let bytes = source.read_exact_at(offset, T::SIZE)?;
    let mut reader = StructReader::new(&bytes, offset).with_available(source.len());
    T::decode(&mut reader)
}

/// Read `count` consecutive records starting at `offset`.
pub fn read_records<T: Record, S: ByteSource + ?Sized>(
    source: &S,
    offset: u64,
    count: usize,
) -> Result<Vec<T>> {
    let len = count
        .checked_mul(T::SIZE)
        .ok_or(Error::truncated(offset, u64::MAX, source.len()))?;
    let bytes = source.read_exact_at(offset, len)?;
    let mut reader = StructReader::new(&bytes, offset).with_available(source.len());
    (0..count).map(|_| T::decode(&mut reader)).collect()
}

/// Check a magic signature at `offset`.
///
/// Whatever prefix of the signature is present is compared first, so input that
/// disagrees is [`Error::NotAPEFile`] even when it is also too short. A signature
/// that agrees but is cut off by the end of the source is [`Error::TruncatedData`].
pub fn expect_signature<S: ByteSource + ?Sized>(
    source: &S,
    offset: u64,
    expected: &[u8],
    what: &'static str,
) -> Result<()> {
    let available = source.len().saturating_sub(offset).min(expected.len() as u64) as usize;
    let present = source.read_range(offset.min(source.len()), available)?;
    if *present != expected[..available] {
        return Err(Error::NotAPEFile(what));
    }
    if available < expected.len() {
        return Err(Error::truncated(offset, expected.len() as u64, source.len()));
    }
    Ok(())
}
