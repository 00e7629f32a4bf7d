//! Little-endian field codec shared by every on-disk record
//!
//! Fixed-offset accessors panic when the field lies outside the buffer;
//! callers size their buffers from the record constants in [`crate::layout`].
//! Streamed, length-prefixed strings go through `std::io` so truncation shows
//! up as an `UnexpectedEof` error instead.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Read a `u32` at `offset`
#[inline]
pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&buf[offset..offset + 4])
}

/// Read a `u64` at `offset`
#[inline]
pub fn get_u64(buf: &[u8], offset: usize) -> u64 {
    LittleEndian::read_u64(&buf[offset..offset + 8])
}

/// Write a `u32` at `offset`
#[inline]
pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut buf[offset..offset + 4], value);
}

/// Write a `u64` at `offset`
#[inline]
pub fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut buf[offset..offset + 8], value);
}

/// Write `bytes` preceded by its length as a `u32`
pub fn write_prefixed<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "byte string too long"))?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_all(bytes)
}

/// Read a `u32`-length-prefixed byte string
pub fn read_prefixed<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Encoded size of a length-prefixed string
#[inline]
pub fn prefixed_len(bytes: &[u8]) -> usize {
    4 + bytes.len()
}
