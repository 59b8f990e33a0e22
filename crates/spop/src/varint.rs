//! Variable-length integer codec.
//!
//! SPOP transports every integer other than the 4-byte frame length prefix as
//! an unsigned LEB128 varint: 7-bit groups, lowest group first, high bit set
//! on every byte except the last. Signed integers travel through the same
//! routine by bit-pattern reinterpretation.

use bytes::{Buf, BufMut};

use crate::error::{ProtocolError, Result};

/// Widest legal encoding of a 32-bit varint.
const MAX_BYTES_32: usize = 5;
/// Widest legal encoding of a 64-bit varint.
const MAX_BYTES_64: usize = 10;

/// Number of bytes `encode` produces for `v`.
#[must_use]
pub fn encoded_len(v: u64) -> usize {
    if v == 0 {
        1
    } else {
        (64 - v.leading_zeros() as usize).div_ceil(7)
    }
}

/// Append the varint encoding of `v` to `dst`.
pub fn put_u64(dst: &mut impl BufMut, mut v: u64) {
    while v >= 0x80 {
        dst.put_u8((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    dst.put_u8(v as u8);
}

/// Append the varint encoding of a 32-bit value to `dst`.
pub fn put_u32(dst: &mut impl BufMut, v: u32) {
    put_u64(dst, u64::from(v));
}

/// Append a signed 32-bit value, reinterpreted as its unsigned bit pattern.
pub fn put_i32(dst: &mut impl BufMut, v: i32) {
    put_u32(dst, v as u32);
}

/// Append a signed 64-bit value, reinterpreted as its unsigned bit pattern.
pub fn put_i64(dst: &mut impl BufMut, v: i64) {
    put_u64(dst, v as u64);
}

fn get_uvar(src: &mut impl Buf, width: u32, max_bytes: usize) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..max_bytes {
        if !src.has_remaining() {
            return Err(ProtocolError::UnexpectedEof {
                context: "varint",
                needed: 1,
            });
        }
        let byte = src.get_u8();
        let group = u64::from(byte & 0x7f);
        let shift = 7 * i as u32;
        // The last permitted byte may only carry the bits left in the width.
        if width - shift < 7 && group >> (width - shift) != 0 {
            return Err(ProtocolError::VarintOverflow { width });
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProtocolError::VarintOverflow { width })
}

/// Read a 64-bit varint from `src`.
///
/// # Errors
///
/// Fails when the input ends mid-varint or the encoding runs past ten bytes.
pub fn get_u64(src: &mut impl Buf) -> Result<u64> {
    get_uvar(src, 64, MAX_BYTES_64)
}

/// Read a 32-bit varint from `src`.
///
/// # Errors
///
/// Fails when the input ends mid-varint or the value does not fit in 32 bits.
pub fn get_u32(src: &mut impl Buf) -> Result<u32> {
    Ok(get_uvar(src, 32, MAX_BYTES_32)? as u32)
}

/// Read a signed 32-bit value transported as its unsigned bit pattern.
pub fn get_i32(src: &mut impl Buf) -> Result<i32> {
    Ok(get_u32(src)? as i32)
}

/// Read a signed 64-bit value transported as its unsigned bit pattern.
pub fn get_i64(src: &mut impl Buf) -> Result<i64> {
    Ok(get_u64(src)? as i64)
}

/// Append a varint-length-prefixed UTF-8 string to `dst`.
pub fn put_str(dst: &mut impl BufMut, s: &str) {
    put_u64(dst, s.len() as u64);
    dst.put_slice(s.as_bytes());
}

/// Read a varint-length-prefixed UTF-8 string from `src`.
///
/// # Errors
///
/// Fails when the declared length overruns the remaining input or the bytes
/// are not valid UTF-8.
pub fn get_str(src: &mut impl Buf) -> Result<String> {
    let bytes = get_bytes(src, "string")?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Read a varint-length-prefixed byte sequence from `src`.
pub fn get_bytes(src: &mut impl Buf, context: &'static str) -> Result<Vec<u8>> {
    let len = get_u64(src)?;
    if len > src.remaining() as u64 {
        return Err(ProtocolError::UnexpectedEof {
            context,
            needed: (len - src.remaining() as u64) as usize,
        });
    }
    let mut bytes = vec![0u8; len as usize];
    src.copy_to_slice(&mut bytes);
    Ok(bytes)
}
