//! Typed data values carried in NOTIFY arguments and SET-VAR actions.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes};

use crate::error::{ProtocolError, Result};
use crate::varint;

/// On-wire type tags, one per [`Value`] variant.
mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const INT32: u8 = 2;
    pub const UINT32: u8 = 3;
    pub const INT64: u8 = 4;
    pub const UINT64: u8 = 5;
    pub const IPV4: u8 = 6;
    pub const IPV6: u8 = 7;
    pub const STR: u8 = 8;
    pub const BIN: u8 = 9;
}

/// A typed SPOP value.
///
/// Each variant carries exactly the bytes its type requires. Equality on the
/// payload-carrying variants (`Ipv4`, `Ipv6`, `Str`, `Bin`) is structural,
/// byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Absence of a value.
    Null,
    /// Boolean, one byte on the wire.
    Bool(bool),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Unsigned 32-bit integer.
    UInt32(u32),
    /// Signed 64-bit integer.
    Int64(i64),
    /// Unsigned 64-bit integer.
    UInt64(u64),
    /// IPv4 address, exactly four raw bytes.
    Ipv4([u8; 4]),
    /// IPv6 address, exactly sixteen raw bytes.
    Ipv6([u8; 16]),
    /// UTF-8 string.
    Str(String),
    /// Opaque byte sequence.
    Bin(Bytes),
}

impl Value {
    /// The on-wire type tag for this value.
    #[must_use]
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Null => tag::NULL,
            Value::Bool(_) => tag::BOOL,
            Value::Int32(_) => tag::INT32,
            Value::UInt32(_) => tag::UINT32,
            Value::Int64(_) => tag::INT64,
            Value::UInt64(_) => tag::UINT64,
            Value::Ipv4(_) => tag::IPV4,
            Value::Ipv6(_) => tag::IPV6,
            Value::Str(_) => tag::STR,
            Value::Bin(_) => tag::BIN,
        }
    }

    /// Append the tagged encoding of this value to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.type_tag());
        match self {
            Value::Null => {}
            Value::Bool(b) => dst.put_u8(u8::from(*b)),
            Value::Int32(v) => varint::put_i32(dst, *v),
            Value::UInt32(v) => varint::put_u32(dst, *v),
            Value::Int64(v) => varint::put_i64(dst, *v),
            Value::UInt64(v) => varint::put_u64(dst, *v),
            Value::Ipv4(octets) => dst.put_slice(octets),
            Value::Ipv6(octets) => dst.put_slice(octets),
            Value::Str(s) => varint::put_str(dst, s),
            Value::Bin(b) => {
                varint::put_u64(dst, b.len() as u64);
                dst.put_slice(b);
            }
        }
    }

    /// Read one tagged value from `src`.
    ///
    /// # Errors
    ///
    /// Fails on an unknown type tag, a length overrun, or a fixed-width
    /// payload underrun.
    pub fn decode(src: &mut impl Buf) -> Result<Self> {
        if !src.has_remaining() {
            return Err(ProtocolError::UnexpectedEof {
                context: "value type tag",
                needed: 1,
            });
        }
        match src.get_u8() {
            tag::NULL => Ok(Value::Null),
            tag::BOOL => {
                if !src.has_remaining() {
                    return Err(ProtocolError::UnexpectedEof {
                        context: "bool value",
                        needed: 1,
                    });
                }
                Ok(Value::Bool(src.get_u8() != 0))
            }
            tag::INT32 => Ok(Value::Int32(varint::get_i32(src)?)),
            tag::UINT32 => Ok(Value::UInt32(varint::get_u32(src)?)),
            tag::INT64 => Ok(Value::Int64(varint::get_i64(src)?)),
            tag::UINT64 => Ok(Value::UInt64(varint::get_u64(src)?)),
            tag::IPV4 => {
                let mut octets = [0u8; 4];
                take_exact(src, &mut octets, "ipv4 address")?;
                Ok(Value::Ipv4(octets))
            }
            tag::IPV6 => {
                let mut octets = [0u8; 16];
                take_exact(src, &mut octets, "ipv6 address")?;
                Ok(Value::Ipv6(octets))
            }
            tag::STR => Ok(Value::Str(varint::get_str(src)?)),
            tag::BIN => Ok(Value::Bin(Bytes::from(varint::get_bytes(
                src, "binary value",
            )?))),
            other => Err(ProtocolError::UnknownTypeTag(other)),
        }
    }
}

fn take_exact(src: &mut impl Buf, dst: &mut [u8], context: &'static str) -> Result<()> {
    if src.remaining() < dst.len() {
        return Err(ProtocolError::UnexpectedEof {
            context,
            needed: dst.len() - src.remaining(),
        });
    }
    src.copy_to_slice(dst);
    Ok(())
}

// Diagnostics only; the wire contract never depends on this rendering.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Ipv4(octets) => write!(f, "{}", Ipv4Addr::from(*octets)),
            Value::Ipv6(octets) => write!(f, "{}", Ipv6Addr::from(*octets)),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bin(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Ipv4Addr> for Value {
    fn from(v: Ipv4Addr) -> Self {
        Value::Ipv4(v.octets())
    }
}

impl From<Ipv6Addr> for Value {
    fn from(v: Ipv6Addr) -> Self {
        Value::Ipv6(v.octets())
    }
}
