//! Error types for the SPOP wire codec.

use thiserror::Error;

/// Result alias used throughout the codec.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding SPOP frames.
///
/// Every variant is a protocol violation from the peer's side: the connection
/// that produced it cannot be trusted to stay in sync and must be closed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended in the middle of a field.
    #[error("unexpected end of input while reading {context} ({needed} more byte(s) needed)")]
    UnexpectedEof {
        /// What was being read when the input ran out.
        context: &'static str,
        /// How many more bytes were required.
        needed: usize,
    },

    /// A varint kept its continuation bit set past the widest encoding
    /// permitted for the target width.
    #[error("varint does not fit in a {width}-bit value")]
    VarintOverflow {
        /// Bit width of the integer being decoded.
        width: u32,
    },

    /// The frame type byte does not name any of the six frame kinds.
    #[error("unknown frame kind {0:#04x}")]
    UnknownFrameKind(u8),

    /// The type tag of a typed value is outside the defined range.
    #[error("unknown value type tag {0:#04x}")]
    UnknownTypeTag(u8),

    /// An ACK action opcode is neither SET-VAR nor UNSET-VAR.
    #[error("unknown action opcode {0:#04x}")]
    UnknownAction(u8),

    /// A variable scope byte is outside 0..=4.
    #[error("unknown variable scope {0:#04x}")]
    UnknownScope(u8),

    /// A string field is not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// The declared frame length exceeds the permitted maximum.
    #[error("frame of {size} bytes exceeds the {max}-byte limit")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// Permitted maximum.
        max: usize,
    },

    /// A HELLO body carries a key this implementation does not recognise.
    ///
    /// HELLO values are encoded per key without type tags, so an unknown key
    /// cannot be skipped over; the frame has to be rejected.
    #[error("unrecognised hello key {0:?}")]
    UnknownHelloKey(String),

    /// The same argument name appeared twice within one message.
    #[error("duplicate argument {0:?} in message")]
    DuplicateArgument(String),

    /// Bytes remained after the declared end of a frame body.
    #[error("{0} trailing byte(s) after frame body")]
    TrailingBytes(usize),

    /// The FRAGMENTED flag was set; fragmented frames are not supported.
    #[error("fragmented frames are not supported")]
    Fragmented,
}
