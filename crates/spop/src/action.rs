//! Variable actions carried back to the load balancer inside ACK frames.

use bytes::{Buf, BufMut};

use crate::data::Value;
use crate::error::{ProtocolError, Result};
use crate::varint;

const ACTION_SET_VAR: u8 = 0x01;
const ACTION_UNSET_VAR: u8 = 0x02;

/// Lifetime domain of a variable on the load balancer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VarScope {
    /// Whole process.
    Process = 0,
    /// Client session.
    Session = 1,
    /// Current transaction.
    Transaction = 2,
    /// Request channel.
    Request = 3,
    /// Response channel.
    Response = 4,
}

impl VarScope {
    /// Raw scope byte.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a scope byte. Returns `None` for anything outside 0..=4.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Process),
            1 => Some(Self::Session),
            2 => Some(Self::Transaction),
            3 => Some(Self::Request),
            4 => Some(Self::Response),
            _ => None,
        }
    }
}

/// A variable mutation produced by a handler and shipped in an ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Assign `value` to the variable `name` in `scope`.
    SetVar {
        /// Variable scope.
        scope: VarScope,
        /// Variable name, without the prefix the load balancer adds.
        name: String,
        /// New value.
        value: Value,
    },
    /// Remove the variable `name` from `scope`.
    UnsetVar {
        /// Variable scope.
        scope: VarScope,
        /// Variable name.
        name: String,
    },
}

impl Action {
    /// Convenience constructor for [`Action::SetVar`].
    pub fn set_var(scope: VarScope, name: impl Into<String>, value: impl Into<Value>) -> Self {
        Action::SetVar {
            scope,
            name: name.into(),
            value: value.into(),
        }
    }

    /// Convenience constructor for [`Action::UnsetVar`].
    pub fn unset_var(scope: VarScope, name: impl Into<String>) -> Self {
        Action::UnsetVar {
            scope,
            name: name.into(),
        }
    }

    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Action::SetVar { scope, name, value } => {
                dst.put_u8(ACTION_SET_VAR);
                dst.put_u8(scope.to_u8());
                varint::put_str(dst, name);
                value.encode(dst);
            }
            Action::UnsetVar { scope, name } => {
                dst.put_u8(ACTION_UNSET_VAR);
                dst.put_u8(scope.to_u8());
                varint::put_str(dst, name);
            }
        }
    }

    pub(crate) fn decode(src: &mut impl Buf) -> Result<Self> {
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof {
                context: "action header",
                needed: 2 - src.remaining(),
            });
        }
        let opcode = src.get_u8();
        let scope_byte = src.get_u8();
        let scope = VarScope::from_u8(scope_byte).ok_or(ProtocolError::UnknownScope(scope_byte))?;
        match opcode {
            ACTION_SET_VAR => Ok(Action::SetVar {
                scope,
                name: varint::get_str(src)?,
                value: Value::decode(src)?,
            }),
            ACTION_UNSET_VAR => Ok(Action::UnsetVar {
                scope,
                name: varint::get_str(src)?,
            }),
            other => Err(ProtocolError::UnknownAction(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(action: &Action) -> Action {
        let mut buf = Vec::new();
        action.encode(&mut buf);
        let mut src = &buf[..];
        let decoded = Action::decode(&mut src).expect("should decode");
        assert!(!src.has_remaining());
        decoded
    }

    #[test]
    fn set_var_round_trip() {
        let action = Action::set_var(VarScope::Session, "ip_score", 95i32);
        assert_eq!(round_trip(&action), action);
    }

    #[test]
    fn unset_var_round_trip() {
        let action = Action::unset_var(VarScope::Transaction, "blocked");
        assert_eq!(round_trip(&action), action);
    }

    #[test]
    fn scope_bytes_are_stable() {
        assert_eq!(VarScope::Process.to_u8(), 0);
        assert_eq!(VarScope::Response.to_u8(), 4);
        assert_eq!(VarScope::from_u8(2), Some(VarScope::Transaction));
        assert_eq!(VarScope::from_u8(5), None);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut src = &[0x03u8, 0x00][..];
        assert_eq!(Action::decode(&mut src), Err(ProtocolError::UnknownAction(0x03)));
    }

    #[test]
    fn unknown_scope_is_rejected() {
        let mut src = &[0x01u8, 0x07][..];
        assert_eq!(Action::decode(&mut src), Err(ProtocolError::UnknownScope(0x07)));
    }
}
