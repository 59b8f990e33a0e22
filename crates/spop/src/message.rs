//! Messages carried inside NOTIFY frames.

use bytes::{Buf, BufMut};

use crate::data::Value;
use crate::error::{ProtocolError, Result};
use crate::varint;

/// A named bundle of typed arguments, the unit dispatched to a handler.
///
/// Arguments keep their wire order, so iteration is stable for any single
/// decode. Names are unique; a duplicate in the input is a protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message name, chosen by the load balancer's configuration.
    pub name: String,
    args: Vec<(String, Value)>,
}

impl Message {
    /// Create an empty message.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument, builder style.
    #[must_use]
    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push((name.into(), value.into()));
        self
    }

    /// Look up an argument by name.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args
            .iter()
            .find(|(arg_name, _)| arg_name == name)
            .map(|(_, value)| value)
    }

    /// Iterate over arguments in wire order.
    pub fn args(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.args.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether the message carries no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        varint::put_str(dst, &self.name);
        varint::put_u64(dst, self.args.len() as u64);
        for (name, value) in &self.args {
            varint::put_str(dst, name);
            value.encode(dst);
        }
    }

    pub(crate) fn decode(src: &mut impl Buf) -> Result<Self> {
        let name = varint::get_str(src)?;
        let count = varint::get_u64(src)?;
        let mut args: Vec<(String, Value)> = Vec::new();
        for _ in 0..count {
            let arg_name = varint::get_str(src)?;
            if args.iter().any(|(existing, _)| *existing == arg_name) {
                return Err(ProtocolError::DuplicateArgument(arg_name));
            }
            let value = Value::decode(src)?;
            args.push((arg_name, value));
        }
        Ok(Self { name, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_argument_order() {
        let message = Message::new("check-request-security")
            .with_arg("method", "GET")
            .with_arg("path", "/login")
            .with_arg("score", 42i32);

        let mut buf = Vec::new();
        message.encode(&mut buf);
        let decoded = Message::decode(&mut &buf[..]).unwrap();

        assert_eq!(decoded, message);
        let names: Vec<_> = decoded.args().map(|(name, _)| name).collect();
        assert_eq!(names, ["method", "path", "score"]);
    }

    #[test]
    fn arg_lookup() {
        let message = Message::new("check-client-ip").with_arg("src", "8.8.8.8");
        assert_eq!(message.arg("src"), Some(&Value::Str("8.8.8.8".into())));
        assert_eq!(message.arg("dst"), None);
    }

    #[test]
    fn duplicate_argument_is_rejected() {
        let mut buf = Vec::new();
        varint::put_str(&mut buf, "m");
        varint::put_u64(&mut buf, 2);
        varint::put_str(&mut buf, "a");
        Value::Null.encode(&mut buf);
        varint::put_str(&mut buf, "a");
        Value::Null.encode(&mut buf);

        assert_eq!(
            Message::decode(&mut &buf[..]),
            Err(ProtocolError::DuplicateArgument("a".to_string()))
        );
    }

    #[test]
    fn truncated_argument_list_is_rejected() {
        let mut buf = Vec::new();
        varint::put_str(&mut buf, "m");
        varint::put_u64(&mut buf, 3);
        varint::put_str(&mut buf, "only-one");
        Value::Bool(true).encode(&mut buf);

        assert!(matches!(
            Message::decode(&mut &buf[..]),
            Err(ProtocolError::UnexpectedEof { .. })
        ));
    }
}
