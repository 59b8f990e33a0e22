//! Wire codec for the Stream Processing Offload Protocol (SPOP).
//!
//! SPOP is the binary protocol a load balancer uses to stream per-request
//! events to an external agent over a long-lived TCP connection. This crate
//! implements the data model and the byte-level codec:
//!
//! - [`Value`]: the ten typed data variants carried in arguments and actions
//! - [`varint`]: LEB128 variable-length integers
//! - [`Frame`]: the envelope and bodies of all six frame kinds
//! - [`Message`] and [`Action`]: the units exchanged with handler code
//!
//! Connection handling, handshake negotiation and dispatch live in the
//! `picket-agent` crate; this crate is I/O free.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod action;
mod data;
mod error;
mod frame;
mod message;
pub mod varint;

pub use action::{Action, VarScope};
pub use data::Value;
pub use error::{ProtocolError, Result};
pub use frame::{
    Ack, AgentHello, Disconnect, DisconnectStatus, Frame, FrameBody, FrameFlags, FrameKind,
    HaproxyHello, Metadata, Notify,
};
pub use message::Message;
