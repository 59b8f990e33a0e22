//! Error types for the agent runtime.

use std::time::Duration;

use picket_spop::{FrameKind, ProtocolError};
use thiserror::Error;

/// Result alias used throughout the runtime.
pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Errors raised by the engine and its connection tasks.
///
/// Connection-level variants terminate one connection and are logged at the
/// task boundary; only [`AgentError::Configuration`] and
/// [`AgentError::Bind`] are fatal to the engine itself.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The peer violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The engine was built or started with invalid options.
    #[error("engine misconfigured: {0}")]
    Configuration(String),

    /// The listener could not be bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    /// Reading from or writing to a connected socket failed.
    #[error("connection I/O failed: {0}")]
    Connection(#[from] std::io::Error),

    /// No frame arrived within the idle deadline.
    #[error("no frame received within {0:?}")]
    IdleTimeout(Duration),

    /// The peer closed the connection.
    #[error("peer closed the connection")]
    Closed,

    /// A frame of the wrong kind arrived during the handshake.
    #[error("expected HAPROXY-HELLO, received {0:?}")]
    UnexpectedFrame(FrameKind),

    /// The HELLO exchange could not produce an agreed configuration.
    #[error("handshake failed: {0}")]
    Handshake(String),
}
