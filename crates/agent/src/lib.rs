//! SPOP agent runtime for the picket proxy stack.
//!
//! This crate implements the agent side of the Stream Processing Offload
//! Protocol: a long-lived TCP connection over which a load balancer streams
//! per-request NOTIFY frames, and the agent answers each with an ACK carrying
//! variable assignments for the in-flight transaction.
//!
//! # Architecture
//!
//! - [`MessageHandler`]: trait implemented by application code; receives one
//!   [`Message`] at a time and returns [`Action`]s
//! - [`Engine`]: binds a TCP port, accepts connections, runs one cooperative
//!   task per peer
//! - connection task: HELLO handshake, then the NOTIFY/ACK loop, until
//!   disconnect, idle timeout, engine stop or protocol error
//!
//! The wire codec lives in [`picket_spop`], re-exported as [`spop`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use picket_agent::{Action, Engine, Message, MessageHandler, VarScope};
//!
//! struct AllowAll;
//!
//! #[async_trait]
//! impl MessageHandler for AllowAll {
//!     async fn process(&self, message: &Message) -> anyhow::Result<Vec<Action>> {
//!         if message.name == "check-authorization" {
//!             return Ok(vec![Action::set_var(VarScope::Transaction, "allowed", true)]);
//!         }
//!         Ok(Vec::new())
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = Arc::new(Engine::builder().port(12345).handler(AllowAll).build()?);
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! Handler invocations for different peers run in parallel; within one
//! connection, frames are processed in receive order and ACKs are emitted in
//! NOTIFY order. The handler is shared immutably across all connections.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod connection;
mod engine;
mod error;
mod handler;
mod metrics;

pub use engine::{Engine, EngineBuilder, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_FRAME_SIZE};
pub use error::{AgentError, AgentResult};
pub use handler::MessageHandler;
pub use metrics::{HistogramMetric, HistogramSnapshot, MetricsSnapshot, ProtocolMetrics};

/// The wire codec this runtime speaks.
pub use picket_spop as spop;

// The types handler code works with, re-exported for convenience.
pub use picket_spop::{Action, Message, Value, VarScope};
