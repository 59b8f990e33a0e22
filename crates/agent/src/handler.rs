//! The contract between the engine and application code.

use async_trait::async_trait;
use picket_spop::{Action, Message};

/// Application logic invoked for every message inside a NOTIFY frame.
///
/// One handler instance is shared by every connection the engine accepts, so
/// implementations must be `Send + Sync` and any mutable state they keep
/// (rate-limit counters, caches) is theirs to synchronize. `process` runs on
/// the connection task and may await freely; the engine imposes no deadline,
/// so a handler that never completes stalls its own connection.
///
/// Message names are opaque strings chosen by the load balancer's
/// configuration. A handler that receives a name it does not know should
/// return an empty action list; the engine does not filter.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one message and return the variable actions to ship in the
    /// matching ACK.
    ///
    /// An empty list is a valid answer (no variables changed). An error is
    /// logged, that message contributes no actions, and dispatch continues
    /// with the next message; the connection stays up.
    async fn process(&self, message: &Message) -> anyhow::Result<Vec<Action>>;
}
