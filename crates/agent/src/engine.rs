//! The engine: accepts connections and runs one connection task per peer.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::connection::{handle_connection, ConnectionConfig};
use crate::error::{AgentError, AgentResult};
use crate::handler::MessageHandler;
use crate::metrics::ProtocolMetrics;

/// Default upper bound on accepted and advertised frame payloads.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Default per-read deadline.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for [`Engine`].
///
/// `port` and `handler` are required; everything else has a default.
pub struct EngineBuilder {
    port: Option<u16>,
    handler: Option<Arc<dyn MessageHandler>>,
    max_frame_size: u32,
    idle_timeout: Duration,
    pipelining: bool,
}

impl EngineBuilder {
    /// Start a builder with default options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            port: None,
            handler: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            pipelining: true,
        }
    }

    /// TCP port to bind. Port 0 picks an ephemeral port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// The message handler shared by all connections.
    #[must_use]
    pub fn handler(mut self, handler: impl MessageHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Upper bound on accepted and advertised frame payloads.
    #[must_use]
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Deadline between consecutive fully-read frames on one connection.
    #[must_use]
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Whether to advertise the `pipelining` capability.
    #[must_use]
    pub fn pipelining(mut self, pipelining: bool) -> Self {
        self.pipelining = pipelining;
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Configuration`] when `port` or `handler` is
    /// missing.
    pub fn build(self) -> AgentResult<Engine> {
        let port = self
            .port
            .ok_or_else(|| AgentError::Configuration("port is required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| AgentError::Configuration("handler is required".to_string()))?;

        Ok(Engine {
            port,
            handler,
            config: ConnectionConfig {
                max_frame_size: self.max_frame_size,
                idle_timeout: self.idle_timeout,
                pipelining: self.pipelining,
            },
            metrics: Arc::new(ProtocolMetrics::new()),
            running: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            shutdown: tokio::sync::Notify::new(),
            local_addr: OnceLock::new(),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts SPOP connections and runs one connection task per peer.
///
/// The engine is shared behind an [`Arc`]: one task runs [`Engine::start`]
/// while any other holder may call [`Engine::stop`].
pub struct Engine {
    port: u16,
    handler: Arc<dyn MessageHandler>,
    config: ConnectionConfig,
    metrics: Arc<ProtocolMetrics>,
    running: Arc<AtomicBool>,
    started: AtomicBool,
    shutdown: tokio::sync::Notify,
    local_addr: OnceLock<SocketAddr>,
}

impl Engine {
    /// Start building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Bind the listener and accept connections until [`Engine::stop`].
    ///
    /// Accept failures are logged and do not stop the engine; only a bind
    /// failure or a duplicate start is fatal.
    ///
    /// # Errors
    ///
    /// [`AgentError::Configuration`] when called twice, [`AgentError::Bind`]
    /// when the port cannot be bound.
    pub async fn start(&self) -> AgentResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AgentError::Configuration(
                "engine already started".to_string(),
            ));
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .map_err(AgentError::Bind)?;
        let addr = listener.local_addr().map_err(AgentError::Bind)?;
        let _ = self.local_addr.set(addr);
        self.running.store(true, Ordering::SeqCst);

        info!(%addr, max_frame_size = self.config.max_frame_size, "agent engine listening");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    self.metrics.inc_connections();
                    let handler = Arc::clone(&self.handler);
                    let config = self.config.clone();
                    let metrics = Arc::clone(&self.metrics);
                    let running = Arc::clone(&self.running);
                    tokio::spawn(async move {
                        let result = handle_connection(
                            stream,
                            peer,
                            handler,
                            config,
                            Arc::clone(&metrics),
                            running,
                        )
                        .await;
                        log_connection_end(peer, result, &metrics);
                        metrics.dec_active();
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
        }

        info!(%addr, "agent engine stopped");
        Ok(())
    }

    /// Stop accepting and let connection tasks wind down.
    ///
    /// In-flight connections observe the flag at their next read boundary and
    /// close; the accept loop exits immediately.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so a stop that lands between two accept
        // iterations is not lost.
        self.shutdown.notify_one();
    }

    /// Whether the accept loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The bound address, once [`Engine::start`] has bound the listener.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Engine metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<ProtocolMetrics> {
        Arc::clone(&self.metrics)
    }
}

fn log_connection_end(peer: SocketAddr, result: AgentResult<()>, metrics: &ProtocolMetrics) {
    match result {
        Ok(()) => debug!(%peer, "connection closed"),
        Err(AgentError::Closed) => debug!(%peer, "peer closed the connection"),
        Err(AgentError::IdleTimeout(deadline)) => {
            metrics.inc_idle_timeouts();
            warn!(%peer, ?deadline, "connection idle, closing");
        }
        Err(AgentError::Protocol(error)) => {
            metrics.inc_protocol_errors();
            warn!(%peer, error = %error, "closing connection on protocol error");
        }
        Err(error) => warn!(%peer, error = %error, "connection failed"),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use picket_spop::{Action, Message};

    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn process(&self, _message: &Message) -> anyhow::Result<Vec<Action>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn build_requires_port_and_handler() {
        assert!(matches!(
            Engine::builder().handler(NoopHandler).build(),
            Err(AgentError::Configuration(_))
        ));
        assert!(matches!(
            Engine::builder().port(0).build(),
            Err(AgentError::Configuration(_))
        ));
        assert!(Engine::builder().port(0).handler(NoopHandler).build().is_ok());
    }

    #[test]
    fn builder_defaults() {
        let engine = Engine::builder().port(0).handler(NoopHandler).build().unwrap();
        assert_eq!(engine.config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(engine.config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert!(engine.config.pipelining);
        assert!(!engine.is_running());
        assert_eq!(engine.local_addr(), None);
    }

    #[tokio::test]
    async fn duplicate_start_is_a_configuration_error() {
        let engine = Arc::new(Engine::builder().port(0).handler(NoopHandler).build().unwrap());

        let runner = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.start().await })
        };
        while engine.local_addr().is_none() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            engine.start().await,
            Err(AgentError::Configuration(_))
        ));

        engine.stop();
        runner.await.unwrap().unwrap();
    }
}
