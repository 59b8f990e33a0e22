//! Example SPOP agent: scores client IPs against a static deny list.
//!
//! Configure the load balancer to send a `check-client-ip` message with the
//! client address in a `src` argument; the agent answers with a session
//! variable `ip_score` (0 to 100) the proxy configuration can route or block
//! on.

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use picket_agent::{Action, Engine, Message, MessageHandler, Value, VarScope};
use tracing::{info, warn};

const AGENT_PORT: u16 = 12345;

/// Networks that always score zero, as (base address, prefix length).
const DENY_LIST: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
];

struct IpReputationHandler;

impl IpReputationHandler {
    fn score(addr: Ipv4Addr) -> i32 {
        for (network, prefix) in DENY_LIST {
            let mask = u32::MAX.checked_shl(u32::from(32 - prefix)).unwrap_or(0);
            if u32::from(addr) & mask == u32::from(*network) & mask {
                return 0;
            }
        }
        if addr.is_private() || addr.is_loopback() {
            return 100;
        }
        95
    }

    fn client_addr(message: &Message) -> Option<Ipv4Addr> {
        match message.arg("src")? {
            Value::Ipv4(octets) => Some(Ipv4Addr::from(*octets)),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[async_trait]
impl MessageHandler for IpReputationHandler {
    async fn process(&self, message: &Message) -> Result<Vec<Action>> {
        if message.name != "check-client-ip" {
            return Ok(Vec::new());
        }

        let Some(addr) = Self::client_addr(message) else {
            warn!(message = %message.name, "no usable src argument");
            return Ok(Vec::new());
        };

        let score = Self::score(addr);
        info!(client = %addr, score, "scored client address");

        Ok(vec![Action::set_var(
            VarScope::Session,
            "ip_score",
            Value::Int32(score),
        )])
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let engine = Arc::new(
        Engine::builder()
            .port(AGENT_PORT)
            .handler(IpReputationHandler)
            .build()?,
    );

    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.start().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    engine.stop();
    runner.await??;

    Ok(())
}
