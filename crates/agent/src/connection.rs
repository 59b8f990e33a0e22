//! Per-connection runtime: handshake, NOTIFY/ACK loop, disconnect.
//!
//! A connection moves through three phases. The first frame must be a
//! HAPROXY-HELLO; the agent answers with AGENT-HELLO carrying the negotiated
//! version, frame size limit and capabilities. It then loops reading frames,
//! dispatching every message of each NOTIFY to the handler and answering
//! with one ACK, until the peer disconnects, the engine stops, the idle
//! deadline passes or a protocol error occurs.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use picket_spop::{
    Action, AgentHello, DisconnectStatus, Frame, FrameBody, FrameFlags, HaproxyHello, Notify,
    ProtocolError,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::{AgentError, AgentResult};
use crate::handler::MessageHandler;
use crate::metrics::ProtocolMetrics;

/// The one SPOP version this agent speaks.
const SUPPORTED_VERSION: &str = "2.0";

/// The one capability this agent can offer.
const CAP_PIPELINING: &str = "pipelining";

/// Per-connection slice of the engine configuration.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) max_frame_size: u32,
    pub(crate) idle_timeout: Duration,
    pub(crate) pipelining: bool,
}

/// Result of a successful HELLO negotiation.
#[derive(Debug)]
struct Session {
    version: String,
    max_frame_size: u32,
    capabilities: Vec<String>,
}

/// Drive one accepted connection to completion.
///
/// Returns `Ok(())` on any orderly shutdown (peer disconnect, healthcheck,
/// engine stop); errors are per-connection and never affect the engine.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    config: ConnectionConfig,
    metrics: Arc<ProtocolMetrics>,
    running: Arc<AtomicBool>,
) -> AgentResult<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    // The first frame decides everything; anything but HAPROXY-HELLO (or any
    // decode failure) drops the socket without a reply.
    let frame = read_frame(&mut reader, config.max_frame_size, config.idle_timeout).await?;
    metrics.inc_frames();
    if frame.metadata.flags.contains(FrameFlags::FRAGMENTED) {
        return Err(ProtocolError::Fragmented.into());
    }
    let FrameBody::HaproxyHello(hello) = frame.body else {
        return Err(AgentError::UnexpectedFrame(frame.body.kind()));
    };

    let session = match negotiate(&hello, &config) {
        Ok(session) => session,
        Err(reason) => {
            let goodbye = Frame::agent_disconnect(DisconnectStatus::Stop, reason.as_str());
            let _ = write_frame(&mut writer, &goodbye, config.max_frame_size).await;
            return Err(AgentError::Handshake(reason));
        }
    };

    let reply = Frame::agent_hello(AgentHello {
        version: session.version.clone(),
        max_frame_size: session.max_frame_size,
        capabilities: session.capabilities.clone(),
    });
    write_frame(&mut writer, &reply, session.max_frame_size).await?;
    metrics.inc_handshakes();

    debug!(
        %peer,
        version = %session.version,
        max_frame_size = session.max_frame_size,
        capabilities = ?session.capabilities,
        engine_id = hello.engine_id.as_deref().unwrap_or(""),
        "handshake completed"
    );

    if hello.healthcheck {
        debug!(%peer, "healthcheck hello, closing after reply");
        return Ok(());
    }

    loop {
        // The stop flag is observed between frames; a blocked read is bounded
        // by the idle deadline.
        if !running.load(Ordering::Relaxed) {
            debug!(%peer, "engine stopping, closing connection");
            return Ok(());
        }

        let frame =
            match read_frame(&mut reader, session.max_frame_size, config.idle_timeout).await {
                Ok(frame) => frame,
                Err(AgentError::Closed) => {
                    debug!(%peer, "peer closed the connection");
                    return Ok(());
                }
                Err(AgentError::Protocol(error)) => {
                    let goodbye =
                        Frame::agent_disconnect(DisconnectStatus::Abort, error.to_string());
                    let _ = write_frame(&mut writer, &goodbye, session.max_frame_size).await;
                    return Err(error.into());
                }
                Err(error) => return Err(error),
            };
        metrics.inc_frames();

        if frame.metadata.flags.contains(FrameFlags::FRAGMENTED) {
            let goodbye = Frame::agent_disconnect(
                DisconnectStatus::Abort,
                "fragmented frames are not supported",
            );
            let _ = write_frame(&mut writer, &goodbye, session.max_frame_size).await;
            return Err(ProtocolError::Fragmented.into());
        }

        match frame.body {
            FrameBody::Notify(notify) => {
                metrics.inc_notifies();
                let actions = dispatch(handler.as_ref(), &notify, &metrics).await;
                trace!(
                    %peer,
                    stream_id = frame.metadata.stream_id,
                    frame_id = frame.metadata.frame_id,
                    actions = actions.len(),
                    "acknowledging notify"
                );
                let ack = Frame::ack(frame.metadata.stream_id, frame.metadata.frame_id, actions);
                metrics.inc_acks();
                write_frame(&mut writer, &ack, session.max_frame_size).await?;
            }
            FrameBody::HaproxyDisconnect(goodbye) => {
                info!(
                    %peer,
                    status = goodbye.status,
                    message = %goodbye.message,
                    "peer disconnecting"
                );
                let reply = Frame::agent_disconnect(DisconnectStatus::Ok, "connection closing");
                let _ = write_frame(&mut writer, &reply, session.max_frame_size).await;
                return Ok(());
            }
            // The load balancer may legitimately send kinds this runtime does
            // not handle; they must not kill the connection.
            other => {
                debug!(%peer, kind = ?other.kind(), "ignoring unhandled frame");
            }
        }
    }
}

/// Pick the connection parameters from the peer's offer.
fn negotiate(hello: &HaproxyHello, config: &ConnectionConfig) -> Result<Session, String> {
    let version = hello
        .supported_versions
        .iter()
        .find(|offered| offered.as_str() == SUPPORTED_VERSION)
        .cloned()
        .ok_or_else(|| {
            format!(
                "unsupported versions {:?}, agent speaks {SUPPORTED_VERSION}",
                hello.supported_versions
            )
        })?;

    // A peer that omits max-frame-size gets the engine's own cap.
    let max_frame_size = if hello.max_frame_size == 0 {
        config.max_frame_size
    } else {
        hello.max_frame_size.min(config.max_frame_size)
    };

    let mut capabilities = Vec::new();
    if config.pipelining && hello.capabilities.iter().any(|c| c == CAP_PIPELINING) {
        capabilities.push(CAP_PIPELINING.to_string());
    }

    Ok(Session {
        version,
        max_frame_size,
        capabilities,
    })
}

/// Run every message of one NOTIFY through the handler, in order.
///
/// A failing handler is logged and contributes no actions; the remaining
/// messages are still dispatched.
async fn dispatch(
    handler: &dyn MessageHandler,
    notify: &Notify,
    metrics: &ProtocolMetrics,
) -> Vec<Action> {
    let mut actions = Vec::new();
    for message in &notify.messages {
        let start = Instant::now();
        match handler.process(message).await {
            Ok(mut produced) => {
                metrics.record_dispatch_time(start.elapsed());
                actions.append(&mut produced);
            }
            Err(error) => {
                metrics.inc_handler_errors();
                warn!(
                    message = %message.name,
                    error = %error,
                    "handler failed, message contributes no actions"
                );
            }
        }
    }
    actions
}

/// Read one length-prefixed frame.
///
/// The size check runs on the declared length, before any body byte is read.
async fn read_frame<R>(
    reader: &mut R,
    max_frame_size: u32,
    idle_timeout: Duration,
) -> AgentResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match timeout(idle_timeout, reader.read_exact(&mut len_buf)).await {
        Err(_) => return Err(AgentError::IdleTimeout(idle_timeout)),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(AgentError::Closed)
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(_)) => {}
    }

    let declared = u32::from_be_bytes(len_buf);
    if declared > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: declared as usize,
            max: max_frame_size as usize,
        }
        .into());
    }

    let mut payload = vec![0u8; declared as usize];
    match timeout(idle_timeout, reader.read_exact(&mut payload)).await {
        Err(_) => return Err(AgentError::IdleTimeout(idle_timeout)),
        Ok(result) => {
            result?;
        }
    }

    Ok(Frame::decode_payload(&payload)?)
}

/// Write one frame and flush it.
///
/// The negotiated size limit applies to outgoing frames too: an ACK the peer
/// would reject is an error here, not on the wire.
async fn write_frame<W>(writer: &mut W, frame: &Frame, max_frame_size: u32) -> AgentResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut wire = BytesMut::new();
    frame.encode(&mut wire);
    let payload_len = wire.len() - 4;
    if payload_len > max_frame_size as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: payload_len,
            max: max_frame_size as usize,
        }
        .into());
    }
    writer.write_all(&wire).await?;
    writer.flush().await?;
    Ok(())
}
