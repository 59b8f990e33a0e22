//! End-to-end tests driving a real engine over localhost TCP, with the test
//! acting as the load balancer side of the protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use picket_agent::spop::{
    Disconnect, DisconnectStatus, Frame, FrameBody, FrameFlags, HaproxyHello, Metadata, Notify,
};
use picket_agent::{Action, AgentError, Engine, Message, MessageHandler, Value, VarScope};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Returns one fixed action for every message, whatever its name.
struct ScoreHandler;

#[async_trait]
impl MessageHandler for ScoreHandler {
    async fn process(&self, _message: &Message) -> anyhow::Result<Vec<Action>> {
        Ok(vec![Action::set_var(
            VarScope::Session,
            "ip_score",
            Value::Int32(95),
        )])
    }
}

/// Marks each message by name; fails on messages named `boom`.
struct PerMessageHandler;

#[async_trait]
impl MessageHandler for PerMessageHandler {
    async fn process(&self, message: &Message) -> anyhow::Result<Vec<Action>> {
        if message.name == "boom" {
            anyhow::bail!("synthetic handler failure");
        }
        Ok(vec![Action::set_var(
            VarScope::Transaction,
            message.name.clone(),
            true,
        )])
    }
}

/// The load balancer side of a connection, built on the raw codec.
struct Peer {
    stream: TcpStream,
}

impl Peer {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to engine");
        Self { stream }
    }

    async fn send(&mut self, frame: &Frame) {
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);
        self.stream.write_all(&wire).await.expect("send frame");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("send raw bytes");
    }

    /// Read the next frame; `None` once the agent has closed the connection.
    async fn try_recv(&mut self) -> Option<Frame> {
        let mut len_buf = [0u8; 4];
        if self.stream.read_exact(&mut len_buf).await.is_err() {
            return None;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .expect("read frame payload");
        Some(Frame::decode_payload(&payload).expect("decode frame"))
    }

    async fn recv(&mut self) -> Frame {
        self.try_recv().await.expect("agent closed the connection")
    }

    /// Complete the HELLO exchange and return the agent's reply.
    async fn handshake(&mut self) -> picket_agent::spop::AgentHello {
        self.send(&haproxy_hello(16_384)).await;
        let frame = self.recv().await;
        let FrameBody::AgentHello(hello) = frame.body else {
            panic!("expected AGENT-HELLO, got {:?}", frame.body.kind());
        };
        assert_eq!(frame.metadata.stream_id, 0);
        assert_eq!(frame.metadata.frame_id, 0);
        hello
    }
}

fn haproxy_hello(max_frame_size: u32) -> Frame {
    Frame::new(
        Metadata::default(),
        FrameBody::HaproxyHello(HaproxyHello {
            supported_versions: vec!["2.0".to_string()],
            max_frame_size,
            capabilities: vec!["pipelining".to_string()],
            healthcheck: false,
            engine_id: Some("spoe-test".to_string()),
        }),
    )
}

fn notify(stream_id: u64, frame_id: u64, messages: Vec<Message>) -> Frame {
    Frame::new(
        Metadata {
            flags: FrameFlags::empty(),
            stream_id,
            frame_id,
        },
        FrameBody::Notify(Notify { messages }),
    )
}

async fn spawn_engine(engine: Engine) -> (Arc<Engine>, SocketAddr) {
    let engine = Arc::new(engine);
    let runner = Arc::clone(&engine);
    tokio::spawn(async move { runner.start().await });
    loop {
        if let Some(addr) = engine.local_addr() {
            // The listener binds the wildcard address; talk to it via loopback.
            let addr = SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), addr.port());
            return (engine, addr);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn handshake_negotiates_version_size_and_capabilities() {
    let (engine, addr) =
        spawn_engine(Engine::builder().port(0).handler(ScoreHandler).build().unwrap()).await;

    let mut peer = Peer::connect(addr).await;
    let hello = peer.handshake().await;

    assert_eq!(hello.version, "2.0");
    assert_eq!(hello.max_frame_size, 16_384);
    assert_eq!(hello.capabilities, ["pipelining"]);

    engine.stop();
}

#[tokio::test]
async fn handshake_takes_the_smaller_frame_size() {
    let (engine, addr) =
        spawn_engine(Engine::builder().port(0).handler(ScoreHandler).build().unwrap()).await;

    let mut peer = Peer::connect(addr).await;
    peer.send(&haproxy_hello(1024)).await;
    let frame = peer.recv().await;
    let FrameBody::AgentHello(hello) = frame.body else {
        panic!("expected AGENT-HELLO");
    };
    assert_eq!(hello.max_frame_size, 1024);

    engine.stop();
}

#[tokio::test]
async fn pipelining_is_not_advertised_when_disabled() {
    let (engine, addr) = spawn_engine(
        Engine::builder()
            .port(0)
            .handler(ScoreHandler)
            .pipelining(false)
            .build()
            .unwrap(),
    )
    .await;

    let mut peer = Peer::connect(addr).await;
    let hello = peer.handshake().await;
    assert!(hello.capabilities.is_empty());

    engine.stop();
}

#[tokio::test]
async fn ack_echoes_ids_and_carries_handler_actions() {
    let (engine, addr) =
        spawn_engine(Engine::builder().port(0).handler(ScoreHandler).build().unwrap()).await;

    let mut peer = Peer::connect(addr).await;
    peer.handshake().await;

    peer.send(&notify(
        7,
        3,
        vec![Message::new("check-client-ip").with_arg("src", "8.8.8.8")],
    ))
    .await;

    let frame = peer.recv().await;
    assert_eq!(frame.metadata.stream_id, 7);
    assert_eq!(frame.metadata.frame_id, 3);
    let FrameBody::Ack(ack) = frame.body else {
        panic!("expected ACK, got {:?}", frame.body.kind());
    };
    assert_eq!(
        ack.actions,
        [Action::set_var(VarScope::Session, "ip_score", Value::Int32(95))]
    );

    let snapshot = engine.metrics().snapshot();
    assert_eq!(snapshot.connections_total, 1);
    assert_eq!(snapshot.handshakes_total, 1);
    assert_eq!(snapshot.notifies_total, 1);
    assert_eq!(snapshot.acks_total, 1);

    engine.stop();
}

#[tokio::test]
async fn multi_message_notify_keeps_action_order() {
    let (engine, addr) = spawn_engine(
        Engine::builder()
            .port(0)
            .handler(PerMessageHandler)
            .build()
            .unwrap(),
    )
    .await;

    let mut peer = Peer::connect(addr).await;
    peer.handshake().await;

    peer.send(&notify(
        1,
        1,
        vec![
            Message::new("check-authorization"),
            Message::new("check-request-security"),
        ],
    ))
    .await;

    let frame = peer.recv().await;
    let FrameBody::Ack(ack) = frame.body else {
        panic!("expected ACK");
    };
    assert_eq!(
        ack.actions,
        [
            Action::set_var(VarScope::Transaction, "check-authorization", true),
            Action::set_var(VarScope::Transaction, "check-request-security", true),
        ]
    );

    engine.stop();
}

#[tokio::test]
async fn duplicate_variable_assignments_are_all_transmitted() {
    /// Sets the same variable twice; the load balancer owns the tie-break.
    struct DoubleSetHandler;

    #[async_trait]
    impl MessageHandler for DoubleSetHandler {
        async fn process(&self, _message: &Message) -> anyhow::Result<Vec<Action>> {
            Ok(vec![
                Action::set_var(VarScope::Session, "verdict", Value::Int32(1)),
                Action::set_var(VarScope::Session, "verdict", Value::Int32(2)),
            ])
        }
    }

    let (engine, addr) = spawn_engine(
        Engine::builder()
            .port(0)
            .handler(DoubleSetHandler)
            .build()
            .unwrap(),
    )
    .await;

    let mut peer = Peer::connect(addr).await;
    peer.handshake().await;
    peer.send(&notify(3, 1, vec![Message::new("check-verdict")])).await;

    let frame = peer.recv().await;
    let FrameBody::Ack(ack) = frame.body else {
        panic!("expected ACK");
    };
    assert_eq!(
        ack.actions,
        [
            Action::set_var(VarScope::Session, "verdict", Value::Int32(1)),
            Action::set_var(VarScope::Session, "verdict", Value::Int32(2)),
        ]
    );

    engine.stop();
}

#[tokio::test]
async fn handler_failure_skips_only_that_message() {
    let (engine, addr) = spawn_engine(
        Engine::builder()
            .port(0)
            .handler(PerMessageHandler)
            .build()
            .unwrap(),
    )
    .await;

    let mut peer = Peer::connect(addr).await;
    peer.handshake().await;

    peer.send(&notify(
        4,
        1,
        vec![
            Message::new("first"),
            Message::new("boom"),
            Message::new("third"),
        ],
    ))
    .await;

    let frame = peer.recv().await;
    let FrameBody::Ack(ack) = frame.body else {
        panic!("expected ACK");
    };
    assert_eq!(
        ack.actions,
        [
            Action::set_var(VarScope::Transaction, "first", true),
            Action::set_var(VarScope::Transaction, "third", true),
        ]
    );

    // The connection survived the failure.
    peer.send(&notify(4, 2, vec![Message::new("after")])).await;
    let frame = peer.recv().await;
    assert_eq!(frame.metadata.frame_id, 2);

    assert_eq!(engine.metrics().snapshot().handler_errors_total, 1);

    engine.stop();
}

#[tokio::test]
async fn haproxy_disconnect_is_answered_and_closes() {
    let (engine, addr) =
        spawn_engine(Engine::builder().port(0).handler(ScoreHandler).build().unwrap()).await;

    let mut peer = Peer::connect(addr).await;
    peer.handshake().await;

    peer.send(&Frame::new(
        Metadata::default(),
        FrameBody::HaproxyDisconnect(Disconnect::new(DisconnectStatus::Stop, "bye")),
    ))
    .await;

    let frame = peer.recv().await;
    let FrameBody::AgentDisconnect(goodbye) = frame.body else {
        panic!("expected AGENT-DISCONNECT, got {:?}", frame.body.kind());
    };
    assert_eq!(goodbye.status_kind(), Some(DisconnectStatus::Ok));
    assert!(peer.try_recv().await.is_none());

    engine.stop();
}

#[tokio::test]
async fn oversized_frame_closes_only_that_connection() {
    let (engine, addr) = spawn_engine(
        Engine::builder()
            .port(0)
            .handler(ScoreHandler)
            .max_frame_size(4096)
            .build()
            .unwrap(),
    )
    .await;

    let mut peer = Peer::connect(addr).await;
    peer.send(&haproxy_hello(4096)).await;
    peer.recv().await;

    // Declare a 5000-byte frame; the body is never sent and never read.
    peer.send_raw(&5000u32.to_be_bytes()).await;

    let frame = peer.recv().await;
    let FrameBody::AgentDisconnect(goodbye) = frame.body else {
        panic!("expected AGENT-DISCONNECT, got {:?}", frame.body.kind());
    };
    assert_eq!(goodbye.status_kind(), Some(DisconnectStatus::Abort));
    assert!(peer.try_recv().await.is_none());

    // The engine keeps accepting fresh connections.
    let mut second = Peer::connect(addr).await;
    second.send(&haproxy_hello(4096)).await;
    let frame = second.recv().await;
    assert!(matches!(frame.body, FrameBody::AgentHello(_)));

    // Give the first connection task a moment to record its exit.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.metrics().snapshot().protocol_errors_total, 1);

    engine.stop();
}

#[tokio::test]
async fn first_frame_must_be_haproxy_hello() {
    let (engine, addr) =
        spawn_engine(Engine::builder().port(0).handler(ScoreHandler).build().unwrap()).await;

    let mut peer = Peer::connect(addr).await;
    peer.send(&notify(1, 1, vec![Message::new("too-early")])).await;

    // Closed outright, no AGENT-HELLO and no disconnect frame.
    assert!(peer.try_recv().await.is_none());

    engine.stop();
}

#[tokio::test]
async fn unsupported_version_gets_a_stop_disconnect() {
    let (engine, addr) =
        spawn_engine(Engine::builder().port(0).handler(ScoreHandler).build().unwrap()).await;

    let mut peer = Peer::connect(addr).await;
    peer.send(&Frame::new(
        Metadata::default(),
        FrameBody::HaproxyHello(HaproxyHello {
            supported_versions: vec!["1.0".to_string()],
            max_frame_size: 16_384,
            capabilities: vec![],
            healthcheck: false,
            engine_id: None,
        }),
    ))
    .await;

    let frame = peer.recv().await;
    let FrameBody::AgentDisconnect(goodbye) = frame.body else {
        panic!("expected AGENT-DISCONNECT, got {:?}", frame.body.kind());
    };
    assert_eq!(goodbye.status_kind(), Some(DisconnectStatus::Stop));
    assert!(peer.try_recv().await.is_none());

    engine.stop();
}

#[tokio::test]
async fn healthcheck_hello_closes_after_the_reply() {
    let (engine, addr) =
        spawn_engine(Engine::builder().port(0).handler(ScoreHandler).build().unwrap()).await;

    let mut peer = Peer::connect(addr).await;
    peer.send(&Frame::new(
        Metadata::default(),
        FrameBody::HaproxyHello(HaproxyHello {
            supported_versions: vec!["2.0".to_string()],
            max_frame_size: 16_384,
            capabilities: vec![],
            healthcheck: true,
            engine_id: None,
        }),
    ))
    .await;

    let frame = peer.recv().await;
    assert!(matches!(frame.body, FrameBody::AgentHello(_)));
    assert!(peer.try_recv().await.is_none());

    engine.stop();
}

#[tokio::test]
async fn unhandled_frame_kinds_are_ignored() {
    let (engine, addr) =
        spawn_engine(Engine::builder().port(0).handler(ScoreHandler).build().unwrap()).await;

    let mut peer = Peer::connect(addr).await;
    peer.handshake().await;

    // An ACK from the load balancer side means nothing to the agent; it must
    // be ignored rather than kill the connection.
    peer.send(&Frame::ack(9, 9, vec![])).await;
    peer.send(&notify(2, 1, vec![Message::new("still-alive")]))
        .await;

    let frame = peer.recv().await;
    assert_eq!(frame.metadata.stream_id, 2);
    assert!(matches!(frame.body, FrameBody::Ack(_)));

    engine.stop();
}

#[tokio::test]
async fn idle_connection_is_closed_without_a_reply() {
    let (engine, addr) = spawn_engine(
        Engine::builder()
            .port(0)
            .handler(ScoreHandler)
            .idle_timeout(Duration::from_millis(80))
            .build()
            .unwrap(),
    )
    .await;

    let mut peer = Peer::connect(addr).await;
    peer.handshake().await;

    // No traffic; the agent drops the connection at the deadline.
    assert!(peer.try_recv().await.is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.metrics().snapshot().idle_timeouts_total, 1);

    engine.stop();
}

#[tokio::test]
async fn fragmented_notify_is_a_protocol_error() {
    let (engine, addr) =
        spawn_engine(Engine::builder().port(0).handler(ScoreHandler).build().unwrap()).await;

    let mut peer = Peer::connect(addr).await;
    peer.handshake().await;

    let mut fragmented = notify(5, 1, vec![Message::new("partial")]);
    fragmented.metadata.flags = FrameFlags::FRAGMENTED;
    peer.send(&fragmented).await;

    let frame = peer.recv().await;
    let FrameBody::AgentDisconnect(goodbye) = frame.body else {
        panic!("expected AGENT-DISCONNECT, got {:?}", frame.body.kind());
    };
    assert_eq!(goodbye.status_kind(), Some(DisconnectStatus::Abort));
    assert!(peer.try_recv().await.is_none());

    engine.stop();
}

#[tokio::test]
async fn stop_shuts_the_listener_down() {
    let (engine, addr) =
        spawn_engine(Engine::builder().port(0).handler(ScoreHandler).build().unwrap()).await;

    engine.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!engine.is_running());
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn second_start_fails_while_running() {
    let (engine, _addr) =
        spawn_engine(Engine::builder().port(0).handler(ScoreHandler).build().unwrap()).await;

    assert!(matches!(
        engine.start().await,
        Err(AgentError::Configuration(_))
    ));

    engine.stop();
}
