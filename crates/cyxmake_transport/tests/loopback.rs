//! Loopback tests for the WebSocket transport: handshake, echo,
//! binary-frame pairing, and broadcast.

use cyxmake_protocol::{
    ArtifactPushPayload, HelloPayload, Message, MessageType, SystemInfo, WelcomePayload,
};
use cyxmake_transport::{
    ClientConfig, Connection, ConnectionHandler, ServerConfig, WsClient, WsServer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Server side: answers HELLO with WELCOME and forwards everything else to
/// the test via a channel.
struct EchoServer {
    seen: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandler for EchoServer {
    fn on_connect(&self, _conn: &Connection) {}

    fn on_message(&self, conn: &Connection, msg: Message) {
        if msg.kind == MessageType::Hello {
            let welcome = WelcomePayload {
                worker_id: uuid::Uuid::new_v4(),
                server_id: uuid::Uuid::new_v4(),
                heartbeat_interval_secs: 10,
            };
            let reply = msg
                .response_with_payload(MessageType::Welcome, &welcome)
                .unwrap();
            assert!(conn.send(reply).is_queued());
        }
        let _ = self.seen.send(msg);
    }

    fn on_disconnect(&self, _conn: &Connection, _reason: &str) {}
    fn on_error(&self, _conn: &Connection, _message: &str) {}
}

/// Client side: forwards received messages and disconnect reasons.
struct RecordingClient {
    messages: mpsc::UnboundedSender<Message>,
    disconnects: mpsc::UnboundedSender<String>,
}

impl ConnectionHandler for RecordingClient {
    fn on_connect(&self, _conn: &Connection) {}

    fn on_message(&self, _conn: &Connection, msg: Message) {
        let _ = self.messages.send(msg);
    }

    fn on_disconnect(&self, _conn: &Connection, reason: &str) {
        let _ = self.disconnects.send(reason.to_string());
    }

    fn on_error(&self, _conn: &Connection, _message: &str) {}
}

fn hello() -> Message {
    let payload = HelloPayload {
        name: "w1".to_string(),
        hostname: "localhost".to_string(),
        port: 0,
        system_info: SystemInfo::default(),
        capabilities: cyxmake_protocol::Capabilities::COMPILE_C,
        tools: Default::default(),
        max_jobs: 2,
        auth_token: None,
    };
    Message::with_payload(MessageType::Hello, &payload).unwrap()
}

async fn start_server(
    handler: Arc<dyn ConnectionHandler>,
) -> (cyxmake_transport::ServerHandle, u16) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    };
    let server = WsServer::bind(config, handler).await.unwrap();
    let port = server.local_addr().unwrap().port();
    let handle = server.handle();
    tokio::spawn(server.run());
    (handle, port)
}

async fn connected_client(
    port: u16,
    handler: Arc<dyn ConnectionHandler>,
) -> (Arc<WsClient>, Connection) {
    let config = ClientConfig {
        url: format!("ws://127.0.0.1:{}", port),
        ..ClientConfig::default()
    };
    let client = Arc::new(WsClient::new(config, handler));
    let runner = Arc::clone(&client);
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    // Wait for the connection to come up.
    for _ in 0..100 {
        if let Some(conn) = client.connection() {
            if conn.state() == cyxmake_transport::ConnectionState::Connected {
                return (client, conn);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("client never connected");
}

#[tokio::test]
async fn test_hello_welcome_roundtrip() {
    let (server_seen_tx, mut server_seen) = mpsc::unbounded_channel();
    let (handle, port) = start_server(Arc::new(EchoServer { seen: server_seen_tx })).await;

    let (client_msgs_tx, mut client_msgs) = mpsc::unbounded_channel();
    let (disc_tx, _disc) = mpsc::unbounded_channel();
    let (_client, conn) = connected_client(
        port,
        Arc::new(RecordingClient {
            messages: client_msgs_tx,
            disconnects: disc_tx,
        }),
    )
    .await;

    let request = hello();
    let request_id = request.id;
    assert!(conn.send(request).is_queued());

    let received = tokio::time::timeout(Duration::from_secs(5), server_seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.kind, MessageType::Hello);

    let welcome = tokio::time::timeout(Duration::from_secs(5), client_msgs.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(welcome.kind, MessageType::Welcome);
    // Correlation: the response points back at the request.
    assert_eq!(welcome.correlation_id, Some(request_id));

    assert_eq!(handle.connection_count(), 1);
}

#[tokio::test]
async fn test_binary_body_travels_with_envelope() {
    let (server_seen_tx, mut server_seen) = mpsc::unbounded_channel();
    let (_handle, port) = start_server(Arc::new(EchoServer { seen: server_seen_tx })).await;

    let (client_msgs_tx, _client_msgs) = mpsc::unbounded_channel();
    let (disc_tx, _disc) = mpsc::unbounded_channel();
    let (_client, conn) = connected_client(
        port,
        Arc::new(RecordingClient {
            messages: client_msgs_tx,
            disconnects: disc_tx,
        }),
    )
    .await;

    let body = vec![0x4fu8; 1024];
    let push = ArtifactPushPayload {
        cache_key: "aa".repeat(32),
        content_hash: "bb".repeat(32),
        artifact_type: "object".to_string(),
        build_id: None,
    };
    let msg = Message::with_payload(MessageType::ArtifactPush, &push)
        .unwrap()
        .with_binary(body.clone());
    assert!(conn.send(msg).is_queued());

    let received = tokio::time::timeout(Duration::from_secs(5), server_seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.kind, MessageType::ArtifactPush);
    assert_eq!(received.binary.as_deref(), Some(body.as_slice()));
    assert_eq!(received.pending_binary(), None);
}

#[tokio::test]
async fn test_broadcast_reaches_all_connections() {
    let (server_seen_tx, _server_seen) = mpsc::unbounded_channel();
    let (handle, port) = start_server(Arc::new(EchoServer { seen: server_seen_tx })).await;

    let mut client_rxs = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let (tx, rx) = mpsc::unbounded_channel();
        let (disc_tx, _disc) = mpsc::unbounded_channel();
        let pair = connected_client(
            port,
            Arc::new(RecordingClient {
                messages: tx,
                disconnects: disc_tx,
            }),
        )
        .await;
        clients.push(pair);
        client_rxs.push(rx);
    }

    let shutdown = Message::new(MessageType::Shutdown);
    assert_eq!(handle.broadcast(&shutdown), 3);

    for rx in &mut client_rxs {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind, MessageType::Shutdown);
    }
}

#[tokio::test]
async fn test_reconnect_gives_up_with_terminal_reason() {
    // Nothing is listening on this port.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (msgs_tx, _msgs) = mpsc::unbounded_channel();
    let (disc_tx, mut disconnects) = mpsc::unbounded_channel();
    let config = ClientConfig {
        url: format!("ws://127.0.0.1:{}", port),
        reconnect_initial_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(50),
        max_reconnect_attempts: 3,
        ..ClientConfig::default()
    };
    let client = WsClient::new(
        config,
        Arc::new(RecordingClient {
            messages: msgs_tx,
            disconnects: disc_tx,
        }),
    );

    assert!(client.run().await.is_err());
    let reason = tokio::time::timeout(Duration::from_secs(5), disconnects.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, "max-attempts");
}
