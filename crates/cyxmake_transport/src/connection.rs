//! Shared per-connection machinery for the server and client sides.

use crate::Result;
use cyxmake_protocol::Message;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Stable identity of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Error = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            4 => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Outcome of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued for transmission in FIFO order.
    Queued,
    /// Outbound queue is full; backpressure, try again later.
    WouldBlock,
    /// Connection is gone.
    Closed,
}

impl SendOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SendOutcome::Queued)
    }
}

/// Callbacks a transport user implements.
///
/// Invoked from the connection's service task; implementations must not
/// block for long and must not call back into the transport's accept path.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connect(&self, conn: &Connection);
    fn on_message(&self, conn: &Connection, msg: Message);
    fn on_disconnect(&self, conn: &Connection, reason: &str);
    fn on_error(&self, conn: &Connection, message: &str);
}

pub(crate) enum Outbound {
    Frame(Box<Message>),
    Close,
}

/// Cheap clonable handle to one live connection.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: Arc<str>,
    tx: mpsc::Sender<Outbound>,
    state: Arc<AtomicU8>,
}

impl Connection {
    pub(crate) fn new(peer: String, queue_depth: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let conn = Self {
            id: ConnectionId::new(),
            peer: peer.into(),
            tx,
            state: Arc::new(AtomicU8::new(ConnectionState::Connecting as u8)),
        };
        (conn, rx)
    }

    /// Placeholder handle for callbacks that outlive the socket (e.g. the
    /// client's terminal give-up notification).
    pub(crate) fn closed(peer: String) -> Self {
        let (conn, _rx) = Self::new(peer, 1);
        conn.set_state(ConnectionState::Disconnected);
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Queue a message for transmission. Never blocks.
    pub fn send(&self, msg: Message) -> SendOutcome {
        if !matches!(self.state(), ConnectionState::Connected) {
            return SendOutcome::Closed;
        }
        match self.tx.try_send(Outbound::Frame(Box::new(msg))) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::WouldBlock,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Request an orderly close. Queued frames are flushed first.
    pub fn close(&self) {
        self.set_state(ConnectionState::Closing);
        let _ = self.tx.try_send(Outbound::Close);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Drive one established WebSocket until it closes.
///
/// Handles the text/binary pairing rule: a text frame whose envelope
/// declares a binary body is buffered until the next binary frame on this
/// connection, then dispatched as one message. Oversize frames raise
/// `on_error` and drop the pending buffer without closing the socket.
pub(crate) async fn run_connection<S>(
    ws: WebSocketStream<S>,
    conn: Connection,
    mut rx: mpsc::Receiver<Outbound>,
    handler: Arc<dyn ConnectionHandler>,
    max_frame_bytes: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    conn.set_state(ConnectionState::Connected);
    handler.on_connect(&conn);

    // Envelope awaiting its declared binary body.
    let mut pending: Option<Message> = None;
    let mut reason = "closed";

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.len() > max_frame_bytes {
                            handler.on_error(
                                &conn,
                                &format!(
                                    "oversize text frame: {} bytes (limit {})",
                                    text.len(),
                                    max_frame_bytes
                                ),
                            );
                            pending = None;
                            continue;
                        }
                        if pending.is_some() {
                            handler.on_error(
                                &conn,
                                "text frame arrived while a binary body was pending",
                            );
                            pending = None;
                        }
                        match Message::decode(text.as_str()) {
                            Ok(msg) => {
                                if msg.pending_binary().is_some() {
                                    pending = Some(msg);
                                } else {
                                    handler.on_message(&conn, msg);
                                }
                            }
                            Err(e) => {
                                handler.on_error(&conn, &format!("undecodable frame: {}", e));
                            }
                        }
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        if bytes.len() > max_frame_bytes {
                            handler.on_error(
                                &conn,
                                &format!(
                                    "oversize binary frame: {} bytes (limit {})",
                                    bytes.len(),
                                    max_frame_bytes
                                ),
                            );
                            pending = None;
                            continue;
                        }
                        match pending.take() {
                            Some(mut msg) => match msg.attach_binary(Vec::from(bytes.as_ref())) {
                                Ok(()) => handler.on_message(&conn, msg),
                                Err(e) => handler.on_error(&conn, &e.to_string()),
                            },
                            None => {
                                handler.on_error(&conn, "binary frame without a preceding envelope");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sink.send(WsMessage::Pong(data)).await.is_err() {
                            reason = "write-failed";
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) => {
                        reason = "peer-closed";
                        break;
                    }
                    Some(Ok(WsMessage::Frame(_))) => {
                        // Raw frames are not surfaced in normal reads.
                    }
                    Some(Err(e)) => {
                        debug!("connection {} read error: {}", conn.id(), e);
                        handler.on_error(&conn, &format!("read error: {}", e));
                        reason = "read-failed";
                        break;
                    }
                    None => {
                        reason = "peer-closed";
                        break;
                    }
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(Outbound::Frame(msg)) => {
                        if let Err(e) = write_message(&mut sink, &msg).await {
                            warn!("connection {} write error: {}", conn.id(), e);
                            handler.on_error(&conn, &format!("write error: {}", e));
                            reason = "write-failed";
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        reason = "closed";
                        break;
                    }
                }
            }
        }
    }

    conn.set_state(ConnectionState::Disconnected);
    handler.on_disconnect(&conn, reason);
}

async fn write_message<S>(
    sink: &mut futures_util::stream::SplitSink<WebSocketStream<S>, WsMessage>,
    msg: &Message,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (text, binary) = msg.encode().map_err(|e| {
        crate::TransportError::Handshake(format!("encode failed: {}", e))
    })?;
    sink.send(WsMessage::text(text)).await?;
    if let Some(bytes) = binary {
        sink.send(WsMessage::binary(bytes.to_vec())).await?;
    }
    Ok(())
}
