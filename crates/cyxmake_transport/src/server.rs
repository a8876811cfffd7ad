//! TLS-optional WebSocket server side of the transport.

use crate::connection::{run_connection, Connection, ConnectionHandler, ConnectionId};
use crate::{Result, TransportError};
use cyxmake_protocol::defaults::{
    DEFAULT_MAX_FRAME_BYTES, DEFAULT_PORT, DEFAULT_SEND_QUEUE_DEPTH, SUBPROTOCOL,
};
use cyxmake_protocol::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{info, warn};

/// The socket library must not cap frames below our own limit; the
/// transport enforces `max_frame_bytes` itself so an oversize frame is an
/// `on_error`, not a dead connection.
pub(crate) fn unlimited_ws_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(None)
        .max_frame_size(None)
}

/// PEM certificate chain and private key for `wss://`.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
    pub send_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            tls: None,
            max_connections: 64,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            send_queue_depth: DEFAULT_SEND_QUEUE_DEPTH,
        }
    }
}

/// Clonable view over the live connection set; outlives the accept loop.
#[derive(Clone)]
pub struct ServerHandle {
    connections: Arc<Mutex<HashMap<ConnectionId, Connection>>>,
}

impl ServerHandle {
    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.lock().unwrap().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Send to every live connection; returns how many accepted the frame.
    pub fn broadcast(&self, msg: &Message) -> usize {
        let conns: Vec<Connection> = {
            let guard = self.connections.lock().unwrap();
            guard.values().cloned().collect()
        };
        conns
            .iter()
            .filter(|c| c.send(msg.clone()).is_queued())
            .count()
    }

    pub fn close_all(&self) {
        let conns: Vec<Connection> = {
            let guard = self.connections.lock().unwrap();
            guard.values().cloned().collect()
        };
        for conn in conns {
            conn.close();
        }
    }
}

/// Forwards handler callbacks and keeps the connection map in sync.
struct TrackingHandler {
    inner: Arc<dyn ConnectionHandler>,
    connections: Arc<Mutex<HashMap<ConnectionId, Connection>>>,
}

impl ConnectionHandler for TrackingHandler {
    fn on_connect(&self, conn: &Connection) {
        self.connections
            .lock()
            .unwrap()
            .insert(conn.id(), conn.clone());
        self.inner.on_connect(conn);
    }

    fn on_message(&self, conn: &Connection, msg: Message) {
        self.inner.on_message(conn, msg);
    }

    fn on_disconnect(&self, conn: &Connection, reason: &str) {
        self.connections.lock().unwrap().remove(&conn.id());
        self.inner.on_disconnect(conn, reason);
    }

    fn on_error(&self, conn: &Connection, message: &str) {
        self.inner.on_error(conn, message);
    }
}

pub struct WsServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handler: Arc<dyn ConnectionHandler>,
    handle: ServerHandle,
    config: ServerConfig,
}

impl WsServer {
    /// Bind the listen socket; `run` starts accepting.
    pub async fn bind(config: ServerConfig, handler: Arc<dyn ConnectionHandler>) -> Result<Self> {
        let addr = format!("{}:{}", config.bind_addr, config.port);
        let listener = TcpListener::bind(&addr).await?;

        let tls = match &config.tls {
            Some(paths) => Some(build_tls_acceptor(paths)?),
            None => None,
        };

        let scheme = if tls.is_some() { "wss" } else { "ws" };
        info!(
            "listening on {}://{}",
            scheme,
            listener.local_addr()?
        );

        let connections = Arc::new(Mutex::new(HashMap::new()));
        let handle = ServerHandle {
            connections: Arc::clone(&connections),
        };
        let handler = Arc::new(TrackingHandler {
            inner: handler,
            connections,
        });

        Ok(Self {
            listener,
            tls,
            handler,
            handle,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept loop; runs until the task is aborted.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;

            if self.handle.connection_count() >= self.config.max_connections {
                warn!("rejecting {}: connection limit reached", peer);
                drop(stream);
                continue;
            }

            let handler: Arc<dyn ConnectionHandler> = Arc::clone(&self.handler);
            let tls = self.tls.clone();
            let max_frame = self.config.max_frame_bytes;
            let queue_depth = self.config.send_queue_depth;

            tokio::spawn(async move {
                if let Err(e) =
                    serve_connection(stream, peer, tls, handler, max_frame, queue_depth).await
                {
                    warn!("connection from {} failed: {}", peer, e);
                }
            });
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    handler: Arc<dyn ConnectionHandler>,
    max_frame_bytes: usize,
    queue_depth: usize,
) -> Result<()> {
    let (conn, rx) = Connection::new(peer.to_string(), queue_depth);

    match tls {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            let ws = tokio_tungstenite::accept_hdr_async_with_config(
                tls_stream,
                negotiate_subprotocol,
                Some(unlimited_ws_config()),
            )
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
            run_connection(ws, conn, rx, handler, max_frame_bytes).await;
        }
        None => {
            let ws = tokio_tungstenite::accept_hdr_async_with_config(
                stream,
                negotiate_subprotocol,
                Some(unlimited_ws_config()),
            )
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
            run_connection(ws, conn, rx, handler, max_frame_bytes).await;
        }
    }

    Ok(())
}

/// Echo our subprotocol when the client offers it; reject a client that
/// insists on something else.
fn negotiate_subprotocol(
    request: &Request,
    mut response: Response,
) -> std::result::Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok());

    match offered {
        None => Ok(response),
        Some(list) if list.split(',').any(|p| p.trim() == SUBPROTOCOL) => {
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                SUBPROTOCOL.parse().expect("static header value"),
            );
            Ok(response)
        }
        Some(other) => {
            warn!("rejecting handshake with unsupported subprotocol '{}'", other);
            Err(ErrorResponse::new(Some(format!(
                "unsupported subprotocol '{}'",
                other
            ))))
        }
    }
}

fn build_tls_acceptor(paths: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(&paths.cert_path)?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
            .collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            paths.cert_path.display()
        )));
    }

    let key_file = std::fs::File::open(&paths.key_path)?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))?
            .ok_or_else(|| {
                TransportError::Tls(format!(
                    "no private key found in {}",
                    paths.key_path.display()
                ))
            })?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
