//! WebSocket transport for the distributed build plane.
//!
//! Both sides speak the same framed protocol: one JSON text frame per
//! message, optionally followed by a single binary frame when the envelope
//! declares `has_binary`. Delivery is FIFO per connection; nothing is
//! ordered across connections.
//!
//! The send path never blocks: each connection owns a bounded outbound
//! queue and callers observe [`SendOutcome::WouldBlock`] when it is full.

pub mod client;
pub mod connection;
pub mod server;

pub use client::{ClientConfig, WsClient};
pub use connection::{Connection, ConnectionHandler, ConnectionId, ConnectionState, SendOutcome};
pub use server::{ServerConfig, ServerHandle, TlsConfig, WsServer};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    Oversize { size: usize, max: usize },

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("invalid url '{0}'")]
    InvalidUrl(String),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
