//! Worker-side WebSocket client with auto-reconnect.

use crate::connection::{run_connection, Connection, ConnectionHandler};
use crate::{Result, TransportError};
use cyxmake_protocol::defaults::{
    DEFAULT_MAX_FRAME_BYTES, DEFAULT_SEND_QUEUE_DEPTH, SUBPROTOCOL,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port` or `wss://host:port`.
    pub url: String,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_reconnect_attempts: u32,
    pub max_frame_bytes: usize,
    pub send_queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://127.0.0.1:{}", cyxmake_protocol::defaults::DEFAULT_PORT),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            send_queue_depth: DEFAULT_SEND_QUEUE_DEPTH,
        }
    }
}

pub struct WsClient {
    config: ClientConfig,
    handler: Arc<dyn ConnectionHandler>,
    current: Arc<Mutex<Option<Connection>>>,
    stopped: Arc<AtomicBool>,
}

impl WsClient {
    pub fn new(config: ClientConfig, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            config,
            handler,
            current: Arc::new(Mutex::new(None)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Live connection handle, if currently connected.
    pub fn connection(&self) -> Option<Connection> {
        self.current.lock().unwrap().clone()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(conn) = self.connection() {
            conn.close();
        }
    }

    /// Connect and service the link, reconnecting with exponential delay.
    ///
    /// Returns when `stop` was called, or after the attempt budget is
    /// exhausted; in the latter case a terminal `on_disconnect` with
    /// reason `max-attempts` has been delivered.
    pub async fn run(&self) -> Result<()> {
        let mut failed_attempts: u32 = 0;

        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(());
            }

            match self.connect_once().await {
                Ok(()) => {
                    // Served a full session; reconnect from a clean slate,
                    // but not in a tight loop.
                    failed_attempts = 0;
                    tokio::time::sleep(self.config.reconnect_initial_delay).await;
                }
                Err(e) => {
                    failed_attempts += 1;
                    warn!(
                        "connect to {} failed (attempt {}/{}): {}",
                        self.config.url, failed_attempts, self.config.max_reconnect_attempts, e
                    );
                    if failed_attempts >= self.config.max_reconnect_attempts {
                        let placeholder = Connection::closed(self.config.url.clone());
                        self.handler.on_disconnect(&placeholder, "max-attempts");
                        return Err(e);
                    }
                    tokio::time::sleep(self.backoff_delay(failed_attempts)).await;
                }
            }
        }
    }

    fn backoff_delay(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        let delay = self
            .config
            .reconnect_initial_delay
            .saturating_mul(1u32 << exp);
        delay.min(self.config.reconnect_max_delay)
    }

    async fn connect_once(&self) -> Result<()> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|_| TransportError::InvalidUrl(self.config.url.clone()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            SUBPROTOCOL.parse().expect("static header value"),
        );

        let (ws, _response) = tokio_tungstenite::connect_async_with_config(
            request,
            Some(crate::server::unlimited_ws_config()),
            false,
        )
        .await?;
        info!("connected to {}", self.config.url);

        let (conn, rx) = Connection::new(self.config.url.clone(), self.config.send_queue_depth);
        *self.current.lock().unwrap() = Some(conn.clone());

        run_connection(
            ws,
            conn,
            rx,
            Arc::clone(&self.handler),
            self.config.max_frame_bytes,
        )
        .await;

        *self.current.lock().unwrap() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl ConnectionHandler for NullHandler {
        fn on_connect(&self, _conn: &Connection) {}
        fn on_message(&self, _conn: &Connection, _msg: cyxmake_protocol::Message) {}
        fn on_disconnect(&self, _conn: &Connection, _reason: &str) {}
        fn on_error(&self, _conn: &Connection, _message: &str) {}
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ClientConfig {
            reconnect_initial_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(2),
            ..ClientConfig::default()
        };
        let client = WsClient::new(config, Arc::new(NullHandler));

        assert_eq!(client.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(client.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(client.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(client.backoff_delay(10), Duration::from_secs(2));
    }
}
