//! Canonical default values shared across coordinator and worker.

/// Default coordinator listen port (same port for wss:// when TLS is on).
pub const DEFAULT_PORT: u16 = 9876;

/// WebSocket subprotocol negotiated during the upgrade handshake.
pub const SUBPROTOCOL: &str = "cyxmake-distributed";

/// Interval announced to workers in WELCOME.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// A worker is considered stale after this long without a heartbeat.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// Missed-heartbeat count at which a worker is demoted to OFFLINE.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Delay before an OFFLINE worker record is dropped (when auto-removal is on).
pub const DEFAULT_OFFLINE_REMOVAL_DELAY_SECS: u64 = 60;

/// Largest frame the transport will accept before raising an error.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Outbound queue depth per connection; senders observe WouldBlock when full.
pub const DEFAULT_SEND_QUEUE_DEPTH: usize = 64;

/// Retry budget applied to jobs that do not specify their own.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Job timeout applied when the spec carries none.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;

/// Entries at or above this size are compressed before hitting the store.
pub const DEFAULT_COMPRESSION_THRESHOLD: u64 = 4 * 1024;

/// Soft fraction of max cache size at which eviction starts.
pub const DEFAULT_EVICTION_WATERMARK: f64 = 0.9;

/// Fraction of max cache size eviction tries to leave free.
pub const DEFAULT_EVICTION_TARGET_FREE: f64 = 0.2;

pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
pub const JOB_TIMED_OUT_MESSAGE: &str = "job timed out";
