//! Protocol-level error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to parse message envelope: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("envelope is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid uuid in field '{field}': {value}")]
    InvalidId { field: &'static str, value: String },

    #[error("binary body size mismatch: declared {declared} bytes, got {got}")]
    BinarySizeMismatch { declared: u64, got: u64 },

    #[error("message of type {0} does not carry a binary body")]
    UnexpectedBinary(String),

    #[error("payload for {kind} could not be decoded: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
