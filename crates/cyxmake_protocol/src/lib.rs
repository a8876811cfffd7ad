//! Wire protocol for coordinator <-> worker communication.
//!
//! # Envelope
//!
//! Messages are UTF-8 JSON text frames:
//!
//! ```text
//! {"type": "JOB_REQUEST", "id": "<uuid>", "correlation_id": "<uuid>",
//!  "timestamp": 1712345678901, "sender": "<id>", "payload": {...},
//!  "has_binary": true, "binary_size": 4096}
//! ```
//!
//! A message with `has_binary = true` is followed by exactly one binary
//! frame on the same connection carrying `binary_size` bytes; receivers
//! buffer the text frame until the binary body arrives. The codec imposes
//! no size limit; that is a transport concern.
//!
//! Every response copies the request's `id` into `correlation_id`.

pub mod auth;
pub mod defaults;
pub mod error;
pub mod types;

pub use error::{ProtocolError, Result};
pub use types::{
    ArtifactAckPayload,
    ArtifactPushPayload,
    ArtifactRequestPayload,
    ArtifactResponsePayload,
    AuthChallengePayload,
    AuthFailedPayload,
    AuthMethod,
    AuthResponsePayload,
    AuthSuccessPayload,
    BuildState,
    // Canonical enums (use these everywhere)
    Capabilities,
    DistributionStrategy,
    ErrorPayload,
    FileTransferAckPayload,
    FileTransferChunkPayload,
    FileTransferEndPayload,
    FileTransferStartPayload,
    GoodbyePayload,
    // Handshake / steady-state payloads
    HelloPayload,
    HeartbeatPayload,
    JobAcceptPayload,
    JobCancelPayload,
    JobCancelledPayload,
    JobFailedPayload,
    JobKind,
    JobProgressPayload,
    JobRejectPayload,
    JobResult,
    JobSpec,
    JobState,
    LoadBalancing,
    ShutdownPayload,
    StatusUpdatePayload,
    SystemInfo,
    ToolInfo,
    WelcomePayload,
    WorkerState,
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Message type identifiers as they appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    Welcome,
    Goodbye,
    AuthChallenge,
    AuthResponse,
    AuthSuccess,
    AuthFailed,
    Heartbeat,
    HeartbeatAck,
    StatusUpdate,
    JobRequest,
    JobAccept,
    JobReject,
    JobProgress,
    JobComplete,
    JobFailed,
    JobCancel,
    JobCancelled,
    ArtifactRequest,
    ArtifactResponse,
    ArtifactPush,
    ArtifactAck,
    FileTransferStart,
    FileTransferChunk,
    FileTransferEnd,
    FileTransferAck,
    Shutdown,
    Error,
    /// A type this build does not know. Decoded losslessly so the
    /// dispatcher can answer with ERROR preserving the request ids.
    Other(String),
}

impl MessageType {
    pub fn as_wire(&self) -> &str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::Welcome => "WELCOME",
            MessageType::Goodbye => "GOODBYE",
            MessageType::AuthChallenge => "AUTH_CHALLENGE",
            MessageType::AuthResponse => "AUTH_RESPONSE",
            MessageType::AuthSuccess => "AUTH_SUCCESS",
            MessageType::AuthFailed => "AUTH_FAILED",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::HeartbeatAck => "HEARTBEAT_ACK",
            MessageType::StatusUpdate => "STATUS_UPDATE",
            MessageType::JobRequest => "JOB_REQUEST",
            MessageType::JobAccept => "JOB_ACCEPT",
            MessageType::JobReject => "JOB_REJECT",
            MessageType::JobProgress => "JOB_PROGRESS",
            MessageType::JobComplete => "JOB_COMPLETE",
            MessageType::JobFailed => "JOB_FAILED",
            MessageType::JobCancel => "JOB_CANCEL",
            MessageType::JobCancelled => "JOB_CANCELLED",
            MessageType::ArtifactRequest => "ARTIFACT_REQUEST",
            MessageType::ArtifactResponse => "ARTIFACT_RESPONSE",
            MessageType::ArtifactPush => "ARTIFACT_PUSH",
            MessageType::ArtifactAck => "ARTIFACT_ACK",
            MessageType::FileTransferStart => "FILE_TRANSFER_START",
            MessageType::FileTransferChunk => "FILE_TRANSFER_CHUNK",
            MessageType::FileTransferEnd => "FILE_TRANSFER_END",
            MessageType::FileTransferAck => "FILE_TRANSFER_ACK",
            MessageType::Shutdown => "SHUTDOWN",
            MessageType::Error => "ERROR",
            MessageType::Other(name) => name,
        }
    }

    pub fn from_wire(name: &str) -> Self {
        match name {
            "HELLO" => MessageType::Hello,
            "WELCOME" => MessageType::Welcome,
            "GOODBYE" => MessageType::Goodbye,
            "AUTH_CHALLENGE" => MessageType::AuthChallenge,
            "AUTH_RESPONSE" => MessageType::AuthResponse,
            "AUTH_SUCCESS" => MessageType::AuthSuccess,
            "AUTH_FAILED" => MessageType::AuthFailed,
            "HEARTBEAT" => MessageType::Heartbeat,
            "HEARTBEAT_ACK" => MessageType::HeartbeatAck,
            "STATUS_UPDATE" => MessageType::StatusUpdate,
            "JOB_REQUEST" => MessageType::JobRequest,
            "JOB_ACCEPT" => MessageType::JobAccept,
            "JOB_REJECT" => MessageType::JobReject,
            "JOB_PROGRESS" => MessageType::JobProgress,
            "JOB_COMPLETE" => MessageType::JobComplete,
            "JOB_FAILED" => MessageType::JobFailed,
            "JOB_CANCEL" => MessageType::JobCancel,
            "JOB_CANCELLED" => MessageType::JobCancelled,
            "ARTIFACT_REQUEST" => MessageType::ArtifactRequest,
            "ARTIFACT_RESPONSE" => MessageType::ArtifactResponse,
            "ARTIFACT_PUSH" => MessageType::ArtifactPush,
            "ARTIFACT_ACK" => MessageType::ArtifactAck,
            "FILE_TRANSFER_START" => MessageType::FileTransferStart,
            "FILE_TRANSFER_CHUNK" => MessageType::FileTransferChunk,
            "FILE_TRANSFER_END" => MessageType::FileTransferEnd,
            "FILE_TRANSFER_ACK" => MessageType::FileTransferAck,
            "SHUTDOWN" => MessageType::Shutdown,
            "ERROR" => MessageType::Error,
            other => MessageType::Other(other.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, MessageType::Other(_))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageType::from_wire(&raw))
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fresh message id.
pub fn generate_id() -> Uuid {
    Uuid::new_v4()
}

/// A correlated protocol message with an optional out-of-band binary body.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageType,
    pub id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub timestamp: u64,
    pub sender: Option<String>,
    pub payload: Value,
    pub binary: Option<Vec<u8>>,
    /// Declared binary body size from a decoded envelope; `Some` until the
    /// following binary frame is attached.
    expected_binary: Option<u64>,
}

/// Serialized shape of the envelope. Unknown fields are ignored on input.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: MessageType,
    id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Uuid>,
    timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    has_binary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    binary_size: Option<u64>,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            id: generate_id(),
            correlation_id: None,
            timestamp: now_ms(),
            sender: None,
            payload: Value::Null,
            binary: None,
            expected_binary: None,
        }
    }

    /// Message with a typed payload.
    pub fn with_payload<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self> {
        let mut msg = Self::new(kind);
        msg.payload = serde_json::to_value(payload)?;
        Ok(msg)
    }

    /// Response to this message: fresh id, `correlation_id` set to our id.
    pub fn response(&self, kind: MessageType) -> Self {
        let mut msg = Self::new(kind);
        msg.correlation_id = Some(self.id);
        msg
    }

    pub fn response_with_payload<T: Serialize>(
        &self,
        kind: MessageType,
        payload: &T,
    ) -> Result<Self> {
        let mut msg = self.response(kind);
        msg.payload = serde_json::to_value(payload)?;
        Ok(msg)
    }

    /// ERROR reply preserving the request's id as correlation.
    pub fn error_response(&self, payload: &ErrorPayload) -> Self {
        self.response_with_payload(MessageType::Error, payload)
            .unwrap_or_else(|_| self.response(MessageType::Error))
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_binary(mut self, bytes: Vec<u8>) -> Self {
        self.binary = Some(bytes);
        self
    }

    /// Declared size of a binary body that has not arrived yet.
    pub fn pending_binary(&self) -> Option<u64> {
        if self.binary.is_some() {
            None
        } else {
            self.expected_binary
        }
    }

    /// Attach the binary frame that followed this envelope.
    pub fn attach_binary(&mut self, bytes: Vec<u8>) -> Result<()> {
        match self.expected_binary {
            Some(declared) if declared != bytes.len() as u64 => {
                Err(ProtocolError::BinarySizeMismatch {
                    declared,
                    got: bytes.len() as u64,
                })
            }
            Some(_) => {
                self.binary = Some(bytes);
                Ok(())
            }
            None => Err(ProtocolError::UnexpectedBinary(
                self.kind.as_wire().to_string(),
            )),
        }
    }

    /// Serialize to the JSON text frame; the binary body, if present, is
    /// returned for the caller to frame separately.
    pub fn encode(&self) -> Result<(String, Option<&[u8]>)> {
        let envelope = WireEnvelope {
            kind: self.kind.clone(),
            id: self.id,
            correlation_id: self.correlation_id,
            timestamp: self.timestamp,
            sender: self.sender.clone(),
            payload: self.payload.clone(),
            has_binary: self.binary.is_some(),
            binary_size: self.binary.as_ref().map(|b| b.len() as u64),
        };
        let text = serde_json::to_string(&envelope)?;
        Ok((text, self.binary.as_deref()))
    }

    /// Parse a text frame. Unknown envelope fields are ignored; unknown
    /// message types decode as [`MessageType::Other`].
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: WireEnvelope = serde_json::from_str(text)?;
        let expected_binary = if envelope.has_binary {
            Some(envelope.binary_size.unwrap_or(0))
        } else {
            None
        };
        Ok(Self {
            kind: envelope.kind,
            id: envelope.id,
            correlation_id: envelope.correlation_id,
            timestamp: envelope.timestamp,
            sender: envelope.sender,
            payload: envelope.payload,
            binary: None,
            expected_binary,
        })
    }

    /// Decode the payload into a typed struct.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|source| ProtocolError::Payload {
            kind: self.kind.as_wire().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let hello = HelloPayload {
            name: "builder-1".to_string(),
            hostname: "host-a".to_string(),
            port: 0,
            system_info: SystemInfo::default(),
            capabilities: Capabilities::COMPILE_C,
            tools: Default::default(),
            max_jobs: 4,
            auth_token: None,
        };
        let msg = Message::with_payload(MessageType::Hello, &hello).unwrap();
        let (text, binary) = msg.encode().unwrap();
        assert!(binary.is_none());
        assert!(text.contains("\"type\":\"HELLO\""));
        assert!(!text.contains("has_binary"));

        let decoded = Message::decode(&text).unwrap();
        assert_eq!(decoded.kind, MessageType::Hello);
        assert_eq!(decoded.id, msg.id);
        let parsed: HelloPayload = decoded.parse_payload().unwrap();
        assert_eq!(parsed.name, "builder-1");
    }

    #[test]
    fn test_response_correlation() {
        let request = Message::new(MessageType::Heartbeat);
        let response = request.response(MessageType::HeartbeatAck);
        assert_eq!(response.correlation_id, Some(request.id));
        assert_ne!(response.id, request.id);
    }

    #[test]
    fn test_unknown_type_preserved() {
        let text = format!(
            r#"{{"type":"FROBNICATE","id":"{}","timestamp":12,"payload":{{"x":1}}}}"#,
            Uuid::new_v4()
        );
        let decoded = Message::decode(&text).unwrap();
        assert_eq!(
            decoded.kind,
            MessageType::Other("FROBNICATE".to_string())
        );
        assert!(!decoded.kind.is_known());

        let err = decoded.error_response(&ErrorPayload::new("ProtocolParse", "unknown type"));
        assert_eq!(err.kind, MessageType::Error);
        assert_eq!(err.correlation_id, Some(decoded.id));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let text = format!(
            r#"{{"type":"GOODBYE","id":"{}","timestamp":1,"flavour":"grape"}}"#,
            Uuid::new_v4()
        );
        let decoded = Message::decode(&text).unwrap();
        assert_eq!(decoded.kind, MessageType::Goodbye);
    }

    #[test]
    fn test_binary_body_declared_and_attached() {
        let push = ArtifactPushPayload {
            cache_key: "abcd".to_string(),
            content_hash: "ef01".to_string(),
            artifact_type: "object".to_string(),
            build_id: None,
        };
        let msg = Message::with_payload(MessageType::ArtifactPush, &push)
            .unwrap()
            .with_binary(vec![1, 2, 3, 4]);
        let (text, binary) = msg.encode().unwrap();
        assert_eq!(binary, Some(&[1u8, 2, 3, 4][..]));
        assert!(text.contains("\"has_binary\":true"));
        assert!(text.contains("\"binary_size\":4"));

        let mut decoded = Message::decode(&text).unwrap();
        assert_eq!(decoded.pending_binary(), Some(4));
        decoded.attach_binary(vec![1, 2, 3, 4]).unwrap();
        assert_eq!(decoded.pending_binary(), None);
        assert_eq!(decoded.binary.as_deref(), Some(&[1u8, 2, 3, 4][..]));
    }

    #[test]
    fn test_binary_size_mismatch() {
        let msg = Message::new(MessageType::ArtifactPush).with_binary(vec![0u8; 8]);
        let (text, _) = msg.encode().unwrap();
        let mut decoded = Message::decode(&text).unwrap();
        let err = decoded.attach_binary(vec![0u8; 5]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BinarySizeMismatch { declared: 8, got: 5 }
        ));
    }

    #[test]
    fn test_attach_binary_without_declaration() {
        let msg = Message::new(MessageType::Heartbeat);
        let (text, _) = msg.encode().unwrap();
        let mut decoded = Message::decode(&text).unwrap();
        assert!(decoded.attach_binary(vec![1]).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Message::decode("not json").is_err());
        assert!(Message::decode(r#"{"type":"HELLO"}"#).is_err()); // no id
    }
}
