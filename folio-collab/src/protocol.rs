//! JSON wire protocol for live page editing.
//!
//! Every frame is a text WebSocket message carrying one envelope:
//! ```text
//! { "type": "<message type>", "payload": { ...type-specific... } }
//! ```
//!
//! | type            | direction | payload                          |
//! |-----------------|-----------|----------------------------------|
//! | `sync_request`  | in        | `{ page_id }`                    |
//! | `sync_response` | out       | `{ updates: [base64, ...] }`     |
//! | `update`        | in / out  | `{ update: base64 }`             |
//! | `awareness`     | in / out  | opaque presence object           |
//! | `error`         | out       | `{ message, code }`              |
//!
//! Binary CRDT deltas never travel raw: they are base64 (standard alphabet)
//! text inside the payload, both here and on the merge engine interface.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Recognized envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Client asks for the full update log of its page
    SyncRequest,
    /// Server replies with every persisted delta, oldest first
    SyncResponse,
    /// Incremental CRDT delta
    Update,
    /// Ephemeral cursor/selection/presence data
    Awareness,
    /// Sender-only error report
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncRequest => "sync_request",
            Self::SyncResponse => "sync_response",
            Self::Update => "update",
            Self::Awareness => "awareness",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync_request" => Some(Self::SyncRequest),
            "sync_response" => Some(Self::SyncResponse),
            "update" => Some(Self::Update),
            "awareness" => Some(Self::Awareness),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes reported in `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame was not a `{type, payload}` JSON object, or its payload did not fit the type
    InvalidMessage,
    /// Well-formed envelope with a type the server does not handle
    UnknownType,
    /// `update` payload was not valid base64 or carried an empty delta
    InvalidUpdate,
    /// `sync_request.page_id` names a page other than the connection's
    PageMismatch,
    /// The update log insert failed; the update was not relayed
    PersistenceFailed,
    /// Anything else on the server side
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "invalid_message",
            Self::UnknownType => "unknown_type",
            Self::InvalidUpdate => "invalid_update",
            Self::PageMismatch => "page_mismatch",
            Self::PersistenceFailed => "persistence_failed",
            Self::Internal => "internal",
        }
    }
}

/// The raw `{type, payload}` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// `sync_request` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub page_id: Option<Uuid>,
}

/// `sync_response` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub updates: Vec<String>,
}

/// `update` payload. The delta stays base64 until the router needs the bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub update: String,
}

impl UpdatePayload {
    /// Decode the carried delta.
    pub fn delta(&self) -> Result<Vec<u8>, ProtocolError> {
        decode_bytes(&self.update)
    }
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: ErrorCode,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    SyncRequest(SyncRequest),
    Update(UpdatePayload),
    Awareness(Value),
}

impl ClientMessage {
    /// Parse an inbound text frame.
    ///
    /// Distinguishes a frame that is not an envelope at all
    /// ([`ProtocolError::InvalidEnvelope`]) from a well-formed envelope of an
    /// unhandled type ([`ProtocolError::UnknownType`]).
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::decode(text)?;
        match MessageType::parse(&envelope.kind) {
            Some(MessageType::SyncRequest) => {
                Ok(Self::SyncRequest(payload_as(&envelope.kind, envelope.payload)?))
            }
            Some(MessageType::Update) => {
                Ok(Self::Update(payload_as(&envelope.kind, envelope.payload)?))
            }
            Some(MessageType::Awareness) => Ok(Self::Awareness(envelope.payload)),
            _ => Err(ProtocolError::UnknownType(envelope.kind)),
        }
    }
}

fn payload_as<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T, ProtocolError> {
    // A missing payload is read as an empty object so optional fields default.
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

impl Envelope {
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload,
        }
    }

    /// `sync_request` for the given page.
    pub fn sync_request(page_id: Uuid) -> Self {
        Self::new(
            MessageType::SyncRequest,
            serde_json::json!({ "page_id": page_id }),
        )
    }

    /// `sync_response` carrying the given deltas, in order.
    pub fn sync_response<I, B>(deltas: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let updates: Vec<String> = deltas.into_iter().map(|d| encode_bytes(d.as_ref())).collect();
        Self::new(
            MessageType::SyncResponse,
            serde_json::json!({ "updates": updates }),
        )
    }

    /// `update` carrying one delta.
    pub fn update(delta: &[u8]) -> Self {
        Self::new(
            MessageType::Update,
            serde_json::json!({ "update": encode_bytes(delta) }),
        )
    }

    /// `awareness` with an opaque presence object.
    pub fn awareness(state: Value) -> Self {
        Self::new(MessageType::Awareness, state)
    }

    /// `error` for the sender.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            serde_json::json!({ "message": message.into(), "code": code }),
        )
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::parse(&self.kind)
    }

    /// Serialize to the wire text.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from wire text.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))
    }

    /// Parse the payload of a `sync_response`.
    pub fn sync_response_payload(&self) -> Result<SyncResponse, ProtocolError> {
        self.expect(MessageType::SyncResponse)?;
        payload_as(&self.kind, self.payload.clone())
    }

    /// Parse the payload of an `update`.
    pub fn update_payload(&self) -> Result<UpdatePayload, ProtocolError> {
        self.expect(MessageType::Update)?;
        payload_as(&self.kind, self.payload.clone())
    }

    /// Parse the payload of an `error`.
    pub fn error_payload(&self) -> Result<ErrorPayload, ProtocolError> {
        self.expect(MessageType::Error)?;
        payload_as(&self.kind, self.payload.clone())
    }

    fn expect(&self, kind: MessageType) -> Result<(), ProtocolError> {
        if self.message_type() == Some(kind) {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedType {
                expected: kind.as_str(),
                got: self.kind.clone(),
            })
        }
    }
}

/// Base64-encode binary CRDT data for the wire.
pub fn encode_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode base64 wire text back into CRDT bytes.
pub fn decode_bytes(text: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(text)
        .map_err(|e| ProtocolError::InvalidBase64(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("expected {expected} message, got {got}")]
    UnexpectedType { expected: &'static str, got: String },
    #[error("invalid base64: {0}")]
    InvalidBase64(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProtocolError {
    /// The error code reported back to the client for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownType(_) => ErrorCode::UnknownType,
            Self::InvalidBase64(_) => ErrorCode::InvalidUpdate,
            Self::InvalidEnvelope(_) | Self::InvalidPayload { .. } | Self::UnexpectedType { .. } => {
                ErrorCode::InvalidMessage
            }
            Self::Serialization(_) => ErrorCode::Internal,
        }
    }
}
