// secureconnect-protocol: wire types for the chat + signaling core.
//
// All WebSocket frames use a top-level `kind` field for discriminated
// deserialization, in the same style the rest of this wire layer uses.

pub mod ids;
pub mod limits;

use serde::{Deserialize, Serialize};

pub use ids::{CallId, ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    File,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
}

/// A single stored chat message, as read back from `MessageStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    /// Opaque bytes; ciphertext envelopes pass through unchanged.
    pub content: Vec<u8>,
    /// Set by the sender when `content` is a client-side-encrypted envelope.
    /// Opaque to the core either way — this is a label, not a capability.
    pub is_encrypted: bool,
    /// Opaque to the core; persisted and echoed unchanged.
    pub metadata: serde_json::Value,
    /// Absent for sends that opt out of dedup; `None` never collides with
    /// another `None` send for the same `(conversation_id, sender_id)`.
    pub idempotency_key: Option<String>,
    pub sent_at_ms: i64,
}

/// A call participant's state, shared between `CallStore` and `SignalingHub`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallParticipant {
    pub call_id: CallId,
    pub user_id: UserId,
    pub joined_at_ms: i64,
    pub left_at_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// Chat wire frames (client <-> ChatHub)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum ChatFrame {
    /// Client -> server: send a message to the subscribed conversation.
    Send {
        idempotency_key: String,
        message_kind: MessageKind,
        content: Vec<u8>,
    },
    /// Server -> client: a message was published to this conversation.
    Message { message: Message },
    /// Server -> client: a participant left the conversation.
    ParticipantLeft { user_id: UserId, left_at_ms: i64 },
    /// Bidirectional keepalive.
    Ping,
    Pong,
    /// Server -> client: terminal protocol/auth error, connection will close.
    Error { error: ErrorEnvelope },
}

// ---------------------------------------------------------------------------
// Signaling wire frames (client <-> SignalingHub)
// ---------------------------------------------------------------------------

/// A single ICE candidate envelope. The hub validates the presence of
/// these three fields but never interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: serde_json::Value,
    pub sdp_mid: serde_json::Value,
    pub sdp_m_line_index: serde_json::Value,
}

/// The opaque part of an offer/answer/ice frame, carried inside `Relayed`
/// without re-flattening its own tag into the outer envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "payload_kind")]
#[serde(rename_all = "snake_case")]
pub enum RelayPayload {
    Offer { payload: serde_json::Value },
    Answer { payload: serde_json::Value },
    Ice { payload: IceCandidate },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum SignalingFrame {
    /// Client -> server: an SDP offer, opaque to the core, relayed
    /// verbatim to the target (or all other peers if absent).
    Offer { target_user_id: Option<UserId>, payload: serde_json::Value },
    /// Client -> server: an SDP answer, same targeting rules as `Offer`.
    Answer { target_user_id: Option<UserId>, payload: serde_json::Value },
    /// Client -> server: an ICE candidate. Dropped with a warning, never
    /// forwarded, if the three ICE fields are missing.
    Ice { target_user_id: Option<UserId>, payload: IceCandidate },
    /// Client -> server: this client is leaving the call's signaling session.
    Leave,
    /// Server -> client: the server-stamped, re-broadcast form of an
    /// offer/answer/ice frame. `sender_user_id`, `call_id` and
    /// `timestamp_ms` are always stamped by the server; any client-supplied
    /// values for these fields on the inbound frame are overwritten.
    /// `target_user_id` carries the inbound frame's targeting unchanged:
    /// `None` delivers to every other peer in the call, `Some(u)` delivers
    /// only to `u`.
    Relayed {
        sender_user_id: UserId,
        target_user_id: Option<UserId>,
        call_id: CallId,
        timestamp_ms: i64,
        payload: RelayPayload,
    },
    /// Server -> client: a participant joined the call.
    ParticipantJoined { user_id: UserId, joined_at_ms: i64 },
    /// Server -> client: a participant left the call.
    ParticipantLeft { user_id: UserId, left_at_ms: i64 },
    /// Server -> client: the call ended.
    CallEnded { reason: CallEndReason },
    Ping,
    Pong,
    Error { error: ErrorEnvelope },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    Hangup,
    Timeout,
    Expired,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// One of the frozen error kinds. Mirrors `CoreError` without the detail
/// string, for wire transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    InvalidArgument,
    Conflict,
    Throttled,
    NotFound,
    Internal,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
}

/// Frozen HTTP error envelope used by all non-2xx REST responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Core error type shared by every component in §4. One variant per error
/// kind in the error handling design; callers downgrade this to an
/// `ErrorEnvelope` or `HttpErrorEnvelope` at the edge.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("degraded: {0}")]
    Degraded(String),
}

impl CoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Throttled(_) => ErrorKind::Throttled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Degraded(_) => ErrorKind::Degraded,
        }
    }

    #[must_use]
    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_frame_send_round_trips_through_json() {
        let frame = ChatFrame::Send {
            idempotency_key: "abc123".into(),
            message_kind: MessageKind::Text,
            content: b"hello".to_vec(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"kind\":\"send\""));
        let back: ChatFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn signaling_frame_offer_is_tagged_snake_case() {
        let frame = SignalingFrame::Offer {
            target_user_id: None,
            payload: serde_json::json!({"sdp": "v=0"}),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["kind"], "offer");
    }

    #[test]
    fn ice_candidate_round_trips() {
        let candidate = IceCandidate {
            candidate: serde_json::json!("candidate:1 1 UDP 2122260223 192.0.2.1 3478 typ host"),
            sdp_mid: serde_json::json!("0"),
            sdp_m_line_index: serde_json::json!(0),
        };
        let frame = SignalingFrame::Ice { target_user_id: Some(UserId::new()), payload: candidate };
        let json = serde_json::to_string(&frame).unwrap();
        let back: SignalingFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn core_error_kind_matches_envelope() {
        let err = CoreError::Throttled("rate exceeded".into());
        assert_eq!(err.kind(), ErrorKind::Throttled);
        assert_eq!(err.to_envelope().kind, ErrorKind::Throttled);
    }
}
