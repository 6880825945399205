use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use secureconnect_protocol::{ConversationId, Message, MessageId, MessageKind};
use serde::{Deserialize, Serialize};

use crate::http::response::{bad_request, core_error_response, unauthorized, HttpResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub message_kind: MessageKind,
    /// Opaque ciphertext, base64-encoded over the wire.
    pub content_base64: String,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

fn default_metadata() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: secureconnect_protocol::UserId,
    pub kind: MessageKind,
    pub content_base64: String,
    pub is_encrypted: bool,
    pub metadata: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub sent_at_ms: i64,
}

impl From<Message> for MessageResponse {
    fn from(m: Message) -> Self {
        use base64::Engine;
        Self {
            id: m.id,
            conversation_id: m.conversation_id,
            sender_id: m.sender_id,
            kind: m.kind,
            content_base64: base64::engine::general_purpose::STANDARD.encode(&m.content),
            is_encrypted: m.is_encrypted,
            metadata: m.metadata,
            idempotency_key: m.idempotency_key,
            sent_at_ms: m.sent_at_ms,
        }
    }
}

pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
    Json(req): Json<SendMessageRequest>,
) -> HttpResult<Json<MessageResponse>> {
    let auth = authenticate(&state, &headers)?;

    use base64::Engine;
    let content = base64::engine::general_purpose::STANDARD
        .decode(&req.content_base64)
        .map_err(|e| bad_request(format!("content_base64 is not valid base64: {e}")))?;

    let message = state
        .chat_service
        .send_message(
            conversation_id,
            auth.user_id,
            content,
            req.message_kind,
            req.is_encrypted,
            req.metadata,
            req.idempotency_key,
        )
        .await
        .map_err(|e| core_error_response(&e))?;

    Ok(Json(message.into()))
}

#[derive(Debug, Deserialize)]
pub struct ReadRangeQuery {
    pub before: Option<MessageId>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn read_range(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<ReadRangeQuery>,
) -> HttpResult<Json<Vec<MessageResponse>>> {
    let auth = authenticate(&state, &headers)?;

    let messages = state
        .chat_service
        .read_range(conversation_id, auth.user_id, query.before, query.limit)
        .await
        .map_err(|e| core_error_response(&e))?;

    Ok(Json(messages.into_iter().map(MessageResponse::from).collect()))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<crate::auth::AuthContext, axum::response::Response> {
    let token = crate::auth::extract_token_from_headers(headers)
        .ok_or_else(|| unauthorized("missing bearer token"))?;
    state.auth.validate(&token).map_err(|_| unauthorized("invalid token"))
}
