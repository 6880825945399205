use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use secureconnect_protocol::{CallId, CallKind, CallStatus, ConversationId, UserId};
use serde::{Deserialize, Serialize};

use crate::http::response::{core_error_response, unauthorized, HttpResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InitiateCallRequest {
    pub conversation_id: ConversationId,
    pub kind: CallKind,
    pub invitees: Vec<UserId>,
}

#[derive(Debug, Serialize)]
pub struct InitiateCallResponse {
    pub call_id: CallId,
}

pub async fn initiate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InitiateCallRequest>,
) -> HttpResult<Json<InitiateCallResponse>> {
    let auth = authenticate(&state, &headers)?;
    let call_id = state
        .call_service
        .initiate(req.conversation_id, auth.user_id, req.kind, req.invitees)
        .await
        .map_err(|e| core_error_response(&e))?;
    Ok(Json(InitiateCallResponse { call_id }))
}

pub async fn join(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(call_id): Path<CallId>,
) -> HttpResult<()> {
    let auth = authenticate(&state, &headers)?;
    state.call_service.join(call_id, auth.user_id).await.map_err(|e| core_error_response(&e))?;
    Ok(())
}

pub async fn leave(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(call_id): Path<CallId>,
) -> HttpResult<()> {
    let auth = authenticate(&state, &headers)?;
    state.call_service.leave(call_id, auth.user_id).await.map_err(|e| core_error_response(&e))?;
    Ok(())
}

pub async fn end(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(call_id): Path<CallId>,
) -> HttpResult<()> {
    authenticate(&state, &headers)?;
    state.call_service.end_call(call_id).await.map_err(|e| core_error_response(&e))?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct CallResponse {
    pub id: CallId,
    pub conversation_id: ConversationId,
    pub caller_id: UserId,
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
}

pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(call_id): Path<CallId>,
) -> HttpResult<Json<CallResponse>> {
    authenticate(&state, &headers)?;
    let record = state.call_service.get(call_id).await.map_err(|e| core_error_response(&e))?;
    Ok(Json(CallResponse {
        id: record.id,
        conversation_id: record.conversation_id,
        caller_id: record.caller_id,
        kind: record.kind,
        status: record.status,
        started_at_ms: record.started_at_ms,
        ended_at_ms: record.ended_at_ms,
    }))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<crate::auth::AuthContext, axum::response::Response> {
    let token = crate::auth::extract_token_from_headers(headers)
        .ok_or_else(|| unauthorized("missing bearer token"))?;
    state.auth.validate(&token).map_err(|_| unauthorized("invalid token"))
}
