//! WebSocket upgrade entry points. Each validates the bearer token and the
//! caller's membership/invitation precondition before handing the socket
//! off to the relevant hub's `serve` loop.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use secureconnect_protocol::limits::STORE_READ_DEADLINE;
use secureconnect_protocol::{CallId, ConversationId, CoreError};

use crate::auth::extract_token_from_headers;
use crate::state::AppState;

pub async fn chat_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
) -> Response {
    let Some(token) = extract_token_from_headers(&headers) else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };
    let Ok(auth) = state.auth.validate(&token) else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };

    match state.membership.is_participant(conversation_id, auth.user_id, STORE_READ_DEADLINE).await {
        Ok(true) => {}
        Ok(false) => return axum::http::StatusCode::FORBIDDEN.into_response(),
        Err(_) => return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }

    let hub = state.chat_hub.clone();
    ws.on_upgrade(move |socket| async move { hub.serve(socket, auth.user_id, conversation_id).await })
}

pub async fn signaling_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(call_id): Path<CallId>,
) -> Response {
    let Some(token) = extract_token_from_headers(&headers) else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };
    let Ok(auth) = state.auth.validate(&token) else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };

    // Invitation to the call alone is insufficient: a caller who has left (or
    // was removed from) the call's underlying conversation must not be able
    // to open a signaling socket, so both checks are required.
    let call = match state.call_service.get(call_id).await {
        Ok(call) => call,
        Err(CoreError::NotFound(_)) => return axum::http::StatusCode::NOT_FOUND.into_response(),
        Err(_) => return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    match state
        .membership
        .is_participant(call.conversation_id, auth.user_id, STORE_READ_DEADLINE)
        .await
    {
        Ok(true) => {}
        Ok(false) => return axum::http::StatusCode::FORBIDDEN.into_response(),
        Err(_) => return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }

    match state.membership.is_invited_to_call(call_id, auth.user_id, STORE_READ_DEADLINE).await {
        Ok(true) => {}
        Ok(false) => return axum::http::StatusCode::FORBIDDEN.into_response(),
        Err(_) => return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }

    let hub = state.signaling_hub.clone();
    ws.on_upgrade(move |socket| async move { hub.serve(socket, auth.user_id, call_id).await })
}
