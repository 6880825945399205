pub mod auth;
pub mod call_service;
pub mod chat_hub;
pub mod chat_service;
pub mod config;
pub mod http;
pub mod push;
pub mod rate_limit;
pub mod signaling_hub;
pub mod state;
pub mod ws;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/chat/:conversation_id", get(ws::chat_ws))
        .route("/ws/v1/signaling/:call_id", get(ws::signaling_ws))
        .route(
            "/api/v1/conversations/:conversation_id/messages",
            post(http::chat::send_message).get(http::chat::read_range),
        )
        .route("/api/v1/calls", post(http::calls::initiate))
        .route("/api/v1/calls/:call_id", get(http::calls::get))
        .route("/api/v1/calls/:call_id/join", post(http::calls::join))
        .route("/api/v1/calls/:call_id/leave", post(http::calls::leave))
        .route("/api/v1/calls/:call_id/end", post(http::calls::end))
        .route("/healthz", get(http::health::healthz))
        .route("/readyz", get(http::health::readyz))
        .with_state(state)
}
