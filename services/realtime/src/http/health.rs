use axum::extract::State;
use axum::response::IntoResponse;

use crate::state::AppState;

pub async fn healthz() -> impl IntoResponse {
    "ok"
}

/// Ready only while the bus is not degraded; a load balancer should stop
/// sending traffic here, not kill the process, when this returns non-2xx.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.bus.is_degraded() {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (axum::http::StatusCode::OK, "ok")
    }
}
