use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use secureconnect_protocol::{CoreError, ErrorKind, HttpErrorEnvelope};

pub type HttpResult<T> = Result<T, HttpResponse>;
pub type HttpResponse = Response;

fn json_error(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> HttpResponse {
    (status, Json(HttpErrorEnvelope { code: code.into(), message: message.into(), details: None })).into_response()
}

/// Maps a `CoreError` to its frozen HTTP status/code pair.
pub fn core_error_response(err: &CoreError) -> HttpResponse {
    let (status, code) = match err.kind() {
        ErrorKind::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        ErrorKind::InvalidArgument => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
        ErrorKind::Conflict => (StatusCode::CONFLICT, "CONFLICT"),
        ErrorKind::Throttled => (StatusCode::TOO_MANY_REQUESTS, "THROTTLED"),
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        ErrorKind::Degraded => (StatusCode::SERVICE_UNAVAILABLE, "DEGRADED"),
    };
    json_error(status, code, err.to_string())
}

pub fn bad_request(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
}

pub fn unauthorized(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn core_error_response_maps_throttled_to_429() {
        let response = core_error_response(&CoreError::Throttled("too fast".into()));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: HttpErrorEnvelope = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.code, "THROTTLED");
    }

    #[tokio::test]
    async fn core_error_response_maps_degraded_to_503() {
        let response = core_error_response(&CoreError::Degraded("bus down".into()));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
