use axum::http::HeaderMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use secureconnect_protocol::{CoreError, UserId};
use serde::Deserialize;

use crate::config::REQUIRED_AUDIENCE;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: UserId,
    sid: String,
    aud: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
    pub session_id: String,
    pub audience: String,
}

pub struct AuthValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthValidator {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.set_audience(&[REQUIRED_AUDIENCE]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<AuthContext, CoreError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| CoreError::Unauthorized(format!("invalid token: {e}")))?;
        if data.claims.aud != REQUIRED_AUDIENCE {
            return Err(CoreError::Unauthorized("unexpected audience".into()));
        }
        Ok(AuthContext {
            user_id: data.claims.sub,
            session_id: data.claims.sid,
            audience: data.claims.aud,
        })
    }
}

/// Strips the `Bearer ` prefix from an `Authorization` header value.
#[must_use]
pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

#[must_use]
pub fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: UserId,
        sid: String,
        aud: String,
    }

    fn make_token(secret: &str, aud: &str) -> String {
        let claims = TestClaims {
            sub: UserId::new(),
            sid: "session-1".into(),
            aud: aud.into(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn validate_accepts_correct_audience() {
        let validator = AuthValidator::new("test-secret");
        let token = make_token("test-secret", REQUIRED_AUDIENCE);
        let ctx = validator.validate(&token).unwrap();
        assert_eq!(ctx.audience, REQUIRED_AUDIENCE);
    }

    #[test]
    fn validate_rejects_wrong_audience() {
        let validator = AuthValidator::new("test-secret");
        let token = make_token("test-secret", "some-other-api");
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn extract_bearer_strips_prefix() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("abc123"), None);
    }

    #[test]
    fn extract_token_from_headers_reads_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer xyz"),
        );
        assert_eq!(extract_token_from_headers(&headers), Some("xyz".to_string()));
    }
}
