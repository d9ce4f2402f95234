// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// The expected token is read from `BOT_ADMIN_TOKEN` on every request, so it
// can be rotated without a restart. An unset token rejects everything.
//
//   async fn handler(_auth: AuthBearer, ...) { ... }
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

pub const ADMIN_TOKEN_ENV: &str = "BOT_ADMIN_TOKEN";

/// Byte-wise comparison that does not stop at the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// The token part of an `Authorization: Bearer <token>` value.
fn bearer_token(header: Option<&str>) -> Option<&str> {
    header
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Check `presented` against the configured admin token.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && constant_time_eq(presented.as_bytes(), expected.as_bytes())
}

/// Yields the presented token once it has been validated.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var(ADMIN_TOKEN_ENV).unwrap_or_default();
        if expected.is_empty() {
            warn!(env = ADMIN_TOKEN_ENV, "admin token not set, rejecting authenticated request");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "server authentication not configured",
            });
        }

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let Some(token) = bearer_token(header) else {
            warn!(path = %parts.uri.path(), "missing or malformed Authorization header");
            return Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "missing bearer token",
            });
        };

        if !token_matches(token, &expected) {
            warn!(path = %parts.uri.path(), "invalid admin token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "invalid bearer token",
            });
        }
        Ok(AuthBearer(token.to_string()))
    }
}
