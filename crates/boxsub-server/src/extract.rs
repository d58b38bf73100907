//! Request Extractors
//!
//! Callers identify themselves with `x-user-id`; wizard requests also carry
//! the browser session in `x-session-id`.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use uuid::Uuid;

use crate::handlers::ErrorResponse;

pub const USER_HEADER: &str = "x-user-id";
pub const SESSION_HEADER: &str = "x-session-id";

type AuthRejection = (StatusCode, Json<ErrorResponse>);

/// Authenticated user
#[derive(Clone, Copy, Debug)]
pub struct Caller(pub Uuid);

/// Authenticated user plus wizard session
#[derive(Clone, Debug)]
pub struct CheckoutCaller {
    pub user_id: Uuid,
    pub session_id: String,
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        user_id(&parts.headers).map(Self)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CheckoutCaller {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = user_id(&parts.headers)?;
        let session_id = header(&parts.headers, SESSION_HEADER)
            .ok_or_else(|| unauthorized("Missing session", "MISSING_SESSION"))?
            .to_string();
        Ok(Self { user_id, session_id })
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn user_id(headers: &HeaderMap) -> Result<Uuid, AuthRejection> {
    let raw = header(headers, USER_HEADER)
        .ok_or_else(|| unauthorized("Missing user", "MISSING_USER"))?;
    Uuid::parse_str(raw).map_err(|_| unauthorized("Invalid user id", "INVALID_USER"))
}

fn unauthorized(error: &str, code: &str) -> AuthRejection {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}
