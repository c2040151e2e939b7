//! Bearer-token authentication.
//!
//! Every non-health endpoint requires `Authorization: Bearer <token>` where
//! the token equals the configured access token, compared in constant time.

use crate::errors::AppError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use constant_time_eq::constant_time_eq;

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(&request)?;

    let expected = state
        .config
        .access_token
        .as_deref()
        .ok_or_else(|| AppError::unauthorized("agent has no access token configured"))?;

    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        return Err(AppError::unauthorized("invalid access token"));
    }

    Ok(next.run(request).await)
}

fn extract_bearer_token(request: &Request) -> Result<&str, AppError> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing authorization header"))?;

    auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::unauthorized("authorization header is not a bearer token"))
}
