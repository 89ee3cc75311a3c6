//! Admin bearer-token auth middleware.
//!
//! Same shape as the teacher's gateway auth middleware, generalized from
//! "optional dev-mode token" to a required `admin_token` guarding every
//! `/api/*` admin route. Agent endpoints authenticate separately (token +
//! machine id), so they're mounted outside this layer.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware,
    response::IntoResponse,
    Json,
};
use subtle::ConstantTimeEq;

use super::GatewayState;

fn tokens_match(given: &str, expected: &str) -> bool {
    // Constant-time so a timing side channel can't be used to guess the
    // admin token one byte at a time; length is allowed to leak since it's
    // not secret (the token is always 64 hex chars).
    given.len() == expected.len() && given.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub async fn admin_auth_middleware(
    State(state): State<GatewayState>,
    req: Request<Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    let header_token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string);

    match header_token {
        Some(token) if tokens_match(&token, &state.admin_token) => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "missing or invalid Authorization header"})),
        )
            .into_response(),
    }
}
