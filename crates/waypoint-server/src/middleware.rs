//! Cross-cutting HTTP middleware: version headers on every response, and
//! a bearer/API-key auth shim on every route but `/health`.

use std::sync::Arc;
use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::AppState;

pub async fn version_headers(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        "X-Operator-Version",
        HeaderValue::from_static(crate::OPERATOR_VERSION),
    );
    if let Ok(value) = HeaderValue::from_str(&state.config.catalog_version) {
        headers.insert("X-Catalog-Version", value);
    }
    response
}

/// Skips `/health`. Otherwise requires a non-empty `Authorization: Bearer
/// <token>` or `Authorization: ApiKey <token>` header; if
/// `ServerConfig::http_auth_token` is set, the token must match it exactly.
pub async fn auth(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let header = req.headers().get("authorization").and_then(|h| h.to_str().ok());
    let token = match header {
        Some(value) if value.len() > 7 && (value.starts_with("Bearer ") || value.starts_with("ApiKey ")) => {
            &value[7..]
        }
        _ => {
            tracing::warn!(path = %req.uri().path(), "unauthorized request");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    if let Some(expected) = &state.config.http_auth_token {
        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    Ok(next.run(req).await)
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
