//! CORS handling.
//!
//! The allow-origin rules here are too specific for an off-the-shelf layer:
//! the allowed origin reflects the request origin only when it is in the
//! configured list, falls back to the first configured origin otherwise,
//! and a `*` entry disables the list entirely. WebSocket 101 responses must
//! pass through untouched — the runtime forbids mutating upgrade responses.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::AppContext;

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization";

/// Pick the `Access-Control-Allow-Origin` value for a request.
pub fn resolve_origin(allowed: &[String], request_origin: Option<&str>) -> Option<String> {
    if allowed.iter().any(|o| o == "*") {
        return Some(request_origin.unwrap_or("*").to_string());
    }
    match request_origin {
        Some(origin) if allowed.iter().any(|a| a == origin) => Some(origin.to_string()),
        _ => allowed.first().cloned(),
    }
}

/// Router-wide middleware: answers preflights and decorates every non-101
/// response with the resolved allow-origin.
pub async fn apply(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
    next: Next,
) -> Response {
    let request_origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let allow_origin = resolve_origin(&ctx.config.allowed_origins, request_origin.as_deref())
        .and_then(|v| HeaderValue::from_str(&v).ok());

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
        if let Some(origin) = allow_origin {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        return response;
    }

    let mut response = next.run(request).await;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        if let Some(origin) = allow_origin {
            response
                .headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
    }
    response
}

// ─── Tests ───────────────────────────────────────────────────────────────────
