//! Gateway endpoint handlers.
//!
//! Everything here validates its inputs against the fixed patterns before
//! touching the store or a room, and returns the uniform
//! `{success, data?, error?}` envelope.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::credentials::store::PairingRecord;
use crate::credentials::token::{mint_token, verify_token, SessionClaims};
use crate::credentials::{
    generate_mobile_id, generate_pin, generate_session_id, is_valid_device_id, is_valid_pin,
    secrets_equal,
};
use crate::room::socket::Role;
use crate::AppContext;

use super::error::GatewayError;

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Decode a JSON request body, mapping every shape mismatch (bad JSON,
/// missing field, wrong type) to a 400 in the uniform envelope.
fn decode_body<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, GatewayError> {
    serde_json::from_value(body).map_err(|e| GatewayError::Malformed(format!("invalid body: {e}")))
}

// ─── GET / ────────────────────────────────────────────────────────────────────

pub async fn index() -> Json<Value> {
    ok(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

// ─── POST /pin/create ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PinCreateRequest {
    pub device_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

pub async fn pin_create(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let req: PinCreateRequest = decode_body(body)?;
    if !is_valid_device_id(&req.device_id) {
        return Err(GatewayError::Malformed("invalid device id".into()));
    }

    let device_name = req.device_name.unwrap_or_else(|| "Desktop".to_string());
    let pin = generate_pin();
    let record = PairingRecord::new(
        &req.device_id,
        &device_name,
        &pin,
        ctx.config.pin_expiry_seconds,
    );
    // Replaces any live code for this device — one live code at a time.
    ctx.pairing.put(&record).await?;

    let qr_data = json!({
        "type": "climanger",
        "version": 1,
        "device_id": req.device_id,
        "pin": pin,
        "relay": public_origin(&headers, &ctx.config.environment),
    })
    .to_string();

    debug!(device_id = %req.device_id, "pairing code issued");
    Ok(ok(json!({
        "pin": pin,
        "expires_at": record.expires_at,
        "qr_data": qr_data,
    })))
}

/// The origin mobile clients should dial, derived from the request's Host
/// header. TLS termination is the platform's job, so everything outside the
/// `dev` environment label is assumed https.
fn public_origin(headers: &HeaderMap, environment: &str) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = if environment == "dev" { "http" } else { "https" };
    format!("{scheme}://{host}")
}

// ─── POST /auth ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AuthRequest {
    pub device_id: String,
    pub pin: String,
}

pub async fn auth(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let req: AuthRequest = decode_body(body)?;
    if !is_valid_device_id(&req.device_id) {
        return Err(GatewayError::Malformed("invalid device id".into()));
    }
    if !is_valid_pin(&req.pin) {
        return Err(GatewayError::Malformed("invalid pin format".into()));
    }

    // The store filters expired codes itself, so a stale code is a miss.
    let record = ctx
        .pairing
        .get(&req.device_id)
        .await?
        .ok_or_else(|| GatewayError::Auth("unknown or expired pairing code".into()))?;

    if !secrets_equal(&record.pin, &req.pin) {
        return Err(GatewayError::Auth("pairing code mismatch".into()));
    }

    // Single-use: whoever loses the delete race gets a 401 above next time.
    ctx.pairing.delete(&req.device_id).await?;

    let mobile_id = generate_mobile_id();
    let session_id = generate_session_id();
    let mut claims = Map::new();
    claims.insert("device_id".into(), json!(req.device_id));
    claims.insert("mobile_id".into(), json!(mobile_id));
    claims.insert("session_id".into(), json!(session_id));
    let token = mint_token(
        &claims,
        &ctx.config.jwt_secret,
        ctx.config.session_expiry_seconds as i64,
    );

    info!(device_id = %req.device_id, mobile_id = %mobile_id, "pairing code redeemed");
    Ok(ok(json!({
        "token": token,
        "expires_in": ctx.config.session_expiry_seconds,
        "device_name": record.device_name,
    })))
}

// ─── GET /verify ──────────────────────────────────────────────────────────────

pub async fn verify(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, GatewayError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| GatewayError::Auth("missing bearer token".into()))?;

    let claims = verify_token(token, &ctx.config.jwt_secret)
        .ok_or_else(|| GatewayError::Auth("invalid or expired token".into()))?;

    let expires_at = claims.get("exp").and_then(Value::as_i64).unwrap_or(0) * 1000;
    let mut data = claims;
    data.insert("expires_at".into(), json!(expires_at));
    Ok(ok(Value::Object(data)))
}

// ─── GET /device/{device_id}/status ───────────────────────────────────────────

pub async fn device_status(
    State(ctx): State<Arc<AppContext>>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    if !is_valid_device_id(&device_id) {
        return Err(GatewayError::Malformed("invalid device id".into()));
    }

    let snapshot = match ctx.rooms.get(&device_id) {
        Some(room) => room.status_snapshot(),
        None => json!({
            "device_id": device_id,
            "device_name": Value::Null,
            "host_connected": false,
            "mobile_attachments": [],
            "total_sockets": 0,
        }),
    };
    Ok(ok(snapshot))
}

// ─── GET /connect/{device_id} ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub token: Option<String>,
}

pub async fn connect(
    State(ctx): State<Arc<AppContext>>,
    Path(device_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, GatewayError> {
    if !is_valid_device_id(&device_id) {
        return Err(GatewayError::Malformed("invalid device id".into()));
    }
    let kind = query.kind.as_deref().unwrap_or("");
    if kind != "host" && kind != "mobile" {
        return Err(GatewayError::Malformed(
            "connection type must be host or mobile".into(),
        ));
    }
    let Ok(upgrade) = upgrade else {
        return Err(GatewayError::UpgradeRequired);
    };

    if kind == "host" {
        let room = ctx.rooms.get_or_create(&device_id);
        info!(device_id = %device_id, "host connecting");
        return Ok(upgrade
            .on_upgrade(move |ws| crate::room::run_socket(room, ws, Role::Host, None)));
    }

    // Mobile: the token binds the connection to a mobile_id. Only this code
    // path may hand a mobile_id to the room.
    let token = query
        .token
        .ok_or_else(|| GatewayError::Auth("missing token".into()))?;
    let claims = verify_token(&token, &ctx.config.jwt_secret)
        .ok_or_else(|| GatewayError::Auth("invalid or expired token".into()))?;
    let claims = SessionClaims::from_map(&claims)
        .ok_or_else(|| GatewayError::Auth("malformed token claims".into()))?;
    if claims.device_id != device_id {
        return Err(GatewayError::Auth("token does not match device".into()));
    }

    let room = ctx.rooms.get_or_create(&device_id);
    if room.live_mobile_count() >= ctx.config.max_connections_per_device {
        return Err(GatewayError::CapReached("device connection limit reached".into()));
    }

    info!(device_id = %device_id, mobile_id = %claims.mobile_id, "mobile connecting");
    Ok(upgrade.on_upgrade(move |ws| {
        crate::room::run_socket(room, ws, Role::Mobile, Some(claims.mobile_id))
    }))
}
