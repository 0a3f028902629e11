//! HS256 bearer tokens.
//!
//! A token is three base64url segments joined by dots: a fixed
//! `{"alg":"HS256","typ":"JWT"}` header, the claims payload, and an
//! HMAC-SHA-256 signature over `header_b64 + "." + payload_b64`.
//!
//! `verify_token` is total: every malformed, tampered, or expired envelope
//! maps to `None`. No error ever escapes to the caller.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The claims the gateway mints for a paired mobile client.
///
/// `iat`/`exp` are seconds since epoch; everything a room needs to address
/// the attachment is in `mobile_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub device_id: String,
    pub mobile_id: String,
    pub session_id: String,
    pub iat: i64,
    pub exp: i64,
}

impl SessionClaims {
    /// Decode typed claims out of a verified claims map.
    pub fn from_map(claims: &Map<String, Value>) -> Option<Self> {
        serde_json::from_value(Value::Object(claims.clone())).ok()
    }
}

/// Mint a three-segment token: the supplied claims plus `iat` (now, seconds)
/// and `exp = iat + ttl_seconds`, signed with `secret`.
pub fn mint_token(claims: &Map<String, Value>, secret: &str, ttl_seconds: i64) -> String {
    let iat = Utc::now().timestamp();
    let mut payload = claims.clone();
    payload.insert("iat".to_string(), json!(iat));
    payload.insert("exp".to_string(), json!(iat + ttl_seconds));

    let header_b64 = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload_b64 = URL_SAFE_NO_PAD.encode(Value::Object(payload).to_string());
    let signature = sign(&header_b64, &payload_b64, secret);

    format!("{header_b64}.{payload_b64}.{signature}")
}

/// Verify an envelope and return its claims, or `None` when the envelope is
/// not exactly three dot-separated segments, any segment fails base64url
/// decoding, the signature does not match (constant-time compare), or
/// `exp <= now`.
pub fn verify_token(envelope: &str, secret: &str) -> Option<Map<String, Value>> {
    let mut segments = envelope.split('.');
    let (header_b64, payload_b64, signature_b64) =
        (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    // Every segment must decode, the header included.
    URL_SAFE_NO_PAD.decode(header_b64).ok()?;
    let payload_bytes = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let signature = URL_SAFE_NO_PAD.decode(signature_b64).ok()?;

    // Mac::verify_slice is a constant-time comparison.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&signature).ok()?;

    let claims: Map<String, Value> = serde_json::from_slice(&payload_bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    if exp <= Utc::now().timestamp() {
        return None;
    }
    Some(claims)
}

fn sign(header_b64: &str, payload_b64: &str, secret: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECRET: &str = "test-secret";

    fn claims(device_id: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("device_id".into(), json!(device_id));
        m.insert("mobile_id".into(), json!("aabbccddeeff00112233445566778899"));
        m.insert("session_id".into(), json!("sess-1"));
        m
    }

    #[test]
    fn mint_then_verify_round_trips() {
        let token = mint_token(&claims("swift-tiger-42"), SECRET, 3600);
        let decoded = verify_token(&token, SECRET).expect("valid token");
        assert_eq!(decoded["device_id"], "swift-tiger-42");
        let iat = decoded["iat"].as_i64().unwrap();
        let exp = decoded["exp"].as_i64().unwrap();
        assert_eq!(exp, iat + 3600);
    }

    #[test]
    fn typed_claims_decode() {
        let token = mint_token(&claims("swift-tiger-42"), SECRET, 60);
        let map = verify_token(&token, SECRET).unwrap();
        let typed = SessionClaims::from_map(&map).expect("typed claims");
        assert_eq!(typed.device_id, "swift-tiger-42");
        assert_eq!(typed.mobile_id.len(), 32);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = mint_token(&claims("swift-tiger-42"), SECRET, 3600);
        assert!(verify_token(&token, "other-secret").is_none());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let token = mint_token(&claims("swift-tiger-42"), SECRET, 3600);
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(r#"{"device_id":"evil-fox-99","exp":99999999999}"#);
        parts[1] = &forged;
        assert!(verify_token(&parts.join("."), SECRET).is_none());
    }

    #[test]
    fn wrong_segment_count_is_rejected() {
        assert!(verify_token("", SECRET).is_none());
        assert!(verify_token("a.b", SECRET).is_none());
        assert!(verify_token("a.b.c.d", SECRET).is_none());
    }

    #[test]
    fn undecodable_segment_is_rejected() {
        let token = mint_token(&claims("swift-tiger-42"), SECRET, 3600);
        let parts: Vec<&str> = token.split('.').collect();
        let bad = format!("{}.{}.{}", "!!not-base64!!", parts[1], parts[2]);
        assert!(verify_token(&bad, SECRET).is_none());
    }

    #[test]
    fn exp_equal_to_now_is_rejected() {
        // ttl 0 gives exp == iat == now
        let token = mint_token(&claims("swift-tiger-42"), SECRET, 0);
        assert!(verify_token(&token, SECRET).is_none());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = mint_token(&claims("swift-tiger-42"), SECRET, -60);
        assert!(verify_token(&token, SECRET).is_none());
    }

    proptest! {
        // verify(mint(claims)) == claims ∪ {iat, exp} for JSON-safe claims.
        #[test]
        fn round_trip_law(device in "[a-z]{2,8}-[a-z]{2,8}-[0-9]{2}",
                          extra in "[a-zA-Z0-9 ]{0,24}",
                          ttl in 1i64..1_000_000) {
            let mut m = claims(&device);
            m.insert("note".into(), json!(extra));
            let token = mint_token(&m, SECRET, ttl);
            let decoded = verify_token(&token, SECRET).expect("round trip");
            for (k, v) in &m {
                prop_assert_eq!(decoded.get(k), Some(v));
            }
            prop_assert!(decoded.contains_key("iat"));
            prop_assert!(decoded.contains_key("exp"));
        }
    }
}
