//! Credential utilities: pairing PINs, mobile/session identifiers, bearer
//! tokens, and the SQLite-backed pairing-code store.
//!
//! Everything here is owned by the gateway; rooms and the PTY manager never
//! touch the signing secret or the store.

pub mod store;
pub mod token;

use chrono::Utc;
use once_cell::sync::Lazy;
use rand::{rngs::OsRng, Rng, RngCore};
use regex::Regex;

/// Device identifiers are human-pronounceable slugs: `word-word-NN`.
static DEVICE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]+-[a-z]+-[0-9]{2}$").expect("device id regex"));

/// Pairing PINs are exactly six decimal digits, leading zeros included.
static PIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{6}$").expect("pin regex"));

/// Returns `true` if `id` matches the `word-word-NN` device slug pattern.
///
/// Every public entry point that accepts a device identifier must call this
/// before doing anything else with the value.
pub fn is_valid_device_id(id: &str) -> bool {
    DEVICE_ID_RE.is_match(id)
}

/// Returns `true` if `pin` is exactly six decimal digits.
pub fn is_valid_pin(pin: &str) -> bool {
    PIN_RE.is_match(pin)
}

/// Generate a 6-digit pairing PIN, uniformly distributed over
/// 000000..=999999 from the OS CSPRNG. Leading zeros are preserved.
pub fn generate_pin() -> String {
    format!("{:06}", OsRng.gen_range(0..1_000_000u32))
}

/// Generate a fresh mobile identifier: 32 hex chars from 16 random bytes.
///
/// Minted once per token issuance — this, not the device id, is how a room
/// addresses a single mobile attachment.
pub fn generate_mobile_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a session identifier: base36 millisecond timestamp, a dash, and
/// 8 hex chars of randomness. Unique within a single host, which is all the
/// PTY manager needs.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    format!(
        "{}-{}",
        base36(Utc::now().timestamp_millis() as u64),
        hex::encode(bytes)
    )
}

/// Constant-time string comparison for PIN redemption.
/// Returns `true` if `a == b` without short-circuiting on mismatch.
pub fn secrets_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
