use crate::error::{OkexError, Result};
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Request path the exchange expects to be signed for a websocket login.
pub const LOGIN_VERIFY_PATH: &str = "/users/self/verify";

/// Gets the current UTC timestamp as epoch seconds with a millisecond fraction,
/// e.g. `"1538054050.975"`. This is the form the websocket login expects.
pub fn get_epoch_time() -> String {
    format_epoch_millis(Utc::now().timestamp_millis())
}

/// Gets the current UTC timestamp in ISO-8601 with milliseconds,
/// e.g. `"2019-03-08T10:59:25.789Z"`. This is the form REST requests expect.
pub fn get_iso_time() -> String {
    format_iso(Utc::now())
}

fn format_epoch_millis(millis: i64) -> String {
    format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000))
}

fn format_iso(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builds the canonical string that gets signed: `timestamp + method + path + body`.
pub fn pre_hash_string(timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
    format!(
        "{}{}{}{}",
        timestamp,
        method.to_uppercase(),
        request_path,
        body
    )
}

/// Generates an HMAC-SHA256 signature over `message` keyed with the API secret.
///
/// # Returns
///
/// A Base64 encoded signature string.
pub fn generate_signature(secret_key: &str, message: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|e| {
        OkexError::AuthenticationError(format!("Invalid HMAC secret key: {}", e))
    })?;
    mac.update(message.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

/// Signs a request given its parts. Shared by the REST client and the websocket login.
pub fn sign_request(
    secret_key: &str,
    timestamp: &str,
    method: &str,
    request_path: &str,
    body: &str,
) -> Result<String> {
    let message = pre_hash_string(timestamp, method, request_path, body);
    generate_signature(secret_key, &message)
}

/// Signature carried by the websocket login frame.
pub fn login_signature(secret_key: &str, timestamp: &str) -> Result<String> {
    sign_request(secret_key, timestamp, "GET", LOGIN_VERIFY_PATH, "")
}
