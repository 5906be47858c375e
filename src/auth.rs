use axum::http::{header, HeaderMap};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("malformed token")]
    Malformed,
    #[error("token expired")]
    Expired,
    #[error("bad signature")]
    BadSignature,
}

fn mac_for(secret: &str, payload: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    Some(mac)
}

pub fn sign_payload(secret: &str, payload: &str) -> Option<String> {
    let mac = mac_for(secret, payload)?;
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Issues `<user_id>.<expires_unix>.<signature>`. Token issuance belongs to
/// the account service; this exists for operators and tests.
pub fn sign_token(secret: &str, user_id: &str, expires_unix: i64) -> Option<String> {
    let claims = format!("{}.{}", user_id, expires_unix);
    let signature = sign_payload(secret, &claims)?;
    Some(format!("{}.{}", claims, signature))
}

/// Returns the user id carried by a valid, unexpired token.
pub fn verify_token(secret: &str, token: &str, now_unix: i64) -> Result<String, AuthError> {
    // User ids may contain dots; the last two segments are fixed.
    let mut parts = token.rsplitn(3, '.');
    let signature = parts.next().ok_or(AuthError::Malformed)?;
    let expires = parts.next().ok_or(AuthError::Malformed)?;
    let user_id = parts.next().ok_or(AuthError::Malformed)?;

    if user_id.is_empty() {
        return Err(AuthError::Malformed);
    }
    let expires_unix: i64 = expires.parse().map_err(|_| AuthError::Malformed)?;
    let signature = hex::decode(signature).map_err(|_| AuthError::Malformed)?;

    let mac = mac_for(secret, &format!("{}.{}", user_id, expires)).ok_or(AuthError::BadSignature)?;
    mac.verify_slice(&signature).map_err(|_| AuthError::BadSignature)?;

    if expires_unix <= now_unix {
        return Err(AuthError::Expired);
    }
    Ok(user_id.to_string())
}

/// Constant-time comparison of a presented shared secret.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    // Comparing MACs of both values keeps timing independent of where they differ.
    let Some(reference) = sign_payload(expected, expected) else {
        return false;
    };
    let Ok(reference) = hex::decode(reference) else {
        return false;
    };
    match mac_for(expected, presented) {
        Some(mac) => mac.verify_slice(&reference).is_ok(),
        None => false,
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Resolves the caller from an explicit token or the `Authorization` header.
pub fn authenticate(secret: &str, token: Option<&str>, headers: &HeaderMap) -> Result<String, AuthError> {
    let token = token
        .or_else(|| bearer_token(headers))
        .ok_or(AuthError::Missing)?;
    verify_token(secret, token, chrono::Utc::now().timestamp())
}
