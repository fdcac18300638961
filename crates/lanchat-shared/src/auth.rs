//! Credential primitives for the Auth Gate.
//!
//! Two schemes are supported:
//!
//! - **HMAC**: the client proves knowledge of a shared secret by sending
//!   `hex(HMAC-SHA256(secret, "<user>:<timestamp>"))`.
//! - **Signed token**: a compact `header.payload.signature` token, each part
//!   base64url without padding, signed with HMAC-SHA256 over
//!   `"<header>.<payload>"`. The subject claim names the user.
//!
//! All comparisons are constant-time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::constants::TOKEN_ALGORITHM;
use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(key: &[u8]) -> Result<HmacSha256, AuthError> {
    HmacSha256::new_from_slice(key).map_err(|_| AuthError::Malformed)
}

/// Lowercase hex HMAC a client sends in `AUTH <user> <ts> <mac>`.
pub fn hmac_hex(secret: &str, user: &str, timestamp: &str) -> Result<String, AuthError> {
    let mut mac = mac_for(secret.as_bytes())?;
    mac.update(format!("{user}:{timestamp}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_hmac(secret: &str, user: &str, timestamp: &str, mac_hex: &str) -> Result<(), AuthError> {
    let presented = hex::decode(mac_hex.trim()).map_err(|_| AuthError::Malformed)?;
    let mut mac = mac_for(secret.as_bytes())?;
    mac.update(format!("{user}:{timestamp}").as_bytes());
    mac.verify_slice(&presented)
        .map_err(|_| AuthError::BadSignature)
}

/// Older clients send the bare secret.
pub fn verify_shared_secret(secret: &str, presented: &str) -> Result<(), AuthError> {
    if bool::from(secret.as_bytes().ct_eq(presented.as_bytes())) {
        Ok(())
    } else {
        Err(AuthError::BadSignature)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TokenHeader {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Claims carried by a signed token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    #[serde(default)]
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Issue a token for `subject`, valid for `ttl_secs` when given.
pub fn issue_token(key: &str, subject: &str, ttl_secs: Option<i64>) -> Result<String, AuthError> {
    let now = Utc::now().timestamp();
    let header = TokenHeader {
        alg: TOKEN_ALGORITHM.to_string(),
        typ: Some("JWT".to_string()),
    };
    let claims = Claims {
        sub: subject.to_string(),
        iat: Some(now),
        exp: ttl_secs.map(|ttl| now + ttl),
    };
    let header = serde_json::to_vec(&header).map_err(|_| AuthError::Malformed)?;
    let claims = serde_json::to_vec(&claims).map_err(|_| AuthError::Malformed)?;
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(claims)
    );

    let mut mac = mac_for(key.as_bytes())?;
    mac.update(signing_input.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{signing_input}.{sig}"))
}

/// Verify a token and return its claims. `now` is unix seconds.
pub fn verify_token(key: &str, token: &str, now: i64) -> Result<Claims, AuthError> {
    let mut parts = token.trim().split('.');
    let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Malformed);
    };

    let header_raw = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| AuthError::Malformed)?;
    let header: TokenHeader = serde_json::from_slice(&header_raw).map_err(|_| AuthError::Malformed)?;
    if header.alg != TOKEN_ALGORITHM {
        return Err(AuthError::UnsupportedAlgorithm(header.alg));
    }

    let sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| AuthError::Malformed)?;
    let mut mac = mac_for(key.as_bytes())?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&sig).map_err(|_| AuthError::BadSignature)?;

    let payload_raw = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::Malformed)?;
    let claims: Claims = serde_json::from_slice(&payload_raw).map_err(|_| AuthError::Malformed)?;
    if claims.sub.trim().is_empty() {
        return Err(AuthError::MissingSubject);
    }
    if let Some(exp) = claims.exp {
        if exp <= now {
            return Err(AuthError::Expired);
        }
    }
    Ok(claims)
}
