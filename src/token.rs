use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

pub const TOKEN_PREFIX: &str = "srm1";
pub const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    pub role: String,
    pub exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    Malformed,
    BadSignature,
    Expired,
}

fn sign(secret: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b".");
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let raw = s.as_bytes();
    let mut out = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push((hi * 16 + lo) as u8);
    }
    Some(out)
}

/// Self-contained signed token: srm1.<hex claims json>.<hex signature>.
/// Validity is signature plus expiry; nothing is kept server-side.
pub fn mint(secret: &str, sub: &str, name: &str, role: &str, now_epoch: i64) -> String {
    let payload = serde_json::json!({
        "sub": sub,
        "name": name,
        "role": role,
        "exp": now_epoch + TOKEN_TTL_SECS,
    })
    .to_string();
    let sig = sign(secret, &payload);
    format!("{}.{}.{}", TOKEN_PREFIX, hex_encode(payload.as_bytes()), sig)
}

pub fn verify(secret: &str, token: &str, now_epoch: i64) -> Result<Claims, VerifyError> {
    let mut parts = token.split('.');
    let (Some(prefix), Some(payload_hex), Some(sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(VerifyError::Malformed);
    };
    if prefix != TOKEN_PREFIX {
        return Err(VerifyError::Malformed);
    }
    let payload_bytes = hex_decode(payload_hex).ok_or(VerifyError::Malformed)?;
    let payload = String::from_utf8(payload_bytes).map_err(|_| VerifyError::Malformed)?;
    if sign(secret, &payload) != sig {
        return Err(VerifyError::BadSignature);
    }
    let claims: Claims = serde_json::from_str(&payload).map_err(|_| VerifyError::Malformed)?;
    if claims.exp <= now_epoch {
        return Err(VerifyError::Expired);
    }
    Ok(claims)
}
