//! Role-secret authentication primitives.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use md5::Md5;
use serde_json::{json, Value};

use crate::error::{ErrorKind, Result};

pub const ROLE_SECRET: &str = "role_secret";

/// `base64(HMAC-MD5(key = secret, message = nonce))`
pub fn hmac_md5(nonce: &str, secret: &str) -> Result<String> {
    let mut mac = Hmac::<Md5>::new_from_slice(secret.as_bytes())
        .map_err(|_| crate::context!(ErrorKind::InvalidKey))?;
    mac.update(nonce.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

pub(crate) fn handshake_body(role: &str) -> Value {
    json!({
        "method": ROLE_SECRET,
        "data": { "role": role },
    })
}

pub(crate) fn authenticate_body(hash: &str) -> Value {
    json!({
        "method": ROLE_SECRET,
        "credentials": { "hash": hash },
    })
}

/// Extracts `data.nonce` from a handshake reply body.
pub(crate) fn nonce(body: &Value) -> Option<&str> {
    body.get("data")?.get("nonce")?.as_str()
}
