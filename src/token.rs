//! Compact HMAC-signed claim tokens: `base64url(json claims) "." base64url(mac)`.
//!
//! Used for visitor balance tokens and authenticated session tokens.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("invalid hmac key: {0}")]
    InvalidKey(String),
    #[error("token claims: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn sign<T: Serialize>(secret: &[u8], claims: &T) -> Result<String, TokenError> {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let mac = hmac_sha256(secret, payload.as_bytes())?;
    Ok(format!("{payload}.{}", URL_SAFE_NO_PAD.encode(mac)))
}

pub fn verify<T: DeserializeOwned>(secret: &[u8], token: &str) -> Result<T, TokenError> {
    let (payload, signature) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TokenError::Malformed)?;

    let mut mac = new_mac(secret)?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| TokenError::BadSignature)?;

    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::Malformed)?;
    Ok(serde_json::from_slice(&raw)?)
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut mac = new_mac(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time check of `expected_mac` against HMAC-SHA256(key, data).
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], expected_mac: &[u8]) -> Result<(), TokenError> {
    let mut mac = new_mac(key)?;
    mac.update(data);
    mac.verify_slice(expected_mac)
        .map_err(|_| TokenError::BadSignature)
}

fn new_mac(key: &[u8]) -> Result<HmacSha256, TokenError> {
    HmacSha256::new_from_slice(key).map_err(|err| TokenError::InvalidKey(err.to_string()))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Claims {
        sub: String,
        n: i64,
    }

    #[test]
    fn verify_accepts_own_signature() {
        let claims = Claims {
            sub: "user-1".to_string(),
            n: 1,
        };
        let token = sign(b"secret", &claims).expect("sign");
        let decoded: Claims = verify(b"secret", &token).expect("verify");
        assert_eq!(decoded, claims);
    }

    #[test]
    fn verify_rejects_tampered_payload_and_wrong_key() {
        let token = sign(
            b"secret",
            &Claims {
                sub: "user-1".to_string(),
                n: 0,
            },
        )
        .expect("sign");

        let forged_payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"user-1","n":1}"#);
        let (_, signature) = token.split_once('.').expect("dot");
        let forged = format!("{forged_payload}.{signature}");
        assert!(matches!(
            verify::<Claims>(b"secret", &forged),
            Err(TokenError::BadSignature)
        ));
        assert!(matches!(
            verify::<Claims>(b"other", &token),
            Err(TokenError::BadSignature)
        ));
        assert!(matches!(
            verify::<Claims>(b"secret", "no-dot"),
            Err(TokenError::Malformed)
        ));
    }
}
