//! Short-lived call tokens.
//!
//! A token is `base64(claims) "." base64(hmac)` where the claims are JSON
//! and the MAC is HMAC-SHA256 over the encoded claims with the call
//! provider's server secret. Clients treat it as opaque.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTokenClaims {
    pub app_id: String,
    pub user_id: String,
    pub nonce: String,
    /// Issue time, unix seconds.
    pub ctime: i64,
    /// Expiry, unix seconds.
    pub expire: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid signing key")]
    InvalidKey,
    #[error("failed to encode claims: {0}")]
    Encode(String),
}

pub struct CallTokenIssuer {
    app_id: String,
    key: HmacSha256,
    ttl_secs: i64,
}

impl CallTokenIssuer {
    pub fn new(app_id: impl Into<String>, secret: &str, ttl_secs: i64) -> Result<Self, TokenError> {
        let key = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| TokenError::InvalidKey)?;
        Ok(Self {
            app_id: app_id.into(),
            key,
            ttl_secs,
        })
    }

    pub fn issue(&self, user_id: &str, now: i64) -> Result<String, TokenError> {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        let claims = CallTokenClaims {
            app_id: self.app_id.clone(),
            user_id: user_id.to_string(),
            nonce: hex::encode(nonce),
            ctime: now,
            expire: now + self.ttl_secs,
        };
        let claims = serde_json::to_vec(&claims).map_err(|e| TokenError::Encode(e.to_string()))?;
        let payload = STANDARD.encode(claims);
        let signature = STANDARD.encode(self.mac(payload.as_bytes()).finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    pub fn verify(&self, token: &str, now: i64) -> Result<CallTokenClaims, TokenError> {
        let (payload, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let signature = STANDARD.decode(signature).map_err(|_| TokenError::Malformed)?;
        self.mac(payload.as_bytes())
            .verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;
        let claims: CallTokenClaims = STANDARD
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or(TokenError::Malformed)?;
        if claims.expire <= now {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    fn mac(&self, data: &[u8]) -> HmacSha256 {
        let mut mac = self.key.clone();
        mac.update(data);
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies() {
        let issuer = CallTokenIssuer::new("1234", "s3cret", 3600).unwrap();
        let token = issuer.issue("alice", 1_700_000_000).unwrap();
        let claims = issuer.verify(&token, 1_700_000_100).unwrap();
        assert_eq!(claims.user_id, "alice");
        assert_eq!(claims.app_id, "1234");
        assert_eq!(claims.expire, 1_700_003_600);
        assert_eq!(claims.nonce.len(), 16);
    }

    #[test]
    fn nonces_differ() {
        let issuer = CallTokenIssuer::new("1234", "s3cret", 60).unwrap();
        assert_ne!(issuer.issue("alice", 0).unwrap(), issuer.issue("alice", 0).unwrap());
    }

    #[test]
    fn rejects_expired_forged_and_garbage() {
        let issuer = CallTokenIssuer::new("1234", "s3cret", 60).unwrap();
        let token = issuer.issue("alice", 1_000).unwrap();
        assert_eq!(issuer.verify(&token, 1_060), Err(TokenError::Expired));

        let other = CallTokenIssuer::new("1234", "other", 60).unwrap();
        assert_eq!(other.verify(&token, 1_001), Err(TokenError::BadSignature));

        assert_eq!(issuer.verify("no-dot", 0), Err(TokenError::Malformed));
    }
}
