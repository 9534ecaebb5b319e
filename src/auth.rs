use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64, Engine as _};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::ChatError;

type HmacSha256 = Hmac<Sha256>;

/// Who is on the other end of a connection once the token checked out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub label: String,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    exp: i64,
}

/// Signs and checks the bearer tokens handed out by the web backend.
///
/// Format: `base64url(claims json) "." base64url(hmac-sha256(secret, payload))`.
pub struct TokenAuthority {
    secret: Vec<u8>,
}

impl TokenAuthority {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        TokenAuthority {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, ChatError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| ChatError::Config("token secret is unusable".to_string()))
    }

    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String, ChatError> {
        let claims = Claims {
            sub: identity.user_id.clone(),
            email: identity.label.clone(),
            exp: (Utc::now() + ttl).timestamp(),
        };
        let payload = B64.encode(serde_json::to_vec(&claims)?);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = B64.encode(mac.finalize().into_bytes());

        Ok(format!("{payload}.{signature}"))
    }

    pub fn verify(&self, token: &str) -> Result<Identity, ChatError> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| ChatError::Authentication("malformed token".to_string()))?;
        let signature = B64
            .decode(signature)
            .map_err(|_| ChatError::Authentication("malformed token signature".to_string()))?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ChatError::Authentication("invalid token signature".to_string()))?;

        let raw = B64
            .decode(payload)
            .map_err(|_| ChatError::Authentication("malformed token payload".to_string()))?;
        let claims: Claims = serde_json::from_slice(&raw)
            .map_err(|_| ChatError::Authentication("malformed token claims".to_string()))?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(ChatError::Authentication("token has expired".to_string()));
        }
        if claims.sub.is_empty() {
            return Err(ChatError::Authentication("token has no subject".to_string()));
        }

        Ok(Identity {
            user_id: claims.sub,
            label: claims.email,
        })
    }

    /// Accepts either an `Authorization: Bearer ...` header value or a raw
    /// `?token=` query value, header first.
    pub fn authenticate(
        &self,
        header: Option<&str>,
        query_token: Option<&str>,
    ) -> Result<Identity, ChatError> {
        let token = match header {
            Some(value) => value
                .strip_prefix("Bearer ")
                .ok_or_else(|| ChatError::Authentication("expected a Bearer token".to_string()))?,
            None => query_token
                .ok_or_else(|| ChatError::Authentication("missing credentials".to_string()))?,
        };
        self.verify(token.trim())
    }
}
