//! Signed join credentials for the media room.
//!
//! A token is `base64url(claims_json) "." base64url(hmac_sha256(secret, claims_b64))`.
//! The participant identity is derived from the session id only, so every
//! credential minted for a session names the same participant and the media
//! server replaces a stale connection instead of adding a second member.

use anketa_core::{current_unix_timestamp, is_expired_unix};
use anketa_types::JoinCredential;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential secret must not be empty")]
    EmptySecret,
    #[error("credential ttl must be greater than zero")]
    ZeroTtl,
    #[error("credential secret cannot initialize the signer")]
    InvalidKey,
    #[error("join token is malformed: {0}")]
    Malformed(String),
    #[error("join token signature verification failed")]
    InvalidSignature,
    #[error("join token expired at {expires_unix}")]
    Expired { expires_unix: u64 },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Claims carried inside a join token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinClaims {
    /// Session id the credential was minted for.
    pub sid: String,
    pub room: String,
    /// Participant identity.
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

/// Mints and verifies join credentials with one shared secret.
#[derive(Clone)]
pub struct JoinCredentialIssuer {
    secret: Vec<u8>,
    media_url: String,
    ttl_seconds: u64,
}

impl std::fmt::Debug for JoinCredentialIssuer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("JoinCredentialIssuer")
            .field("media_url", &self.media_url)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl JoinCredentialIssuer {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        media_url: impl Into<String>,
        ttl_seconds: u64,
    ) -> Result<Self, CredentialError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(CredentialError::EmptySecret);
        }
        if ttl_seconds == 0 {
            return Err(CredentialError::ZeroTtl);
        }
        Ok(Self {
            secret,
            media_url: media_url.into(),
            ttl_seconds,
        })
    }

    pub fn media_url(&self) -> &str {
        &self.media_url
    }

    /// Stable participant identity for the client side of `session_id`.
    pub fn participant_identity(session_id: &str) -> String {
        format!("client-{session_id}")
    }

    pub fn issue(&self, session_id: &str, room: &str) -> Result<JoinCredential, CredentialError> {
        self.issue_at(session_id, room, current_unix_timestamp())
    }

    fn issue_at(
        &self,
        session_id: &str,
        room: &str,
        now_unix: u64,
    ) -> Result<JoinCredential, CredentialError> {
        let claims = JoinClaims {
            sid: session_id.to_string(),
            room: room.to_string(),
            sub: Self::participant_identity(session_id),
            iat: now_unix,
            exp: now_unix.saturating_add(self.ttl_seconds),
        };
        let payload = BASE64_URL.encode(serde_json::to_vec(&claims)?);
        let signature = BASE64_URL.encode(self.sign(payload.as_bytes())?);
        Ok(JoinCredential {
            session_id: claims.sid,
            room: claims.room,
            identity: claims.sub,
            server_url: self.media_url.clone(),
            token: format!("{payload}.{signature}"),
            expires_unix: claims.exp,
        })
    }

    /// Checks the signature and expiry of `token` and returns its claims.
    pub fn verify(&self, token: &str) -> Result<JoinClaims, CredentialError> {
        self.verify_at(token, current_unix_timestamp())
    }

    fn verify_at(&self, token: &str, now_unix: u64) -> Result<JoinClaims, CredentialError> {
        let Some((payload, signature)) = token.split_once('.') else {
            return Err(CredentialError::Malformed("missing signature segment".to_string()));
        };
        let signature = BASE64_URL
            .decode(signature)
            .map_err(|error| CredentialError::Malformed(format!("signature: {error}")))?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CredentialError::InvalidSignature)?;

        let raw = BASE64_URL
            .decode(payload)
            .map_err(|error| CredentialError::Malformed(format!("claims: {error}")))?;
        let claims = serde_json::from_slice::<JoinClaims>(&raw)?;
        if is_expired_unix(Some(claims.exp), now_unix) {
            return Err(CredentialError::Expired {
                expires_unix: claims.exp,
            });
        }
        Ok(claims)
    }

    fn mac(&self) -> Result<HmacSha256, CredentialError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| CredentialError::InvalidKey)
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
