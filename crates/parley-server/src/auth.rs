//! Credential verification for REST requests and relay connections.
//!
//! Session tokens are Ed25519-signed [`SessionToken`]s issued by this
//! server (see `/admin/tokens`). Handlers receive the verified principal
//! through the [`Principal`] extractor.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use parley_shared::constants::MAX_TOKEN_TTL_SECS;
use parley_shared::token::{signing_key_from_hex, SessionToken};
use parley_shared::types::UserId;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::error::ServerError;

/// Turns an opaque credential into a principal id.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<UserId, ServerError>;
}

/// Issues and verifies session tokens with one signing key.
pub struct TokenAuthority {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    ttl: Duration,
}

impl TokenAuthority {
    /// `ttl_secs` is capped at [`MAX_TOKEN_TTL_SECS`].
    pub fn new(signing_key: SigningKey, ttl_secs: i64) -> Self {
        Self {
            verifying_key: signing_key.verifying_key(),
            signing_key,
            ttl: Duration::seconds(ttl_secs.clamp(-MAX_TOKEN_TTL_SECS, MAX_TOKEN_TTL_SECS)),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, ServerError> {
        let signing_key = match &config.token_signing_key {
            Some(hex_seed) => signing_key_from_hex(hex_seed)
                .map_err(|e| ServerError::Internal(format!("TOKEN_SIGNING_KEY: {e}")))?,
            None => {
                warn!("TOKEN_SIGNING_KEY not set, tokens will not survive a restart");
                SigningKey::generate(&mut OsRng)
            }
        };

        let authority = Self::new(signing_key, config.token_ttl_secs);
        info!(
            key = hex::encode(authority.verifying_key.to_bytes()),
            ttl_secs = config.token_ttl_secs,
            "Session token authority ready"
        );
        Ok(authority)
    }

    /// Issue an encoded token for `principal`.
    pub fn issue(&self, principal: UserId) -> String {
        let valid_until = Utc::now()
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        SessionToken::issue(principal, valid_until, &self.signing_key).encode()
    }
}

impl CredentialVerifier for TokenAuthority {
    fn verify(&self, credential: &str) -> Result<UserId, ServerError> {
        if credential.trim().is_empty() {
            return Err(ServerError::Authentication("missing credential".into()));
        }
        SessionToken::decode(credential)
            .and_then(|token| token.verify(&self.verifying_key))
            .map_err(|e| ServerError::Authentication(e.to_string()))
    }
}

/// The authenticated principal of a REST request.
#[derive(Debug, Clone, Copy)]
pub struct Principal(pub UserId);

#[axum::async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ServerError::Authentication("missing bearer token".into()))?;
        state.verifier.verify(token).map(Principal)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let token = bearer_token(headers).unwrap_or("");

    // Constant-time comparison to prevent timing attacks on admin token.
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn authority() -> TokenAuthority {
        TokenAuthority::new(SigningKey::generate(&mut OsRng), 3600)
    }

    #[test]
    fn test_issued_token_verifies() {
        let auth = authority();
        let user = UserId::new();
        assert_eq!(auth.verify(&auth.issue(user)).unwrap(), user);
    }

    #[test]
    fn test_foreign_token_is_rejected() {
        let auth = authority();
        let other = authority();
        let token = other.issue(UserId::new());
        assert!(matches!(
            auth.verify(&token),
            Err(ServerError::Authentication(_))
        ));
        assert!(matches!(
            auth.verify(""),
            Err(ServerError::Authentication(_))
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let auth = TokenAuthority::new(SigningKey::generate(&mut OsRng), -10);
        assert!(auth.verify(&auth.issue(UserId::new())).is_err());
    }

    #[test]
    fn test_oversized_ttl_is_capped() {
        let auth = TokenAuthority::new(SigningKey::generate(&mut OsRng), 1_000_000_000_000_000);
        assert_eq!(auth.ttl, Duration::seconds(MAX_TOKEN_TTL_SECS));
        let user = UserId::new();
        assert_eq!(auth.verify(&auth.issue(user)).unwrap(), user);
    }

    #[test]
    fn test_admin_token_check() {
        let config = ServerConfig {
            admin_token: Some("s3cret".into()),
            ..Default::default()
        };
        let mut headers = HeaderMap::new();
        assert!(verify_admin_token(&headers, &config).is_err());

        headers.insert("authorization", HeaderValue::from_static("Bearer s3cret"));
        assert!(verify_admin_token(&headers, &config).is_ok());

        headers.insert("authorization", HeaderValue::from_static("Bearer s3cres"));
        assert!(verify_admin_token(&headers, &config).is_err());

        let disabled = ServerConfig::default();
        assert!(verify_admin_token(&headers, &disabled).is_err());
    }
}
