use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::types::UserId;

// Session credential signed by the server, presented on REST and relay connect
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub principal: UserId,
    pub valid_until: DateTime<Utc>,
    pub signature: Vec<u8>,
}

fn signed_payload(principal: &UserId, valid_until: &DateTime<Utc>) -> Vec<u8> {
    // payload = principal uuid bytes || valid_until (rfc3339)
    let mut payload = Vec::new();
    payload.extend_from_slice(principal.0.as_bytes());
    payload.extend_from_slice(valid_until.to_rfc3339().as_bytes());
    payload
}

impl SessionToken {
    pub fn issue(principal: UserId, valid_until: DateTime<Utc>, key: &SigningKey) -> Self {
        let signature = key.sign(&signed_payload(&principal, &valid_until));
        Self {
            principal,
            valid_until,
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Check expiry and signature, returning the authenticated principal.
    pub fn verify(&self, key: &VerifyingKey) -> Result<UserId, TokenError> {
        self.verify_at(key, Utc::now())
    }

    pub fn verify_at(&self, key: &VerifyingKey, now: DateTime<Utc>) -> Result<UserId, TokenError> {
        if now > self.valid_until {
            return Err(TokenError::Expired);
        }

        let signature =
            Signature::from_slice(&self.signature).map_err(|_| TokenError::BadSignature)?;
        key.verify(&signed_payload(&self.principal, &self.valid_until), &signature)
            .map_err(|_| TokenError::BadSignature)?;

        Ok(self.principal)
    }

    /// Compact transport form: base64url (unpadded) of the JSON encoding.
    pub fn encode(&self) -> String {
        // Serializing a struct of plain fields cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(text: &str) -> Result<Self, TokenError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|_| TokenError::Malformed)?;
        serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)
    }
}

/// Parse a hex-encoded 32-byte ed25519 seed.
pub fn signing_key_from_hex(hex_seed: &str) -> Result<SigningKey, TokenError> {
    let bytes = hex::decode(hex_seed.trim()).map_err(|_| TokenError::InvalidKey)?;
    let seed: [u8; 32] = bytes.try_into().map_err(|_| TokenError::InvalidKey)?;
    Ok(SigningKey::from_bytes(&seed))
}
