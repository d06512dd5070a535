//! Token claims and principal resolution.
//!
//! Two paths read claims. [`peek_claims`] decodes the payload segment
//! without any verification and is only used to derive a display identity
//! after the transport boundary has already allowed the connection.
//! Verified claims come out of [`crate::Authorizer::verify`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Identity used when no principal can be derived from a token.
pub const ANONYMOUS: &str = "anonymous";

/// Raw claims carried in a token payload.
///
/// Every field is optional so that lenient parsing never fails on a
/// missing claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject.
    #[serde(default)]
    pub sub: Option<String>,
    /// Username claim emitted by the identity provider.
    #[serde(rename = "cognito:username", default)]
    pub provider_username: Option<String>,
    /// Plain username claim.
    #[serde(default)]
    pub username: Option<String>,
    /// Email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Expiry, seconds since the epoch.
    #[serde(default)]
    pub exp: Option<u64>,
    /// Declared token use (`id` or `access`).
    #[serde(default)]
    pub token_use: Option<String>,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
}

impl TokenClaims {
    /// Resolve the principal: a username claim first, then email.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        [&self.provider_username, &self.username, &self.email]
            .into_iter()
            .filter_map(|claim| claim.as_deref())
            .find(|value| !value.is_empty())
    }
}

/// Accepted token uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    /// Identity token.
    Id,
    /// Access token.
    Access,
}

impl TokenUse {
    /// Parse a `token_use` claim value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "id" => Some(TokenUse::Id),
            "access" => Some(TokenUse::Access),
            _ => None,
        }
    }
}

/// Claims of a token that passed verification.
///
/// Only valid for the authorization check that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Resolved principal identifier.
    pub principal: String,
    /// Subject, if present.
    pub subject: Option<String>,
    /// Email, if present.
    pub email: Option<String>,
    /// Expiry, seconds since the epoch.
    pub expires_at: u64,
    /// Declared token use.
    pub token_use: TokenUse,
    /// Id of the key that signed the token.
    pub key_id: String,
}

impl Claims {
    pub(crate) fn from_verified(claims: TokenClaims, token_use: TokenUse, key_id: String) -> Self {
        let principal = claims
            .principal()
            .map(str::to_string)
            .or_else(|| claims.sub.clone())
            .unwrap_or_else(|| ANONYMOUS.to_string());

        Self {
            principal,
            subject: claims.sub,
            email: claims.email,
            expires_at: claims.exp.unwrap_or_default(),
            token_use,
            key_id,
        }
    }
}

/// Decode a token's payload segment without verifying anything.
///
/// Returns `None` if the token has no payload segment or the segment is
/// not base64url-encoded JSON.
#[must_use]
pub fn peek_claims(token: &str) -> Option<TokenClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Derive a display identity from an optional token.
///
/// Falls back to [`ANONYMOUS`] when the token is absent, unparseable, or
/// carries neither a username nor an email claim.
#[must_use]
pub fn display_identity(token: Option<&str>) -> String {
    token
        .and_then(peek_claims)
        .and_then(|claims| claims.principal().map(str::to_string))
        .unwrap_or_else(|| ANONYMOUS.to_string())
}
